/*
 * Copyright (C) 2025 The Stratovol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Volume-plugin protocol handlers: thin JSON translation between the
//! runtime's POST endpoints and the orchestrator.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::stratovol::logger::log_error;
use crate::stratovol::util::error::is_not_found_error;
use crate::stratovol::volume::orchestrator::VolumeInfo;
use crate::stratovol::volume::MountOrchestrator;

const COMPONENT: &str = "server.handlers";

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(default, rename = "Opts")]
    pub opts: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct MountRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(default, rename = "ID")]
    pub id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    #[serde(rename = "Err")]
    err: String,
}

#[derive(Debug, Serialize)]
struct EmptyResponse {}

#[derive(Debug, Serialize)]
struct ActivateResponse {
    #[serde(rename = "Implements")]
    implements: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct MountResponse {
    #[serde(rename = "Mountpoint")]
    mountpoint: String,
}

#[derive(Debug, Serialize)]
struct VolumeBody {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Mountpoint")]
    mountpoint: String,
    #[serde(rename = "CreatedAt")]
    created_at: String,
}

#[derive(Debug, Serialize)]
struct GetResponse {
    #[serde(rename = "Volume")]
    volume: VolumeBody,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    #[serde(rename = "Volumes")]
    volumes: Vec<VolumeBody>,
}

#[derive(Debug, Serialize)]
struct CapabilitiesResponse {
    #[serde(rename = "Capabilities")]
    capabilities: Capability,
}

#[derive(Debug, Serialize)]
struct Capability {
    #[serde(rename = "Scope")]
    scope: &'static str,
}

impl From<VolumeInfo> for VolumeBody {
    fn from(info: VolumeInfo) -> Self {
        VolumeBody {
            name: info.name,
            mountpoint: info.mountpoint,
            created_at: info.created_at,
        }
    }
}

fn error_response(action: &str, err: Box<dyn Error + Send + Sync>) -> Response {
    log_error(
        COMPONENT,
        "Request failed",
        &[("action", action), ("error", &err.to_string())],
    );
    let status = if is_not_found_error(err.as_ref()) {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorResponse {
            err: err.to_string(),
        }),
    )
        .into_response()
}

pub fn router(orchestrator: Arc<MountOrchestrator>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .with_state(orchestrator)
}

async fn activate() -> Json<ActivateResponse> {
    Json(ActivateResponse {
        implements: vec!["VolumeDriver"],
    })
}

async fn create(
    State(orchestrator): State<Arc<MountOrchestrator>>,
    Json(request): Json<CreateRequest>,
) -> Response {
    let opts = request.opts.unwrap_or_default();
    match orchestrator.create(&request.name, &opts).await {
        Ok(()) => Json(EmptyResponse {}).into_response(),
        Err(err) => error_response("create", err),
    }
}

async fn get(
    State(orchestrator): State<Arc<MountOrchestrator>>,
    Json(request): Json<NameRequest>,
) -> Response {
    match orchestrator.get(&request.name).await {
        Ok(info) => Json(GetResponse {
            volume: info.into(),
        })
        .into_response(),
        Err(err) => error_response("get", err),
    }
}

async fn list(State(orchestrator): State<Arc<MountOrchestrator>>) -> Response {
    match orchestrator.list().await {
        Ok(volumes) => Json(ListResponse {
            volumes: volumes.into_iter().map(VolumeBody::from).collect(),
        })
        .into_response(),
        Err(err) => error_response("list", err),
    }
}

async fn mount(
    State(orchestrator): State<Arc<MountOrchestrator>>,
    Json(request): Json<MountRequest>,
) -> Response {
    match orchestrator.mount(&request.name).await {
        Ok(mountpoint) => Json(MountResponse {
            mountpoint: mountpoint.display().to_string(),
        })
        .into_response(),
        Err(err) => error_response("mount", err),
    }
}

async fn unmount(
    State(orchestrator): State<Arc<MountOrchestrator>>,
    Json(request): Json<MountRequest>,
) -> Response {
    match orchestrator.unmount(&request.name).await {
        Ok(()) => Json(EmptyResponse {}).into_response(),
        Err(err) => error_response("unmount", err),
    }
}

async fn remove(
    State(orchestrator): State<Arc<MountOrchestrator>>,
    Json(request): Json<NameRequest>,
) -> Response {
    match orchestrator.remove(&request.name).await {
        Ok(()) => Json(EmptyResponse {}).into_response(),
        Err(err) => error_response("remove", err),
    }
}

async fn path(
    State(orchestrator): State<Arc<MountOrchestrator>>,
    Json(request): Json<NameRequest>,
) -> Response {
    Json(MountResponse {
        mountpoint: orchestrator.path(&request.name).display().to_string(),
    })
    .into_response()
}

async fn capabilities() -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        capabilities: Capability { scope: "global" },
    })
}
