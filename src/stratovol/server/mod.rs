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

//! Volume-plugin endpoint on a Unix domain socket.

pub mod handlers;

use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;

use crate::stratovol::logger::log_info;
use crate::stratovol::util::error::with_context;
use crate::stratovol::volume::MountOrchestrator;

const COMPONENT: &str = "server";

pub async fn serve(
    orchestrator: Arc<MountOrchestrator>,
    socket_path: &Path,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            with_context(
                e,
                format!("Failed to create socket directory {}", parent.display()),
            )
        })?;
    }

    // A socket file left over from a previous run blocks the bind.
    match fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to remove stale socket {}", socket_path.display()),
            ))
        }
    }

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        with_context(
            e,
            format!("Failed to bind plugin socket {}", socket_path.display()),
        )
    })?;

    log_info(
        COMPONENT,
        "Listening on plugin socket",
        &[("path", &socket_path.display().to_string())],
    );

    let app = handlers::router(orchestrator);
    axum::serve(listener, app)
        .await
        .map_err(|e| with_context(e, "Plugin server failed"))
}
