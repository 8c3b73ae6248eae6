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

//! CRUD against the remote volume resource.

use std::error::Error;
use std::sync::Arc;

use super::attach::AttachmentController;
use crate::stratovol::cloud::types::Volume;
use crate::stratovol::cloud::CloudClient;
use crate::stratovol::logger::log_debug;
use crate::stratovol::util::error::{new_error, not_found, with_context};
use crate::stratovol::Config;

type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const COMPONENT: &str = "volume.lifecycle";

pub struct VolumeLifecycleManager {
    config: Arc<Config>,
    cloud: Arc<dyn CloudClient>,
    attachments: AttachmentController,
}

impl VolumeLifecycleManager {
    pub fn new(
        config: Arc<Config>,
        cloud: Arc<dyn CloudClient>,
        attachments: AttachmentController,
    ) -> Self {
        Self {
            config,
            cloud,
            attachments,
        }
    }

    /// Creates a remote volume. Size and type default from configuration;
    /// the size must parse as a positive integer before any remote call is
    /// issued.
    pub async fn create(
        &self,
        name: &str,
        size_option: Option<&str>,
        type_option: Option<&str>,
    ) -> DynResult<Volume> {
        let size_raw = size_option.unwrap_or(&self.config.default_size);
        let size: u64 = size_raw
            .trim()
            .parse()
            .ok()
            .filter(|parsed| *parsed > 0)
            .ok_or_else(|| {
                new_error(format!(
                    "Invalid volume size '{}': must be a positive integer",
                    size_raw
                ))
            })?;
        let volume_type = type_option.unwrap_or(&self.config.default_type);

        let volume = self
            .cloud
            .create_volume(name, size, volume_type)
            .await
            .map_err(|e| with_context(e, format!("Failed to create volume {}", name)))?;

        log_debug(
            COMPONENT,
            "Volume created",
            &[("volume", name), ("id", &volume.id)],
        );
        Ok(volume)
    }

    /// Resolves a volume by name. With duplicate names only the first
    /// match is returned; uniqueness is not enforced at this layer.
    pub async fn find_by_name(&self, name: &str) -> DynResult<Volume> {
        let volumes = self
            .cloud
            .list_volumes(Some(name))
            .await
            .map_err(|e| with_context(e, format!("Failed to look up volume {}", name)))?;

        volumes
            .into_iter()
            .find(|volume| volume.name == name)
            .ok_or_else(|| not_found(format!("Volume '{}' not found", name)))
    }

    /// Lists volumes, skipping unnamed ones: they cannot be addressed
    /// through this daemon.
    pub async fn list(&self) -> DynResult<Vec<Volume>> {
        let volumes = self
            .cloud
            .list_volumes(None)
            .await
            .map_err(|e| with_context(e, "Failed to list volumes"))?;
        Ok(volumes
            .into_iter()
            .filter(|volume| !volume.name.is_empty())
            .collect())
    }

    /// Deletes a volume, detaching it first when attachments exist.
    pub async fn remove(&self, volume: Volume) -> DynResult<()> {
        let volume = if volume.attachments.is_empty() {
            volume
        } else {
            log_debug(
                COMPONENT,
                "Volume still attached, detaching first",
                &[("volume", &volume.name)],
            );
            self.attachments.detach(volume).await?
        };

        self.cloud
            .delete_volume(&volume.id)
            .await
            .map_err(|e| with_context(e, format!("Failed to delete volume {}", volume.name)))?;

        log_debug(COMPONENT, "Volume deleted", &[("volume", &volume.name)]);
        Ok(())
    }
}
