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

//! Drives the remote attach/detach state machine. The attachment call
//! itself is fire-and-forget at the API level; completion is only ever
//! observed by polling the volume record and the local device directory.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::stratovol::cloud::types::{Volume, STATUS_AVAILABLE, STATUS_CREATING, STATUS_DETACHING};
use crate::stratovol::cloud::CloudClient;
use crate::stratovol::device::probe;
use crate::stratovol::logger::{log_debug, log_info};
use crate::stratovol::util::error::{new_error, with_context};
use crate::stratovol::util::retry::{poll_until, PollError, PollOutcome};
use crate::stratovol::Config;

type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const COMPONENT: &str = "volume.attach";

/// Device-ID-derived filenames are sometimes truncated by the kernel; only
/// this prefix of the volume ID is matched.
const DEVICE_ID_PREFIX_LEN: usize = 20;

#[derive(Clone)]
pub struct AttachmentController {
    config: Arc<Config>,
    cloud: Arc<dyn CloudClient>,
}

impl AttachmentController {
    pub fn new(config: Arc<Config>, cloud: Arc<dyn CloudClient>) -> Self {
        Self { config, cloud }
    }

    /// Attaches `volume` to this machine and waits for its block device to
    /// appear. Returns the refreshed volume record (now carrying the
    /// attachment) and the local device path.
    ///
    /// A volume still `creating` or `detaching` is waited on first: the
    /// attachment call is never issued against a volume not yet known to
    /// be `available`. An attachment held by another consumer is forcibly
    /// detached, which is destructive for that consumer by design.
    pub async fn attach(&self, volume: Volume) -> DynResult<(Volume, PathBuf)> {
        let mut volume = volume;

        if volume.status == STATUS_CREATING || volume.status == STATUS_DETACHING {
            log_info(
                COMPONENT,
                "Volume not yet available, waiting",
                &[("volume", &volume.name), ("status", &volume.status)],
            );
            volume = self.wait_for_status(volume, STATUS_AVAILABLE).await?;
        }

        volume = self.cloud.get_volume(&volume.id).await?;

        if !volume.attachments.is_empty() {
            log_debug(
                COMPONENT,
                "Volume already attached, detaching first",
                &[("volume", &volume.name)],
            );
            volume = self.detach(volume).await?;
        }

        if volume.status != STATUS_AVAILABLE {
            return Err(new_error(format!(
                "Volume {} is in unexpected state '{}' for attaching",
                volume.name, volume.status
            )));
        }

        log_debug(
            COMPONENT,
            "Attaching volume",
            &[
                ("volume", &volume.name),
                ("machine", &self.config.machine_id),
            ],
        );
        self.cloud
            .create_attachment(&self.config.machine_id, &volume.id)
            .await
            .map_err(|e| with_context(e, format!("Failed to attach volume {}", volume.name)))?;

        let device_id: String = volume.id.chars().take(DEVICE_ID_PREFIX_LEN).collect();
        let device = probe::await_device(
            Path::new(&self.config.device_dir),
            &device_id,
            self.config.device_timeout_secs,
        )
        .await
        .map_err(|e| {
            with_context(
                e,
                format!("Block device for volume {} did not appear", volume.name),
            )
        })?;

        if self.config.device_settle_secs > 0 {
            sleep(Duration::from_secs(self.config.device_settle_secs)).await;
        }

        let volume = self.cloud.get_volume(&volume.id).await?;
        log_debug(
            COMPONENT,
            "Device found",
            &[
                ("volume", &volume.name),
                ("dev", &device.display().to_string()),
            ],
        );

        Ok((volume, device))
    }

    /// Removes every current attachment and waits for the volume to settle
    /// back to `available`. Stops at the first failed removal, so a volume
    /// can be left with some but not all attachments removed.
    pub async fn detach(&self, volume: Volume) -> DynResult<Volume> {
        for attachment in &volume.attachments {
            self.cloud
                .delete_attachment(&attachment.server_id, &attachment.id)
                .await
                .map_err(|e| {
                    with_context(
                        e,
                        format!(
                            "Failed to detach volume {} from server {}",
                            volume.name, attachment.server_id
                        ),
                    )
                })?;
        }

        self.wait_for_status(volume, STATUS_AVAILABLE).await
    }

    /// Polls the volume record until it reaches `target`, returning the
    /// refreshed record. The timeout error reports the final observed
    /// status, which is not necessarily the requested one.
    pub async fn wait_for_status(&self, volume: Volume, target: &str) -> DynResult<Volume> {
        if volume.status == target {
            return Ok(volume);
        }

        let cloud = self.cloud.clone();
        let volume_id = volume.id.clone();
        let result = poll_until(
            self.config.state_interval(),
            self.config.state_attempts(),
            move || {
                let cloud = cloud.clone();
                let volume_id = volume_id.clone();
                let target = target.to_string();
                async move {
                    let current = cloud.get_volume(&volume_id).await?;
                    if current.status == target {
                        Ok(PollOutcome::Ready(current))
                    } else {
                        Ok(PollOutcome::Pending(current.status))
                    }
                }
            },
        )
        .await;

        match result {
            Ok(current) => {
                if self.config.state_settle_secs > 0 {
                    sleep(Duration::from_secs(self.config.state_settle_secs)).await;
                }
                Ok(current)
            }
            Err(PollError::Timeout { last, .. }) => Err(new_error(format!(
                "Volume {} did not become '{}' (last status '{}')",
                volume.name,
                target,
                last.unwrap_or_else(|| volume.status.clone())
            ))),
            Err(PollError::Failed(err)) => Err(err),
        }
    }
}
