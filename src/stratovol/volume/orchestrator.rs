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

//! Top-level volume state machine behind the plugin protocol. One
//! Mount→Unmount cycle walks: Detached → Attaching → Attached(physical) →
//! [LuksOpen → Mapped] → FormatCheck → Mounted → Unmounting → [LuksClose] →
//! Detaching → Detached.
//!
//! Create, Mount and Unmount serialize per volume name; Get, List and
//! Remove run unsynchronized. A Mount that fails after the attach leaves
//! the volume attached: the next Mount finds it attached and recovers, and
//! adding rollback here would turn one failure mode into two.

use std::collections::HashMap;
use std::error::Error;
use std::fs::DirBuilder;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use nix::mount::umount;
use nix::unistd::{chown, Gid, Uid};
use tokio::time::sleep;

use super::attach::AttachmentController;
use super::lifecycle::VolumeLifecycleManager;
use crate::stratovol::cloud::types::Volume;
use crate::stratovol::cloud::CloudClient;
use crate::stratovol::crypt::luks::{self, EncryptionState};
use crate::stratovol::device::probe;
use crate::stratovol::logger::{log_debug, log_info, log_warn};
use crate::stratovol::util::error::{new_error, with_context};
use crate::stratovol::util::namedlock::NamedLocks;
use crate::stratovol::Config;

type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const COMPONENT: &str = "volume.orchestrator";

const MOUNT_DIR_ATTEMPTS: u32 = 3;
const MOUNT_DIR_MODE: u32 = 0o700;
const VOLUME_SUBDIR_MODE: u32 = 0o777;

/// Externally visible volume metadata for Get/List responses.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: String,
    pub created_at: String,
}

pub struct MountOrchestrator {
    config: Arc<Config>,
    lifecycle: VolumeLifecycleManager,
    attachments: AttachmentController,
    locks: NamedLocks,
}

impl MountOrchestrator {
    pub fn new(config: Arc<Config>, cloud: Arc<dyn CloudClient>) -> Self {
        let attachments = AttachmentController::new(config.clone(), cloud.clone());
        let lifecycle = VolumeLifecycleManager::new(config.clone(), cloud, attachments.clone());
        Self {
            config,
            lifecycle,
            attachments,
            locks: NamedLocks::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a remote volume. When encryption is requested and a key
    /// file is configured, the fresh volume is attached once, LUKS is
    /// stamped onto the still-empty device, and the volume is detached
    /// again: the container must exist before any filesystem does.
    pub async fn create(&self, name: &str, options: &HashMap<String, String>) -> DynResult<()> {
        let _guard = self.locks.lock(name).await;
        log_info(COMPONENT, "Creating volume", &[("volume", name)]);

        let size = options.get("size").map(String::as_str);
        let volume_type = options.get("type").map(String::as_str);

        let mut encrypt = encryption_requested(options);
        if encrypt && self.config.luks_key_file().is_none() {
            log_warn(
                COMPONENT,
                "Encryption requested but no key file is configured, creating unencrypted",
                &[("volume", name)],
            );
            encrypt = false;
        }

        let volume = self.lifecycle.create(name, size, volume_type).await?;

        if encrypt {
            if let Some(key_file) = self.config.luks_key_file() {
                let (volume, device) = self.attachments.attach(volume).await?;
                let device_str = device.display().to_string();
                log_debug(
                    COMPONENT,
                    "Initializing encryption",
                    &[("volume", name), ("dev", &device_str)],
                );
                luks::initialize(&device_str, key_file)?;
                self.attachments.detach(volume).await?;
            }
        }

        Ok(())
    }

    /// Attaches, optionally opens encryption, formats when empty, and
    /// mounts the named volume. Returns the path handed to the runtime.
    pub async fn mount(&self, name: &str) -> DynResult<PathBuf> {
        let _guard = self.locks.lock(name).await;
        log_info(COMPONENT, "Mounting volume", &[("volume", name)]);

        let volume = self.lifecycle.find_by_name(name).await?;
        let (_volume, device) = self.attachments.attach(volume).await?;
        let physical = device.display().to_string();

        // The effective device is the mapper device for encrypted volumes
        // and the physical device otherwise.
        let mut effective = physical.clone();
        if luks::is_encrypted(&physical)? {
            let key_file = self.config.luks_key_file().ok_or_else(|| {
                new_error(format!(
                    "Volume {} is encrypted but no key file is configured",
                    name
                ))
            })?;
            let mapping_name = luks::open(&physical, key_file, name)?;
            effective = format!("/dev/mapper/{}", mapping_name);
            log_debug(
                COMPONENT,
                "Encrypted volume opened",
                &[("volume", name), ("dev", &effective)],
            );
        }

        let fs_type = probe::filesystem_type(&effective)?;
        let mut newly_formatted = false;
        if fs_type.is_empty() {
            log_debug(COMPONENT, "Volume is empty, formatting", &[("volume", name)]);
            probe::format(&effective, name, &self.config.filesystem)?;
            newly_formatted = true;
        }

        let mount_point = self.config.mount_point(name);
        create_mount_dir(&mount_point, Duration::from_secs(1)).await?;

        let output = Command::new("mount")
            .arg(&effective)
            .arg(&mount_point)
            .output()
            .map_err(|e| with_context(e, format!("Failed to invoke mount for {}", effective)))?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(new_error(combined.trim().to_string()));
        }

        let volume_path = self.config.volume_path(name);
        if newly_formatted {
            self.prepare_volume_subdir(&volume_path)?;
        }

        log_info(
            COMPONENT,
            "Volume mounted",
            &[
                ("volume", name),
                ("path", &volume_path.display().to_string()),
            ],
        );
        Ok(volume_path)
    }

    /// Fresh volumes get a data sub-directory with open permissions and
    /// neutral ownership, so containers can use it under any UID.
    fn prepare_volume_subdir(&self, path: &Path) -> DynResult<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(VOLUME_SUBDIR_MODE)
            .create(path)
            .map_err(|e| {
                with_context(
                    e,
                    format!("Failed to create volume directory {}", path.display()),
                )
            })?;
        let permissions = std::fs::Permissions::from_mode(VOLUME_SUBDIR_MODE);
        std::fs::set_permissions(path, permissions).map_err(|e| {
            with_context(
                e,
                format!("Failed to set permissions on {}", path.display()),
            )
        })?;
        if Uid::effective().is_root() {
            chown(path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0))).map_err(|e| {
                with_context(e, format!("Failed to set ownership on {}", path.display()))
            })?;
        }
        Ok(())
    }

    /// Best-effort idempotent teardown. Encryption state is recovered
    /// before the unmount because the mount-table entry is its only
    /// record. Every failure past that point is logged, never propagated:
    /// a stuck runtime retrying Unmount on a resource nobody can reason
    /// about is worse than a leaked attachment.
    pub async fn unmount(&self, name: &str) -> DynResult<()> {
        let _guard = self.locks.lock(name).await;
        log_info(COMPONENT, "Unmounting volume", &[("volume", name)]);

        let mount_point = self.config.mount_point(name);

        let recovered = match luks::recover_from_mount(&mount_point) {
            Ok(state) => state,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Could not recover encryption state, proceeding unencrypted",
                    &[("volume", name), ("error", &err.to_string())],
                );
                EncryptionState::default()
            }
        };

        let present = match probe::directory_exists(&mount_point) {
            Ok(present) => present,
            Err(err) => {
                // A stat failure on the mount point usually means a broken
                // mount, not a missing one.
                log_warn(
                    COMPONENT,
                    "Mount point stat failed, treating as mounted",
                    &[("volume", name), ("error", &err.to_string())],
                );
                true
            }
        };

        if present {
            if let Err(err) = umount(mount_point.as_path()) {
                log_warn(
                    COMPONENT,
                    "Unmount syscall failed",
                    &[
                        ("path", &mount_point.display().to_string()),
                        ("error", &err.to_string()),
                    ],
                );
            }
        }

        if recovered.is_encrypted() {
            match luks::is_encrypted(&recovered.physical_device) {
                Ok(true) => {
                    if let Err(err) = luks::close(&recovered.mapping_name) {
                        log_warn(
                            COMPONENT,
                            "Closing encrypted mapping failed",
                            &[
                                ("mapping", &recovered.mapping_name),
                                ("error", &err.to_string()),
                            ],
                        );
                    }
                }
                Ok(false) => {}
                Err(err) => log_warn(
                    COMPONENT,
                    "Could not verify device encryption before close",
                    &[
                        ("dev", &recovered.physical_device),
                        ("error", &err.to_string()),
                    ],
                ),
            }
        }

        match self.lifecycle.find_by_name(name).await {
            Ok(volume) => {
                if let Err(err) = self.attachments.detach(volume).await {
                    log_warn(
                        COMPONENT,
                        "Detaching volume failed",
                        &[("volume", name), ("error", &err.to_string())],
                    );
                }
            }
            Err(err) => log_warn(
                COMPONENT,
                "Volume lookup failed during unmount",
                &[("volume", name), ("error", &err.to_string())],
            ),
        }

        Ok(())
    }

    pub async fn get(&self, name: &str) -> DynResult<VolumeInfo> {
        let volume = self.lifecycle.find_by_name(name).await?;
        Ok(self.info_for(&volume))
    }

    pub async fn list(&self) -> DynResult<Vec<VolumeInfo>> {
        let volumes = self.lifecycle.list().await?;
        Ok(volumes.iter().map(|volume| self.info_for(volume)).collect())
    }

    /// The externally visible path, reconstructed from configuration
    /// without checking that anything is mounted there.
    pub fn path(&self, name: &str) -> PathBuf {
        self.config.volume_path(name)
    }

    pub async fn remove(&self, name: &str) -> DynResult<()> {
        log_info(COMPONENT, "Removing volume", &[("volume", name)]);
        let volume = self.lifecycle.find_by_name(name).await?;
        self.lifecycle.remove(volume).await
    }

    fn info_for(&self, volume: &Volume) -> VolumeInfo {
        VolumeInfo {
            name: volume.name.clone(),
            mountpoint: self.config.volume_path(&volume.name).display().to_string(),
            created_at: rfc3339_created_at(&volume.created_at),
        }
    }
}

/// The create `encryption` option enables encryption for any value other
/// than a case-insensitive `"false"`; an absent option leaves it off.
pub fn encryption_requested(options: &HashMap<String, String>) -> bool {
    options
        .get("encryption")
        .map(|value| !value.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

/// Creates the mount-point directory, retrying around the race with a
/// previous unmount's teardown: on failure, sleep with doubling backoff
/// and force an unmount of the path (its result is ignored) before trying
/// again.
pub async fn create_mount_dir(path: &Path, base_delay: Duration) -> DynResult<()> {
    let mut delay = base_delay;
    for _ in 0..MOUNT_DIR_ATTEMPTS {
        match DirBuilder::new()
            .recursive(true)
            .mode(MOUNT_DIR_MODE)
            .create(path)
        {
            Ok(()) => return Ok(()),
            Err(err) => log_warn(
                COMPONENT,
                "Mount directory creation failed, retrying",
                &[
                    ("path", &path.display().to_string()),
                    ("error", &err.to_string()),
                ],
            ),
        }

        sleep(delay).await;
        delay *= 2;

        if let Err(err) = umount(path) {
            log_debug(
                COMPONENT,
                "Unmount during directory retry failed",
                &[
                    ("path", &path.display().to_string()),
                    ("error", &err.to_string()),
                ],
            );
        }
    }

    Err(new_error(format!(
        "Failed creating mount directory {}",
        path.display()
    )))
}

/// Cloud timestamps arrive without a zone marker; reported times are
/// normalized to RFC 3339 UTC, falling back to the raw value.
fn rfc3339_created_at(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true);
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return parsed
            .and_utc()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
    }
    raw.to_string()
}
