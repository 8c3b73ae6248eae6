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

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::stratovol::util::error::{new_error, with_context};

/// Process-wide configuration. Built once at startup from the JSON file and
/// CLI overrides, then shared read-only behind an `Arc`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity service endpoint used for token authentication.
    #[serde(rename = "endpoint")]
    pub identity_endpoint: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "domainName")]
    pub domain_name: String,
    #[serde(rename = "projectName")]
    pub project_name: String,
    #[serde(rename = "applicationCredentialId")]
    pub application_credential_id: String,
    #[serde(rename = "applicationCredentialSecret")]
    pub application_credential_secret: String,
    pub region: String,
    #[serde(rename = "blockStorageEndpoint")]
    pub block_storage_endpoint: String,
    #[serde(rename = "computeEndpoint")]
    pub compute_endpoint: String,

    /// Compute instance this host corresponds to. Empty means "discover".
    #[serde(rename = "machineID")]
    pub machine_id: String,

    #[serde(rename = "mountDir")]
    pub mount_dir: String,
    /// Directory scanned for freshly attached block device nodes.
    #[serde(rename = "deviceDir")]
    pub device_dir: String,
    pub filesystem: String,
    #[serde(rename = "defaultSize")]
    pub default_size: String,
    #[serde(rename = "defaultType")]
    pub default_type: String,
    /// Key material for LUKS volumes. Empty disables encryption support.
    #[serde(rename = "luksKeyFile")]
    pub luks_key_file: String,
    /// Sub-directory created inside every freshly formatted volume; the
    /// path handed back to the runtime points at it.
    #[serde(rename = "volumeSubdir")]
    pub volume_subdir: String,
    #[serde(rename = "socketPath")]
    pub socket_path: String,

    #[serde(rename = "stateTimeoutSecs")]
    pub state_timeout_secs: u64,
    #[serde(rename = "stateIntervalMs")]
    pub state_interval_ms: u64,
    #[serde(rename = "stateSettleSecs")]
    pub state_settle_secs: u64,
    #[serde(rename = "deviceTimeoutSecs")]
    pub device_timeout_secs: u64,
    #[serde(rename = "deviceSettleSecs")]
    pub device_settle_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            domain_name: String::new(),
            project_name: String::new(),
            application_credential_id: String::new(),
            application_credential_secret: String::new(),
            region: String::new(),
            block_storage_endpoint: String::new(),
            compute_endpoint: String::new(),
            machine_id: String::new(),
            mount_dir: String::new(),
            device_dir: "/dev/disk/by-id".to_string(),
            filesystem: "ext4".to_string(),
            default_size: "10".to_string(),
            default_type: "classic".to_string(),
            luks_key_file: String::new(),
            volume_subdir: "data".to_string(),
            socket_path: "/run/docker/plugins/stratovol.sock".to_string(),
            state_timeout_secs: 60,
            state_interval_ms: 500,
            state_settle_secs: 0,
            device_timeout_secs: 60,
            device_settle_secs: 3,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Box<dyn Error + Send + Sync>> {
        let contents = fs::read_to_string(path).map_err(|e| {
            with_context(e, format!("Failed to read config file {}", path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            with_context(e, format!("Failed to parse config file {}", path.display()))
        })
    }

    /// Startup validation; anything failing here is fatal.
    pub fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.mount_dir.is_empty() {
            return Err(new_error("No mountDir configured"));
        }
        if self.identity_endpoint.is_empty() {
            return Err(new_error("Identity endpoint missing"));
        }
        if self.block_storage_endpoint.is_empty() {
            return Err(new_error("Block storage endpoint missing"));
        }
        if self.compute_endpoint.is_empty() {
            return Err(new_error("Compute endpoint missing"));
        }
        Ok(())
    }

    /// Directory a volume gets mounted on.
    pub fn mount_point(&self, name: &str) -> PathBuf {
        Path::new(&self.mount_dir).join(name)
    }

    /// Path handed to the container runtime: the data sub-directory inside
    /// the mount point. Reconstructed from configuration alone, never
    /// checked for existence.
    pub fn volume_path(&self, name: &str) -> PathBuf {
        self.mount_point(name).join(&self.volume_subdir)
    }

    pub fn luks_key_file(&self) -> Option<&Path> {
        if self.luks_key_file.is_empty() {
            None
        } else {
            Some(Path::new(&self.luks_key_file))
        }
    }

    pub fn state_interval(&self) -> Duration {
        Duration::from_millis(self.state_interval_ms.max(1))
    }

    /// Number of poll attempts the state timeout allows at the configured
    /// interval, never less than one.
    pub fn state_attempts(&self) -> u32 {
        let timeout_ms = self.state_timeout_secs.saturating_mul(1000);
        (timeout_ms / self.state_interval_ms.max(1)).max(1) as u32
    }
}
