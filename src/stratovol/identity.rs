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

//! Resolution of the compute instance this daemon runs on. Configuration
//! wins; otherwise `/etc/machine-id` is tried, and as a last resort the
//! hostname is matched against the compute server listing, which must
//! yield exactly one server.

use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::stratovol::cloud::CloudClient;
use crate::stratovol::logger::{log_debug, log_info, log_warn};
use crate::stratovol::util::error::{new_error, with_context};

type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const COMPONENT: &str = "identity";
const MACHINE_ID_FILE: &str = "/etc/machine-id";

pub async fn resolve_machine_id(
    configured: &str,
    cloud: &Arc<dyn CloudClient>,
) -> DynResult<String> {
    if !configured.is_empty() {
        log_debug(
            COMPONENT,
            "Using configured machine ID",
            &[("id", configured)],
        );
        return Ok(configured.to_string());
    }

    match machine_id_from_file(Path::new(MACHINE_ID_FILE)) {
        Ok(id) => {
            log_info(COMPONENT, "Machine ID detected", &[("id", &id)]);
            return Ok(id);
        }
        Err(err) => log_warn(
            COMPONENT,
            "Machine ID file unusable, discovering by hostname",
            &[("error", &err.to_string())],
        ),
    }

    let hostname = nix::unistd::gethostname()
        .map_err(|e| with_context(e, "Failed to read hostname"))?
        .to_string_lossy()
        .to_string();
    discover_by_hostname(&hostname, cloud).await
}

/// Matches the hostname against the compute listing. Anything other than
/// exactly one match is fatal: guessing the wrong instance would attach
/// volumes to someone else's machine.
pub async fn discover_by_hostname(
    hostname: &str,
    cloud: &Arc<dyn CloudClient>,
) -> DynResult<String> {
    let servers = cloud
        .list_servers(Some(hostname))
        .await
        .map_err(|e| with_context(e, "Failed to list compute servers"))?;

    let mut matches: Vec<_> = servers
        .into_iter()
        .filter(|server| server.name == hostname)
        .collect();

    match matches.len() {
        1 => {
            let server = matches.remove(0);
            log_info(
                COMPONENT,
                "Machine discovered by hostname",
                &[("hostname", hostname), ("id", &server.id)],
            );
            Ok(server.id)
        }
        count => Err(new_error(format!(
            "Machine discovery for hostname '{}' matched {} servers, expected exactly one",
            hostname, count
        ))),
    }
}

pub fn machine_id_from_file(path: &Path) -> DynResult<String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| with_context(e, format!("Failed to read {}", path.display())))?;
    let id = Uuid::parse_str(raw.trim())
        .map_err(|e| with_context(e, format!("Failed to parse machine ID from {}", path.display())))?;
    Ok(id.to_string())
}
