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

//! Local block-device primitives: filesystem detection, formatting, and
//! waiting for device nodes to show up. No cloud dependency.

use std::error::Error;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::stratovol::util::error::{new_error, with_context};
use crate::stratovol::util::retry::{poll_until, PollError, PollOutcome};

type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Longest label the supported filesystems accept.
const MAX_LABEL_LEN: usize = 12;

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

/// Detects the filesystem on `device`. An empty result means no recognized
/// filesystem, which is not an error; a probe failure that produced output
/// is an error carrying it.
pub fn filesystem_type(device: &str) -> DynResult<String> {
    let output = Command::new("blkid")
        .args(["-s", "TYPE", "-o", "value", device])
        .output()
        .map_err(|e| with_context(e, format!("Failed to invoke blkid for {}", device)))?;

    if !output.status.success() {
        let combined = combined_output(&output);
        if combined.trim().is_empty() {
            return Ok(String::new());
        }
        return Err(new_error(format!(
            "blkid failed for {}: {}",
            device,
            combined.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn truncate_label(label: &str) -> String {
    label.chars().take(MAX_LABEL_LEN).collect()
}

/// Creates a filesystem on `device`, labeling it with `label` truncated to
/// the label limit.
pub fn format(device: &str, label: &str, fs_type: &str) -> DynResult<()> {
    let formatter = format!("mkfs.{}", fs_type);
    let label = truncate_label(label);

    let output = Command::new(&formatter)
        .args(["-L", &label, device])
        .output()
        .map_err(|e| with_context(e, format!("Failed to invoke {}", formatter)))?;

    if !output.status.success() {
        return Err(new_error(format!(
            "Command '{} -L {} {}' failed: {}",
            formatter,
            label,
            device,
            combined_output(&output).trim()
        )));
    }

    Ok(())
}

/// Waits for an entry under `dir` whose name contains `id`, polling once
/// per second for up to `timeout_secs + 1` attempts. Substring matching is
/// deliberate: the kernel sometimes truncates device-ID-derived filenames.
pub async fn await_device(dir: &Path, id: &str, timeout_secs: u64) -> DynResult<PathBuf> {
    let attempts = (timeout_secs + 1).min(u32::MAX as u64) as u32;
    let result = poll_until(Duration::from_secs(1), attempts, || {
        let dir = dir.to_path_buf();
        let id = id.to_string();
        async move {
            let entries = fs::read_dir(&dir).map_err(|e| {
                with_context(e, format!("Failed to read device directory {}", dir.display()))
            })?;
            for entry in entries {
                let entry = entry.map_err(|e| {
                    with_context(e, format!("Failed to scan device directory {}", dir.display()))
                })?;
                if entry.file_name().to_string_lossy().contains(&id) {
                    return Ok(PollOutcome::Ready(entry.path()));
                }
            }
            Ok(PollOutcome::Pending(()))
        }
    })
    .await;

    match result {
        Ok(path) => Ok(path),
        Err(PollError::Timeout { .. }) => Err(new_error(format!(
            "Timed out waiting for a device matching '{}' under {}",
            id,
            dir.display()
        ))),
        Err(PollError::Failed(err)) => Err(err),
    }
}

/// `Ok(false)` when the path does not exist. Any other stat failure is
/// surfaced: on an expected mount point it usually means "mounted but
/// broken", which callers must not confuse with "absent".
pub fn directory_exists(path: &Path) -> DynResult<bool> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(with_context(err, format!("Failed to stat {}", path.display()))),
    }
}
