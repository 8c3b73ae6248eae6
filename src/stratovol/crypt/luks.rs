//! LUKS primitives and recovery of encryption metadata from the live
//! mount table. Nothing here is persisted: the mapping name and backing
//! device are re-derived on every unmount, which keeps teardown stateless
//! across daemon restarts.

use std::error::Error;
use std::fs;
use std::path::Path;
use std::process::Command;

use crate::stratovol::logger::log_debug;
use crate::stratovol::util::error::{new_error, with_context};

type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const COMPONENT: &str = "crypt.luks";
const MAPPER_PREFIX: &str = "/dev/mapper/";
const PROC_MOUNTS: &str = "/proc/mounts";

/// Encryption metadata recovered from an active mount. All-empty means the
/// volume is not encrypted, which is the normal case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionState {
    /// Device path as it appears in the mount table, e.g.
    /// `/dev/mapper/vol1_luks`.
    pub mapping_device: String,
    /// Mapper entry name, e.g. `vol1_luks`.
    pub mapping_name: String,
    /// Physical device backing the mapping, e.g. `/dev/vdb`.
    pub physical_device: String,
}

impl EncryptionState {
    pub fn is_encrypted(&self) -> bool {
        !self.mapping_name.is_empty()
    }
}

pub fn mapping_name_for(volume_name: &str) -> String {
    format!("{}_luks", volume_name)
}

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

/// Checks whether `device` holds a LUKS container. A clean negative (the
/// tool exits non-zero without output) is `Ok(false)`; a failure that
/// produced output means the answer could not be determined at all.
pub fn is_encrypted(device: &str) -> DynResult<bool> {
    let output = Command::new("cryptsetup")
        .args(["isLuks", device])
        .output()
        .map_err(|e| with_context(e, format!("Failed to invoke cryptsetup isLuks for {}", device)))?;

    if output.status.success() {
        return Ok(true);
    }

    let combined = combined_output(&output);
    if combined.trim().is_empty() {
        return Ok(false);
    }
    Err(new_error(format!(
        "cryptsetup isLuks failed for {}: {}",
        device,
        combined.trim()
    )))
}

/// Opens the container on `device` under the volume's derived mapping
/// name, yielding a new `/dev/mapper` entry.
pub fn open(device: &str, key_file: &Path, volume_name: &str) -> DynResult<String> {
    let mapping_name = mapping_name_for(volume_name);

    let output = Command::new("cryptsetup")
        .arg("luksOpen")
        .arg("-d")
        .arg(key_file)
        .arg(device)
        .arg(&mapping_name)
        .output()
        .map_err(|e| with_context(e, format!("Failed to invoke cryptsetup luksOpen for {}", device)))?;

    if !output.status.success() {
        return Err(new_error(format!(
            "cryptsetup luksOpen failed for {}: {}",
            device,
            combined_output(&output).trim()
        )));
    }

    Ok(mapping_name)
}

/// Stamps LUKS onto a fresh device. Irreversible: existing data is gone.
pub fn initialize(device: &str, key_file: &Path) -> DynResult<()> {
    let output = Command::new("cryptsetup")
        .arg("luksFormat")
        .arg("-q")
        .arg("-d")
        .arg(key_file)
        .arg(device)
        .output()
        .map_err(|e| {
            with_context(e, format!("Failed to invoke cryptsetup luksFormat for {}", device))
        })?;

    if !output.status.success() {
        return Err(new_error(format!(
            "cryptsetup luksFormat failed for {}: {}",
            device,
            combined_output(&output).trim()
        )));
    }

    Ok(())
}

pub fn close(mapping_name: &str) -> DynResult<()> {
    let output = Command::new("cryptsetup")
        .args(["close", mapping_name])
        .output()
        .map_err(|e| {
            with_context(e, format!("Failed to invoke cryptsetup close for {}", mapping_name))
        })?;

    if !output.status.success() {
        return Err(new_error(format!(
            "cryptsetup close failed for {}: {}",
            mapping_name,
            combined_output(&output).trim()
        )));
    }

    Ok(())
}

/// Recovers encryption metadata for whatever is mounted at `mount_path`.
/// Must run before the unmount: the mount-table entry is the only record
/// of the mapping.
pub fn recover_from_mount(mount_path: &Path) -> DynResult<EncryptionState> {
    recover_from_mount_table(Path::new(PROC_MOUNTS), mount_path)
}

pub fn recover_from_mount_table(table: &Path, mount_path: &Path) -> DynResult<EncryptionState> {
    let contents = fs::read_to_string(table)
        .map_err(|e| with_context(e, format!("Failed to read mount table {}", table.display())))?;

    let mount_device = mount_device_for_path(&contents, mount_path).ok_or_else(|| {
        new_error(format!(
            "Mount {} not found in {}",
            mount_path.display(),
            table.display()
        ))
    })?;

    let Some(mapping_name) = mount_device.strip_prefix(MAPPER_PREFIX) else {
        // Most devices are not mapper devices; nothing to recover.
        log_debug(
            COMPONENT,
            "Mounted device is not a mapper device",
            &[("device", &mount_device)],
        );
        return Ok(EncryptionState::default());
    };
    let mapping_name = mapping_name.to_string();

    let output = Command::new("cryptsetup")
        .args(["status", &mapping_name])
        .output()
        .map_err(|e| {
            with_context(e, format!("Failed to invoke cryptsetup status for {}", mapping_name))
        })?;

    if !output.status.success() {
        return Err(new_error(format!(
            "cryptsetup status failed for {}: {}",
            mapping_name,
            combined_output(&output).trim()
        )));
    }

    match backing_device_from_status(&String::from_utf8_lossy(&output.stdout)) {
        Some(physical_device) => {
            log_debug(
                COMPONENT,
                "Recovered encrypted mount",
                &[
                    ("mount", &mount_path.display().to_string()),
                    ("mapping", &mapping_name),
                    ("device", &physical_device),
                ],
            );
            Ok(EncryptionState {
                mapping_device: mount_device,
                mapping_name,
                physical_device,
            })
        }
        // The status output has no backing device line: not a LUKS
        // mapping, or a broken one. Not an error either way.
        None => Ok(EncryptionState::default()),
    }
}

/// Finds the device mounted at `mount_path`. The whole table is scanned
/// and the last match wins, mirroring how over-mounts shadow earlier ones.
fn mount_device_for_path(table: &str, mount_path: &Path) -> Option<String> {
    let wanted = mount_path.to_string_lossy();
    let mut found = None;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(device), Some(point)) = (fields.next(), fields.next()) {
            if point == wanted {
                found = Some(device.to_string());
            }
        }
    }
    found
}

/// Extracts the `device:` line from `cryptsetup status` output.
fn backing_device_from_status(output: &str) -> Option<String> {
    let mut device = None;
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("device:") {
            if let Some(path) = fields.next() {
                device = Some(path.to_string());
            }
        }
    }
    device
}
