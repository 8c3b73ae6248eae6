use std::collections::HashMap;
use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use serial_test::serial;

use crate::support::{available_volume, test_config, FakeCloud};
use stratovol::stratovol::cloud::types::{STATUS_AVAILABLE, STATUS_IN_USE};
use stratovol::stratovol::test_support;
use stratovol::stratovol::volume::MountOrchestrator;
use stratovol::stratovol::Config;

const VOLUME_ID: &str = "99999999-8888-7777-6666-555555555555";

fn device_name_for(id: &str) -> String {
    let prefix: String = id.chars().take(20).collect();
    format!("virtio-{}", prefix)
}

fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct Harness {
    fake: FakeCloud,
    orchestrator: MountOrchestrator,
    _root: tempfile::TempDir,
    device_dir: std::path::PathBuf,
    mount_dir: std::path::PathBuf,
}

fn harness_with(config_tweak: impl FnOnce(&mut Config)) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mount_dir = root.path().join("mnt");
    let device_dir = root.path().join("devices");
    fs::create_dir_all(&device_dir).unwrap();

    let mut config = test_config(&mount_dir, &device_dir);
    config_tweak(&mut config);

    let fake = FakeCloud::new();
    let orchestrator = MountOrchestrator::new(Arc::new(config), Arc::new(fake.clone()));
    Harness {
        fake,
        orchestrator,
        _root: root,
        device_dir,
        mount_dir,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

/// Prepends a directory of stub tools to PATH, holding the process-wide
/// environment lock, and restores PATH on drop.
struct PathStub {
    _env: std::sync::MutexGuard<'static, ()>,
    previous: Option<String>,
}

impl PathStub {
    fn install(stubs: &[(&str, &str)]) -> Self {
        let env_guard = test_support::env_lock().lock();
        let dir = test_support::test_output_dir("path-stubs");
        for (name, body) in stubs {
            let path = dir.join(name);
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let previous = env::var("PATH").ok();
        let new_path = match previous.as_deref() {
            Some(existing) => format!("{}:{}", dir.display(), existing),
            None => dir.display().to_string(),
        };
        env::set_var("PATH", new_path);
        Self {
            _env: env_guard,
            previous,
        }
    }
}

impl Drop for PathStub {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(previous) => env::set_var("PATH", previous),
            None => env::remove_var("PATH"),
        }
    }
}

fn plain_device_stubs() -> PathStub {
    PathStub::install(&[
        // No recognized filesystem, silently.
        ("blkid", "#!/bin/sh\nexit 2\n"),
        ("mkfs.ext4", "#!/bin/sh\nexit 0\n"),
        ("mount", "#!/bin/sh\nexit 0\n"),
        // Not a LUKS device for isLuks, happy for luksFormat.
        (
            "cryptsetup",
            "#!/bin/sh\ncase \"$1\" in\n  luksFormat) exit 0 ;;\n  *) exit 1 ;;\nesac\n",
        ),
    ])
}

#[tokio::test]
#[serial]
async fn mount_formats_fresh_volume_and_returns_data_path() {
    let _stubs = plain_device_stubs();
    let h = harness();
    h.fake.insert_volume(available_volume(VOLUME_ID, "pgdata"));
    fs::write(h.device_dir.join(device_name_for(VOLUME_ID)), b"").unwrap();

    let path = h.orchestrator.mount("pgdata").await.unwrap();

    assert_eq!(path, h.mount_dir.join("pgdata").join("data"));
    assert!(path.is_dir(), "data sub-directory must exist");
    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o777, "data sub-directory must be world-writable");

    let volume = h.fake.volume(VOLUME_ID).unwrap();
    assert_eq!(volume.status, STATUS_IN_USE);
    assert_eq!(volume.attachments.len(), 1);
}

#[tokio::test]
#[serial]
async fn mount_then_unmount_detaches_the_volume() {
    let _stubs = plain_device_stubs();
    let h = harness();
    h.fake.insert_volume(available_volume(VOLUME_ID, "pgdata"));
    fs::write(h.device_dir.join(device_name_for(VOLUME_ID)), b"").unwrap();

    h.orchestrator.mount("pgdata").await.unwrap();
    h.orchestrator.unmount("pgdata").await.unwrap();

    let volume = h.fake.volume(VOLUME_ID).unwrap();
    assert_eq!(volume.status, STATUS_AVAILABLE);
    assert!(volume.attachments.is_empty());
}

#[tokio::test]
async fn unmount_is_idempotent() {
    let h = harness();
    h.fake.insert_volume(available_volume(VOLUME_ID, "pgdata"));

    // Nothing is mounted and the volume is already detached; both calls
    // still report success.
    h.orchestrator.unmount("pgdata").await.unwrap();
    h.orchestrator.unmount("pgdata").await.unwrap();
}

#[tokio::test]
async fn unmount_succeeds_even_when_the_volume_is_gone() {
    let h = harness();
    h.orchestrator.unmount("ghost").await.unwrap();
}

#[tokio::test]
async fn mount_failure_after_attach_leaves_the_volume_attached() {
    let h = harness();
    h.fake.insert_volume(available_volume(VOLUME_ID, "pgdata"));
    // No device node ever appears.

    let err = h.orchestrator.mount("pgdata").await.unwrap_err();
    assert!(err.to_string().contains("did not appear"), "got: {err}");

    // Documented limitation: no rollback of the attach.
    let volume = h.fake.volume(VOLUME_ID).unwrap();
    assert_eq!(volume.attachments.len(), 1);
    let calls = h.fake.calls();
    assert!(
        !calls.iter().any(|call| call.starts_with("detach:")),
        "mount must not auto-detach on failure: {calls:?}"
    );
}

#[tokio::test]
async fn create_passes_options_through() {
    let h = harness();
    h.orchestrator
        .create("pgdata", &options(&[("size", "5"), ("type", "fast")]))
        .await
        .unwrap();

    let calls = h.fake.calls();
    assert!(calls.contains(&"create:pgdata".to_string()));
}

#[tokio::test]
async fn create_with_invalid_size_fails_before_any_remote_call() {
    let h = harness();
    let err = h
        .orchestrator
        .create("pgdata", &options(&[("size", "lots")]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid volume size"));
    assert!(h.fake.calls().is_empty());
}

#[tokio::test]
async fn create_without_key_file_ignores_encryption_request() {
    let h = harness();
    h.orchestrator
        .create("pgdata", &options(&[("encryption", "true")]))
        .await
        .unwrap();

    let calls = h.fake.calls();
    assert!(calls.contains(&"create:pgdata".to_string()));
    assert!(
        !calls.iter().any(|call| call.starts_with("attach:")),
        "unencrypted create must not attach: {calls:?}"
    );
}

#[tokio::test]
#[serial]
async fn create_encrypted_attaches_initializes_and_detaches() {
    let _stubs = plain_device_stubs();
    let key_file = tempfile::NamedTempFile::new().unwrap();
    let key_path = key_file.path().display().to_string();
    let h = harness_with(|config| config.luks_key_file = key_path.clone());

    // The device for the soon-to-be-created volume. The fake assigns
    // deterministic IDs: the first created volume gets this one.
    let expected_id = "fake-0001-aaaaaaaaaaaaaaaaaaaa";
    fs::write(h.device_dir.join(device_name_for(expected_id)), b"").unwrap();

    h.orchestrator
        .create("vault", &options(&[("encryption", "true")]))
        .await
        .unwrap();

    let calls = h.fake.calls();
    let attach_at = calls
        .iter()
        .position(|call| call.starts_with("attach:"))
        .expect("encrypted create must attach once");
    let detach_at = calls
        .iter()
        .position(|call| call.starts_with("detach:"))
        .expect("encrypted create must detach again");
    assert!(attach_at < detach_at);

    let volume = h.fake.volume(expected_id).unwrap();
    assert_eq!(volume.status, STATUS_AVAILABLE);
    assert!(volume.attachments.is_empty());
}

#[tokio::test]
async fn get_reports_reconstructed_mountpoint_and_rfc3339_time() {
    let h = harness();
    h.fake.insert_volume(available_volume(VOLUME_ID, "pgdata"));

    let info = h.orchestrator.get("pgdata").await.unwrap();
    assert_eq!(info.name, "pgdata");
    assert_eq!(
        Path::new(&info.mountpoint),
        h.mount_dir.join("pgdata").join("data")
    );
    assert_eq!(info.created_at, "2025-06-11T09:41:02Z");
}

#[tokio::test]
async fn path_is_reconstructed_without_touching_the_cloud() {
    let h = harness();
    let path = h.orchestrator.path("anything");
    assert_eq!(path, h.mount_dir.join("anything").join("data"));
    assert!(h.fake.calls().is_empty());
}
