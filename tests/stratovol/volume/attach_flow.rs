use std::fs;
use std::sync::Arc;

use crate::support::{available_volume, test_config, FakeCloud};
use stratovol::stratovol::cloud::types::{STATUS_AVAILABLE, STATUS_CREATING};
use stratovol::stratovol::volume::AttachmentController;

const VOLUME_ID: &str = "11111111-2222-3333-4444-555555555555";

fn device_name_for(id: &str) -> String {
    let prefix: String = id.chars().take(20).collect();
    format!("virtio-{}", prefix)
}

struct Harness {
    fake: FakeCloud,
    controller: AttachmentController,
    _mount_dir: tempfile::TempDir,
    device_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let mount_dir = tempfile::tempdir().unwrap();
    let device_dir = tempfile::tempdir().unwrap();
    let fake = FakeCloud::new();
    let config = Arc::new(test_config(mount_dir.path(), device_dir.path()));
    let controller = AttachmentController::new(config, Arc::new(fake.clone()));
    Harness {
        fake,
        controller,
        _mount_dir: mount_dir,
        device_dir,
    }
}

#[tokio::test]
async fn attach_waits_for_available_before_attaching() {
    let h = harness();
    let mut volume = available_volume(VOLUME_ID, "pgdata");
    volume.status = STATUS_CREATING.to_string();
    h.fake.insert_volume(volume.clone());
    h.fake.transition_after_gets(VOLUME_ID, 2, STATUS_AVAILABLE);
    fs::write(h.device_dir.path().join(device_name_for(VOLUME_ID)), b"").unwrap();

    let (attached, device) = h.controller.attach(volume).await.unwrap();

    assert_eq!(attached.attachments.len(), 1);
    assert!(device
        .file_name()
        .unwrap()
        .to_string_lossy()
        .contains("11111111-2222-3333-4"));

    let calls = h.fake.calls();
    let attach_call = calls
        .iter()
        .find(|call| call.starts_with("attach:"))
        .expect("an attach call must have been issued");
    // The fake records the volume status at the moment of attach: it must
    // never be `creating`.
    assert!(
        attach_call.ends_with(&format!(":{}", STATUS_AVAILABLE)),
        "attach issued in wrong state: {attach_call}"
    );
}

#[tokio::test]
async fn attach_detaches_a_foreign_attachment_first() {
    let h = harness();
    let volume = available_volume(VOLUME_ID, "pgdata");
    h.fake.insert_volume(volume);
    let foreign = h.fake.attach_directly(VOLUME_ID, "other-server");
    fs::write(h.device_dir.path().join(device_name_for(VOLUME_ID)), b"").unwrap();

    let current = h.fake.volume(VOLUME_ID).unwrap();
    let (attached, _device) = h.controller.attach(current).await.unwrap();

    // The foreign attachment is gone and ours is in place.
    assert_eq!(attached.attachments.len(), 1);
    assert_ne!(attached.attachments[0].id, foreign);
    assert_eq!(attached.attachments[0].server_id, "srv-self");

    let calls = h.fake.calls();
    let detach_at = calls
        .iter()
        .position(|call| call == &format!("detach:{}", foreign))
        .expect("foreign attachment must be detached");
    let attach_at = calls
        .iter()
        .position(|call| call.starts_with("attach:"))
        .expect("attach must follow");
    assert!(detach_at < attach_at, "detach must precede attach: {calls:?}");
}

#[tokio::test]
async fn wait_for_status_timeout_reports_last_observed_status() {
    let h = harness();
    let mut volume = available_volume(VOLUME_ID, "pgdata");
    volume.status = "error".to_string();
    h.fake.insert_volume(volume.clone());

    let err = h
        .controller
        .wait_for_status(volume, STATUS_AVAILABLE)
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("pgdata"), "volume name missing: {message}");
    assert!(
        message.contains("'error'"),
        "final observed status missing: {message}"
    );
}

#[tokio::test]
async fn wait_for_status_returns_immediately_when_already_there() {
    let h = harness();
    let volume = available_volume(VOLUME_ID, "pgdata");
    h.fake.insert_volume(volume.clone());

    let result = h
        .controller
        .wait_for_status(volume, STATUS_AVAILABLE)
        .await
        .unwrap();
    assert_eq!(result.status, STATUS_AVAILABLE);
    // No remote fetch was needed.
    assert!(h.fake.calls().is_empty());
}

#[tokio::test]
async fn detach_stops_at_the_first_failed_attachment() {
    let h = harness();
    let volume = available_volume(VOLUME_ID, "pgdata");
    h.fake.insert_volume(volume);
    let first = h.fake.attach_directly(VOLUME_ID, "srv-a");
    let second = h.fake.attach_directly(VOLUME_ID, "srv-b");
    h.fake.fail_detach_of(&first);

    let current = h.fake.volume(VOLUME_ID).unwrap();
    let err = h.controller.detach(current).await.unwrap_err();
    assert!(err.to_string().contains("Failed to detach"));

    let calls = h.fake.calls();
    assert!(calls.contains(&format!("detach:{}", first)));
    assert!(
        !calls.contains(&format!("detach:{}", second)),
        "later attachments must not be touched after a failure: {calls:?}"
    );
    // Both attachments survive remotely.
    assert_eq!(h.fake.volume(VOLUME_ID).unwrap().attachments.len(), 2);
}
