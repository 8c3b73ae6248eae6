use std::fs;
use std::time::{Duration, Instant};

use stratovol::stratovol::device::probe::await_device;

#[tokio::test]
async fn await_device_times_out_after_roughly_the_timeout() {
    let dir = tempfile::tempdir().unwrap();

    let started = Instant::now();
    let err = await_device(dir.path(), "abcd1234efgh5678", 3)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.to_string().contains("Timed out"), "got: {err}");
    assert!(
        elapsed >= Duration::from_secs(3),
        "returned too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(6),
        "returned too late: {elapsed:?}"
    );
}

#[tokio::test]
async fn await_device_returns_once_a_matching_node_appears() {
    let dir = tempfile::tempdir().unwrap();
    let device_path = dir.path().join("virtio-abcd1234efgh5678");

    let writer = {
        let device_path = device_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            fs::write(&device_path, b"").unwrap();
        })
    };

    let started = Instant::now();
    let found = await_device(dir.path(), "abcd1234efgh5678", 5)
        .await
        .unwrap();
    writer.await.unwrap();

    assert_eq!(found, device_path);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "should return promptly after the node appears"
    );
}
