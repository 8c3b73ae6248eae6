#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use stratovol::stratovol::cloud::types::{
    Attachment, Server, Volume, STATUS_AVAILABLE, STATUS_IN_USE,
};
use stratovol::stratovol::cloud::{CloudClient, CloudFuture};
use stratovol::stratovol::util::error::{new_error, not_found};
use stratovol::stratovol::Config;

/// Configuration tuned for tests: temp directories and fast polling.
pub fn test_config(mount_dir: &Path, device_dir: &Path) -> Config {
    Config {
        mount_dir: mount_dir.display().to_string(),
        device_dir: device_dir.display().to_string(),
        machine_id: "srv-self".to_string(),
        state_timeout_secs: 1,
        state_interval_ms: 10,
        state_settle_secs: 0,
        device_timeout_secs: 1,
        device_settle_secs: 0,
        ..Config::default()
    }
}

#[derive(Default)]
struct FakeState {
    volumes: Vec<Volume>,
    servers: Vec<Server>,
    next_attachment: u64,
    calls: Vec<String>,
    /// volume id -> remaining get_volume calls before flipping to the
    /// target status.
    transitions: HashMap<String, (u32, String)>,
    fail_detach: HashSet<String>,
}

impl FakeState {
    fn volume_mut(&mut self, id: &str) -> Option<&mut Volume> {
        self.volumes.iter_mut().find(|volume| volume.id == id)
    }
}

/// In-memory stand-in for the block-storage and compute services. Records
/// every call so tests can assert ordering.
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_volume(&self, volume: Volume) {
        self.lock().volumes.push(volume);
    }

    pub fn insert_server(&self, server: Server) {
        self.lock().servers.push(server);
    }

    pub fn volume(&self, id: &str) -> Option<Volume> {
        self.lock()
            .volumes
            .iter()
            .find(|volume| volume.id == id)
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn set_status(&self, id: &str, status: &str) {
        if let Some(volume) = self.lock().volume_mut(id) {
            volume.status = status.to_string();
        }
    }

    /// After `gets` further get_volume calls, the volume flips to
    /// `status`. Models eventual consistency of the remote service.
    pub fn transition_after_gets(&self, id: &str, gets: u32, status: &str) {
        self.lock()
            .transitions
            .insert(id.to_string(), (gets, status.to_string()));
    }

    pub fn fail_detach_of(&self, attachment_id: &str) {
        self.lock().fail_detach.insert(attachment_id.to_string());
    }

    pub fn attach_directly(&self, volume_id: &str, server_id: &str) -> String {
        let mut state = self.lock();
        state.next_attachment += 1;
        let attachment_id = format!("att-{}", state.next_attachment);
        if let Some(volume) = state.volume_mut(volume_id) {
            volume.attachments.push(Attachment {
                id: attachment_id.clone(),
                server_id: server_id.to_string(),
                volume_id: volume_id.to_string(),
            });
            volume.status = STATUS_IN_USE.to_string();
        }
        attachment_id
    }
}

/// A volume in the `available` state with a predictable ID, long enough to
/// exercise the 20-character device-ID truncation.
pub fn available_volume(id: &str, name: &str) -> Volume {
    Volume {
        id: id.to_string(),
        name: name.to_string(),
        status: STATUS_AVAILABLE.to_string(),
        attachments: Vec::new(),
        created_at: "2025-06-11T09:41:02.000000".to_string(),
        size: 10,
        volume_type: "classic".to_string(),
    }
}

impl CloudClient for FakeCloud {
    fn create_volume(&self, name: &str, size: u64, volume_type: &str) -> CloudFuture<Volume> {
        let fake = self.clone();
        let name = name.to_string();
        let volume_type = volume_type.to_string();
        Box::pin(async move {
            let mut state = fake.lock();
            let id = format!("fake-{:04}-aaaaaaaaaaaaaaaaaaaa", state.volumes.len() + 1);
            state.calls.push(format!("create:{}", name));
            let volume = Volume {
                id: id.clone(),
                name,
                status: STATUS_AVAILABLE.to_string(),
                attachments: Vec::new(),
                created_at: "2025-06-11T09:41:02.000000".to_string(),
                size,
                volume_type,
            };
            state.volumes.push(volume.clone());
            Ok(volume)
        })
    }

    fn get_volume(&self, id: &str) -> CloudFuture<Volume> {
        let fake = self.clone();
        let id = id.to_string();
        Box::pin(async move {
            let mut state = fake.lock();
            state.calls.push(format!("get:{}", id));

            if let Some((remaining, target)) = state.transitions.get(&id).cloned() {
                if remaining <= 1 {
                    state.transitions.remove(&id);
                    if let Some(volume) = state.volume_mut(&id) {
                        volume.status = target;
                    }
                } else {
                    state.transitions.insert(id.clone(), (remaining - 1, target));
                }
            }

            state
                .volumes
                .iter()
                .find(|volume| volume.id == id)
                .cloned()
                .ok_or_else(|| not_found(format!("Volume '{}' not found", id)))
        })
    }

    fn list_volumes(&self, name_filter: Option<&str>) -> CloudFuture<Vec<Volume>> {
        let fake = self.clone();
        let name_filter = name_filter.map(str::to_string);
        Box::pin(async move {
            let mut state = fake.lock();
            state.calls.push("list".to_string());
            Ok(state
                .volumes
                .iter()
                .filter(|volume| {
                    name_filter
                        .as_deref()
                        .map(|name| volume.name == name)
                        .unwrap_or(true)
                })
                .cloned()
                .collect())
        })
    }

    fn delete_volume(&self, id: &str) -> CloudFuture<()> {
        let fake = self.clone();
        let id = id.to_string();
        Box::pin(async move {
            let mut state = fake.lock();
            state.calls.push(format!("delete:{}", id));
            let before = state.volumes.len();
            state.volumes.retain(|volume| volume.id != id);
            if state.volumes.len() == before {
                return Err(not_found(format!("Volume '{}' not found", id)));
            }
            Ok(())
        })
    }

    fn create_attachment(&self, server_id: &str, volume_id: &str) -> CloudFuture<Attachment> {
        let fake = self.clone();
        let server_id = server_id.to_string();
        let volume_id = volume_id.to_string();
        Box::pin(async move {
            let mut state = fake.lock();
            state.next_attachment += 1;
            let attachment_id = format!("att-{}", state.next_attachment);

            let status = state
                .volume_mut(&volume_id)
                .map(|volume| volume.status.clone())
                .unwrap_or_default();
            // Status at the moment of attach is recorded so tests can
            // prove no attach happened against a still-creating volume.
            state
                .calls
                .push(format!("attach:{}:{}", volume_id, status));

            let attachment = Attachment {
                id: attachment_id,
                server_id: server_id.clone(),
                volume_id: volume_id.clone(),
            };
            match state.volume_mut(&volume_id) {
                Some(volume) => {
                    volume.attachments.push(attachment.clone());
                    volume.status = STATUS_IN_USE.to_string();
                    Ok(attachment)
                }
                None => Err(not_found(format!("Volume '{}' not found", volume_id))),
            }
        })
    }

    fn delete_attachment(&self, server_id: &str, attachment_id: &str) -> CloudFuture<()> {
        let fake = self.clone();
        let _server_id = server_id.to_string();
        let attachment_id = attachment_id.to_string();
        Box::pin(async move {
            let mut state = fake.lock();
            state.calls.push(format!("detach:{}", attachment_id));
            if state.fail_detach.contains(&attachment_id) {
                return Err(new_error(format!(
                    "Attachment '{}' cannot be deleted",
                    attachment_id
                )));
            }
            for volume in state.volumes.iter_mut() {
                let before = volume.attachments.len();
                volume
                    .attachments
                    .retain(|attachment| attachment.id != attachment_id);
                if volume.attachments.len() < before && volume.attachments.is_empty() {
                    volume.status = STATUS_AVAILABLE.to_string();
                }
            }
            Ok(())
        })
    }

    fn list_servers(&self, name_filter: Option<&str>) -> CloudFuture<Vec<Server>> {
        let fake = self.clone();
        let name_filter = name_filter.map(str::to_string);
        Box::pin(async move {
            let state = fake.lock();
            Ok(state
                .servers
                .iter()
                .filter(|server| {
                    name_filter
                        .as_deref()
                        .map(|name| server.name == name)
                        .unwrap_or(true)
                })
                .cloned()
                .collect())
        })
    }
}
