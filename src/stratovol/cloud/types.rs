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

use serde::{Deserialize, Serialize};

// Status vocabulary is the cloud service's; the state machine only
// branches on `available` vs anything else, plus the two pre-attach
// waiting states.
pub const STATUS_CREATING: &str = "creating";
pub const STATUS_AVAILABLE: &str = "available";
pub const STATUS_IN_USE: &str = "in-use";
pub const STATUS_DETACHING: &str = "detaching";

/// Remote block-storage volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub volume_type: String,
}

/// Binding of a volume to a compute instance. Lifetime is strictly nested
/// inside one mount/unmount or create-with-encryption cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "attachment_id")]
    pub id: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub volume_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

// Request/response envelopes for the block-storage service.

#[derive(Debug, Serialize)]
pub struct CreateVolumeRequest {
    pub volume: CreateVolumeBody,
}

#[derive(Debug, Serialize)]
pub struct CreateVolumeBody {
    pub name: String,
    pub size: u64,
    pub volume_type: String,
}

#[derive(Debug, Deserialize)]
pub struct VolumeEnvelope {
    pub volume: Volume,
}

#[derive(Debug, Deserialize)]
pub struct VolumeListEnvelope {
    pub volumes: Vec<Volume>,
}

// The compute service speaks camelCase for attachments; the volume service
// speaks snake_case. Converted at the client boundary.

#[derive(Debug, Serialize)]
pub struct CreateAttachmentRequest {
    #[serde(rename = "volumeAttachment")]
    pub volume_attachment: CreateAttachmentBody,
}

#[derive(Debug, Serialize)]
pub struct CreateAttachmentBody {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentEnvelope {
    #[serde(rename = "volumeAttachment")]
    pub volume_attachment: ComputeAttachment,
}

#[derive(Debug, Deserialize)]
pub struct ComputeAttachment {
    pub id: String,
    #[serde(default, rename = "serverId")]
    pub server_id: String,
    #[serde(default, rename = "volumeId")]
    pub volume_id: String,
}

impl From<ComputeAttachment> for Attachment {
    fn from(value: ComputeAttachment) -> Self {
        Attachment {
            id: value.id,
            server_id: value.server_id,
            volume_id: value.volume_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerListEnvelope {
    pub servers: Vec<Server>,
}
