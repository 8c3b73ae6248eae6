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

pub mod client;
pub mod types;

use std::error::Error;
use std::future::Future;
use std::pin::Pin;

use types::{Attachment, Server, Volume};

type DynError = Box<dyn Error + Send + Sync>;
type DynResult<T> = Result<T, DynError>;
pub type CloudFuture<T> = Pin<Box<dyn Future<Output = DynResult<T>> + Send>>;

/// Interface to the block-storage and compute services. Implemented by the
/// HTTP client in production and by in-memory fakes in tests.
pub trait CloudClient: Send + Sync {
    fn create_volume(&self, name: &str, size: u64, volume_type: &str) -> CloudFuture<Volume>;

    fn get_volume(&self, id: &str) -> CloudFuture<Volume>;

    /// Lists volumes, optionally filtered by exact name on the server side.
    fn list_volumes(&self, name_filter: Option<&str>) -> CloudFuture<Vec<Volume>>;

    fn delete_volume(&self, id: &str) -> CloudFuture<()>;

    fn create_attachment(&self, server_id: &str, volume_id: &str) -> CloudFuture<Attachment>;

    fn delete_attachment(&self, server_id: &str, attachment_id: &str) -> CloudFuture<()>;

    fn list_servers(&self, name_filter: Option<&str>) -> CloudFuture<Vec<Server>>;
}
