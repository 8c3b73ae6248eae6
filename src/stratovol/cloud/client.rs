use std::error::Error;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::time::sleep;

use super::types::{
    Attachment, AttachmentEnvelope, CreateAttachmentBody, CreateAttachmentRequest,
    CreateVolumeBody, CreateVolumeRequest, Server, ServerListEnvelope, Volume, VolumeEnvelope,
    VolumeListEnvelope,
};
use super::{CloudClient, CloudFuture};
use crate::stratovol::logger::{log_debug, log_info};
use crate::stratovol::util::error::{new_error, with_context};
use crate::stratovol::Config;

type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const COMPONENT: &str = "cloud.client";
const TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn next_backoff(current: Duration) -> Duration {
    current
        .checked_mul(2)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Builds the token request body: application credentials win over
/// username/password when both are configured.
fn auth_payload(config: &Config) -> Value {
    if !config.application_credential_id.is_empty() {
        json!({
            "auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": {
                        "id": config.application_credential_id,
                        "secret": config.application_credential_secret,
                    }
                }
            }
        })
    } else {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": config.username,
                            "domain": { "name": config.domain_name },
                            "password": config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": config.project_name,
                        "domain": { "name": config.domain_name },
                    }
                }
            }
        })
    }
}

/// HTTP implementation of [`CloudClient`] against the block-storage and
/// compute services. One token is fetched at connect time; requests that
/// fail on connect/timeout or with 429/5xx are retried with backoff.
#[derive(Clone)]
pub struct HttpCloudClient {
    http: reqwest::Client,
    token: String,
    block_endpoint: String,
    compute_endpoint: String,
}

impl HttpCloudClient {
    pub async fn connect(config: &Config) -> DynResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| with_context(e, "Failed to build HTTP client"))?;

        log_info(
            COMPONENT,
            "Authenticating",
            &[
                ("endpoint", &config.identity_endpoint),
                ("region", &config.region),
            ],
        );

        let url = format!(
            "{}/auth/tokens",
            config.identity_endpoint.trim_end_matches('/')
        );
        let response = http
            .post(&url)
            .json(&auth_payload(config))
            .send()
            .await
            .map_err(|e| with_context(e, "Token request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(new_error(format!(
                "Authentication failed: {} {}",
                status,
                body.trim()
            )));
        }

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| new_error("Token response carried no subject token header"))?;

        Ok(Self {
            http,
            token,
            block_endpoint: config.block_storage_endpoint.trim_end_matches('/').into(),
            compute_endpoint: config.compute_endpoint.trim_end_matches('/').into(),
        })
    }

    async fn execute_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> DynResult<reqwest::Response> {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().header(TOKEN_HEADER, &self.token).send().await {
                Ok(response)
                    if should_retry_status(response.status()) && attempt < RETRY_ATTEMPTS =>
                {
                    log_debug(
                        COMPONENT,
                        "Retrying request",
                        &[("status", response.status().as_str())],
                    );
                }
                Ok(response) => return Ok(response),
                Err(err) if is_retryable_reqwest(&err) && attempt < RETRY_ATTEMPTS => {
                    log_debug(COMPONENT, "Retrying request", &[("error", &err.to_string())]);
                }
                Err(err) => return Err(with_context(err, "Cloud API request failed")),
            }
            sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn expect_success(
        response: reqwest::Response,
        context: &str,
    ) -> DynResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(new_error(format!("{}: {} {}", context, status, body.trim())))
    }

    async fn do_create_volume(self, name: String, size: u64, volume_type: String) -> DynResult<Volume> {
        let url = format!("{}/volumes", self.block_endpoint);
        let body = CreateVolumeRequest {
            volume: CreateVolumeBody {
                name,
                size,
                volume_type,
            },
        };
        let response = self
            .execute_with_retry(|| self.http.post(&url).json(&body))
            .await?;
        let response = Self::expect_success(response, "Volume create failed").await?;
        let envelope: VolumeEnvelope = response
            .json()
            .await
            .map_err(|e| with_context(e, "Failed to decode volume create response"))?;
        Ok(envelope.volume)
    }

    async fn do_get_volume(self, id: String) -> DynResult<Volume> {
        let url = format!("{}/volumes/{}", self.block_endpoint, id);
        let response = self.execute_with_retry(|| self.http.get(&url)).await?;
        let response = Self::expect_success(response, "Volume get failed").await?;
        let envelope: VolumeEnvelope = response
            .json()
            .await
            .map_err(|e| with_context(e, "Failed to decode volume get response"))?;
        Ok(envelope.volume)
    }

    async fn do_list_volumes(self, name_filter: Option<String>) -> DynResult<Vec<Volume>> {
        let url = format!("{}/volumes/detail", self.block_endpoint);
        let response = self
            .execute_with_retry(|| {
                let mut request = self.http.get(&url);
                if let Some(name) = name_filter.as_deref() {
                    request = request.query(&[("name", name)]);
                }
                request
            })
            .await?;
        let response = Self::expect_success(response, "Volume list failed").await?;
        let envelope: VolumeListEnvelope = response
            .json()
            .await
            .map_err(|e| with_context(e, "Failed to decode volume list response"))?;
        Ok(envelope.volumes)
    }

    async fn do_delete_volume(self, id: String) -> DynResult<()> {
        let url = format!("{}/volumes/{}", self.block_endpoint, id);
        let response = self.execute_with_retry(|| self.http.delete(&url)).await?;
        Self::expect_success(response, "Volume delete failed").await?;
        Ok(())
    }

    async fn do_create_attachment(
        self,
        server_id: String,
        volume_id: String,
    ) -> DynResult<Attachment> {
        let url = format!(
            "{}/servers/{}/os-volume_attachments",
            self.compute_endpoint, server_id
        );
        let body = CreateAttachmentRequest {
            volume_attachment: CreateAttachmentBody { volume_id },
        };
        let response = self
            .execute_with_retry(|| self.http.post(&url).json(&body))
            .await?;
        let response = Self::expect_success(response, "Attachment create failed").await?;
        let envelope: AttachmentEnvelope = response
            .json()
            .await
            .map_err(|e| with_context(e, "Failed to decode attachment response"))?;
        Ok(envelope.volume_attachment.into())
    }

    async fn do_delete_attachment(self, server_id: String, attachment_id: String) -> DynResult<()> {
        let url = format!(
            "{}/servers/{}/os-volume_attachments/{}",
            self.compute_endpoint, server_id, attachment_id
        );
        let response = self.execute_with_retry(|| self.http.delete(&url)).await?;
        Self::expect_success(response, "Attachment delete failed").await?;
        Ok(())
    }

    async fn do_list_servers(self, name_filter: Option<String>) -> DynResult<Vec<Server>> {
        let url = format!("{}/servers", self.compute_endpoint);
        let response = self
            .execute_with_retry(|| {
                let mut request = self.http.get(&url);
                if let Some(name) = name_filter.as_deref() {
                    request = request.query(&[("name", name)]);
                }
                request
            })
            .await?;
        let response = Self::expect_success(response, "Server list failed").await?;
        let envelope: ServerListEnvelope = response
            .json()
            .await
            .map_err(|e| with_context(e, "Failed to decode server list response"))?;
        Ok(envelope.servers)
    }
}

impl CloudClient for HttpCloudClient {
    fn create_volume(&self, name: &str, size: u64, volume_type: &str) -> CloudFuture<Volume> {
        let client = self.clone();
        let name = name.to_string();
        let volume_type = volume_type.to_string();
        Box::pin(async move { client.do_create_volume(name, size, volume_type).await })
    }

    fn get_volume(&self, id: &str) -> CloudFuture<Volume> {
        let client = self.clone();
        let id = id.to_string();
        Box::pin(async move { client.do_get_volume(id).await })
    }

    fn list_volumes(&self, name_filter: Option<&str>) -> CloudFuture<Vec<Volume>> {
        let client = self.clone();
        let name_filter = name_filter.map(str::to_string);
        Box::pin(async move { client.do_list_volumes(name_filter).await })
    }

    fn delete_volume(&self, id: &str) -> CloudFuture<()> {
        let client = self.clone();
        let id = id.to_string();
        Box::pin(async move { client.do_delete_volume(id).await })
    }

    fn create_attachment(&self, server_id: &str, volume_id: &str) -> CloudFuture<Attachment> {
        let client = self.clone();
        let server_id = server_id.to_string();
        let volume_id = volume_id.to_string();
        Box::pin(async move { client.do_create_attachment(server_id, volume_id).await })
    }

    fn delete_attachment(&self, server_id: &str, attachment_id: &str) -> CloudFuture<()> {
        let client = self.clone();
        let server_id = server_id.to_string();
        let attachment_id = attachment_id.to_string();
        Box::pin(async move { client.do_delete_attachment(server_id, attachment_id).await })
    }

    fn list_servers(&self, name_filter: Option<&str>) -> CloudFuture<Vec<Server>> {
        let client = self.clone();
        let name_filter = name_filter.map(str::to_string);
        Box::pin(async move { client.do_list_servers(name_filter).await })
    }
}
