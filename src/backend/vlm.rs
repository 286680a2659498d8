//! Remote vision-language-model adapter.
//!
//! Talks to an inference server over HTTP: the document bytes go up, the
//! Markdown comes back. The server holds the model and enforces its own
//! batch limits, so this adapter's class is [`EngineClass::RemoteVlm`] and
//! the per-class cap should match the server's concurrency ceiling.
//!
//! ## Failure classification
//!
//! Connection errors, timeouts, 429 and 5xx are transient — inference
//! servers shed load under pressure and recover. Any other non-success
//! status means the request itself is bad (unsupported input, payload too
//! large) and is not retried.

use crate::backend::{BackendAdapter, BackendOutput, BackendRequest};
use crate::error::BackendError;
use crate::governor::EngineClass;
use crate::registry::EngineId;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Response body of the server's `/v1/convert` endpoint.
#[derive(Debug, Deserialize)]
struct VlmReply {
    markdown: String,
    #[serde(default)]
    pages_converted: u32,
    #[serde(default)]
    reached_end: bool,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug)]
pub struct VlmAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl VlmAdapter {
    /// Open a session against the inference server and check its health
    /// endpoint. Registry-driven: runs at most once per process, and a
    /// dead server degrades the engine rather than failing every chunk.
    pub async fn init(base_url: &str, connect_timeout: Duration) -> Result<Self, BackendError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable {
                detail: format!("http client: {e}"),
            })?;

        let health = format!("{base_url}/health");
        let resp = client
            .get(&health)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable {
                detail: format!("VLM server unreachable at {base_url}: {e}"),
            })?;
        if !resp.status().is_success() {
            return Err(BackendError::Unavailable {
                detail: format!("VLM server health check returned {}", resp.status()),
            });
        }
        debug!(%base_url, "VLM session ready");
        Ok(Self { client, base_url })
    }

    fn classify(err: reqwest::Error) -> BackendError {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            BackendError::Transient {
                detail: format!("VLM request failed: {err}"),
            }
        } else {
            BackendError::Fatal {
                detail: format!("VLM request failed: {err}"),
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for VlmAdapter {
    fn id(&self) -> EngineId {
        EngineId::PdfVlm
    }

    fn engine_class(&self) -> EngineClass {
        EngineClass::RemoteVlm
    }

    async fn convert(&self, req: BackendRequest<'_>) -> Result<BackendOutput, BackendError> {
        let input = req.input.as_file()?;
        let bytes = tokio::fs::read(input).await.map_err(|e| BackendError::Fatal {
            detail: format!("reading {}: {e}", input.display()),
        })?;

        let mut url = format!(
            "{}/v1/convert?start_page={}",
            self.base_url, req.window.start
        );
        if let Some(end) = req.window.end {
            url.push_str(&format!("&end_page={end}"));
        }

        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(BackendError::Transient {
                detail: format!("VLM server returned {status}"),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Fatal {
                detail: format!("VLM server returned {status}: {body}"),
            });
        }

        let reply: VlmReply = resp.json().await.map_err(Self::classify)?;
        Ok(BackendOutput {
            markdown: reply.markdown,
            pages_converted: reply.pages_converted,
            reached_end: reply.reached_end,
            warnings: reply.warnings,
        })
    }
}
