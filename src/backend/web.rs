//! Web-page adapter: fetch (when needed) and convert HTML to Markdown.
//!
//! The only adapter that accepts a URL directly — fetching is part of the
//! engine's job here, so a request for `https://…` skips the generic
//! download step and arrives as a [`ResolvedSource::Url`]. Local `.html`
//! files skip the fetch. Either way, the HTML-to-Markdown conversion runs
//! through the configured converter tool.

use crate::backend::exec;
use crate::backend::{BackendAdapter, BackendOutput, BackendRequest, ResolvedSource};
use crate::error::BackendError;
use crate::governor::EngineClass;
use crate::registry::EngineId;
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct WebAdapter {
    client: reqwest::Client,
    html_tool: String,
}

impl WebAdapter {
    pub async fn init(html_tool: &str, fetch_timeout: Duration) -> Result<Self, BackendError> {
        exec::probe_tool(html_tool).await?;
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable {
                detail: format!("http client: {e}"),
            })?;
        Ok(Self {
            client,
            html_tool: html_tool.to_string(),
        })
    }

    async fn fetch(&self, url: &str) -> Result<String, BackendError> {
        debug!(url, "fetching page");
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                BackendError::Transient {
                    detail: format!("fetch failed: {e}"),
                }
            } else {
                BackendError::Fatal {
                    detail: format!("fetch failed: {e}"),
                }
            }
        })?;
        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(BackendError::Transient {
                detail: format!("server returned {status} for {url}"),
            });
        }
        if !status.is_success() {
            return Err(BackendError::Fatal {
                detail: format!("server returned {status} for {url}"),
            });
        }
        resp.text().await.map_err(|e| BackendError::Transient {
            detail: format!("reading body: {e}"),
        })
    }
}

#[async_trait]
impl BackendAdapter for WebAdapter {
    fn id(&self) -> EngineId {
        EngineId::Web
    }

    fn engine_class(&self) -> EngineClass {
        EngineClass::Network
    }

    async fn convert(&self, req: BackendRequest<'_>) -> Result<BackendOutput, BackendError> {
        // A fetched page needs a temp file for the converter tool; a local
        // file is used as-is. The guard keeps the temp file alive until the
        // tool has read it.
        let mut _fetched_guard = None;
        let html_path = match req.input {
            ResolvedSource::File(path) => {
                exec::require_file(path)?;
                path.to_path_buf()
            }
            ResolvedSource::Url(url) => {
                let html = self.fetch(url).await?;
                let mut tmp = tempfile::Builder::new()
                    .suffix(".html")
                    .tempfile()
                    .map_err(|e| BackendError::Fatal {
                        detail: format!("tempfile: {e}"),
                    })?;
                tmp.write_all(html.as_bytes())
                    .map_err(|e| BackendError::Fatal {
                        detail: format!("tempfile write: {e}"),
                    })?;
                let path = tmp.path().to_path_buf();
                _fetched_guard = Some(tmp);
                path
            }
        };

        let markdown = exec::run_capture(
            &self.html_tool,
            &[
                "-f",
                "html",
                "-t",
                "gfm",
                &html_path.display().to_string(),
            ],
        )
        .await?;

        Ok(BackendOutput {
            markdown,
            pages_converted: 1,
            reached_end: true,
            warnings: Vec::new(),
        })
    }
}
