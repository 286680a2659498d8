//! Configuration for the conversion orchestrator.
//!
//! All behaviour is controlled through [`OrchestratorConfig`], built via its
//! [`OrchestratorConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, log them, and diff two runs to
//! understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest.

use crate::error::ConvertError;
use crate::governor::{EngineClass, GovernorLimits};
use crate::progress::ConversionProgressCallback;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Commands and endpoints for the external engines.
///
/// Everything here is a deployment concern: which binaries are on `PATH`,
/// where the inference server lives. Engine *behaviour* is configured per
/// request through [`crate::ConversionRequest`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Layout/OCR pipeline tool (stdin/stdout JSON protocol).
    pub pipeline_cmd: String,
    /// Office-document converter tool (same protocol).
    pub office_cmd: String,
    /// Headless LibreOffice binary for legacy formats.
    pub soffice_cmd: String,
    /// HTML/EPUB converter tool (pandoc-compatible flags).
    pub pandoc_cmd: String,
    /// Base URL of the VLM inference server; required for the `vlm` policy.
    pub vlm_server_url: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pipeline_cmd: "docmark-pipeline".into(),
            office_cmd: "docmark-office".into(),
            soffice_cmd: "soffice".into(),
            pandoc_cmd: "pandoc".into(),
            vlm_server_url: None,
        }
    }
}

/// Configuration for a conversion orchestrator.
///
/// Built via [`OrchestratorConfig::builder()`] or
/// [`OrchestratorConfig::default()`].
///
/// # Example
/// ```rust
/// use docmark::OrchestratorConfig;
///
/// let config = OrchestratorConfig::builder()
///     .global_concurrency(8)
///     .gpu_concurrency(2)
///     .chunk_window(32)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct OrchestratorConfig {
    /// Cap on total concurrent backend calls. Default: 4.
    ///
    /// This protects overall host memory and CPU. Individual engine classes
    /// have their own, usually tighter, caps below.
    pub global_concurrency: usize,

    /// Concurrent calls into the GPU-resident model. Default: 1.
    ///
    /// Layout models hold multi-gigabyte weights; a second concurrent batch
    /// usually means VRAM exhaustion, not throughput. Raise only on hosts
    /// with headroom measured under real load.
    pub gpu_concurrency: usize,

    /// Concurrent calls to the remote VLM server. Default: 4.
    ///
    /// Match this to the server's own concurrency ceiling; exceeding it
    /// just converts admission waits into 429 retry loops.
    pub vlm_concurrency: usize,

    /// Concurrent forked tool processes (LibreOffice, pandoc). Default: 2.
    pub subprocess_concurrency: usize,

    /// Concurrent network fetches. Default: 8.
    pub network_concurrency: usize,

    /// Pages per chunk for paginated inputs. Default: 16.
    ///
    /// Smaller windows give finer-grained retry and progress at the cost of
    /// per-call overhead; the backend's fixed startup cost dominates below
    /// ~8 pages. This is a latency/memory tuning knob, not a correctness
    /// one.
    pub chunk_window: u32,

    /// Speculative windows dispatched per wave when the document length is
    /// unknown. Default: 4.
    pub speculative_windows: usize,

    /// Maximum retry attempts for a transient backend failure. Default: 3.
    ///
    /// Permanent failures (corrupt input, unsupported internals) are never
    /// retried; they surface in the chunk result immediately.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s. Exponential backoff
    /// avoids the thundering-herd problem where N concurrent chunks retry
    /// simultaneously against a recovering engine.
    pub retry_backoff_ms: u64,

    /// How long a chunk may wait for an admission slot. Default: 30 s.
    pub admission_timeout_secs: u64,

    /// Per-backend-call timeout. Default: 300 s. Overridable per request.
    pub call_timeout_secs: u64,

    /// Download timeout for URL inputs. Default: 120 s.
    pub download_timeout_secs: u64,

    /// Cool-down before a degraded engine may re-attempt initialisation.
    /// Default: 60 s.
    pub engine_cooldown_secs: u64,

    /// External engine commands and endpoints.
    pub engines: EngineSettings,

    /// Per-chunk progress events. Default: none.
    pub progress_callback: Option<Arc<dyn ConversionProgressCallback>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 4,
            gpu_concurrency: 1,
            vlm_concurrency: 4,
            subprocess_concurrency: 2,
            network_concurrency: 8,
            chunk_window: 16,
            speculative_windows: 4,
            max_retries: 3,
            retry_backoff_ms: 500,
            admission_timeout_secs: 30,
            call_timeout_secs: 300,
            download_timeout_secs: 120,
            engine_cooldown_secs: 60,
            engines: EngineSettings::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("global_concurrency", &self.global_concurrency)
            .field("gpu_concurrency", &self.gpu_concurrency)
            .field("vlm_concurrency", &self.vlm_concurrency)
            .field("subprocess_concurrency", &self.subprocess_concurrency)
            .field("network_concurrency", &self.network_concurrency)
            .field("chunk_window", &self.chunk_window)
            .field("speculative_windows", &self.speculative_windows)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("admission_timeout_secs", &self.admission_timeout_secs)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("engines", &self.engines)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn callback>"),
            )
            .finish()
    }
}

impl OrchestratorConfig {
    /// Create a new builder.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder {
            config: Self::default(),
        }
    }

    /// The caps the concurrency governor enforces.
    pub fn governor_limits(&self) -> GovernorLimits {
        let per_class: HashMap<EngineClass, usize> = [
            (EngineClass::GpuModel, self.gpu_concurrency),
            (EngineClass::RemoteVlm, self.vlm_concurrency),
            (EngineClass::Subprocess, self.subprocess_concurrency),
            (EngineClass::Network, self.network_concurrency),
        ]
        .into_iter()
        .collect();
        GovernorLimits {
            global: self.global_concurrency,
            per_class,
        }
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn engine_cooldown(&self) -> Duration {
        Duration::from_secs(self.engine_cooldown_secs)
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn global_concurrency(mut self, n: usize) -> Self {
        self.config.global_concurrency = n.max(1);
        self
    }

    pub fn gpu_concurrency(mut self, n: usize) -> Self {
        self.config.gpu_concurrency = n.max(1);
        self
    }

    pub fn vlm_concurrency(mut self, n: usize) -> Self {
        self.config.vlm_concurrency = n.max(1);
        self
    }

    pub fn subprocess_concurrency(mut self, n: usize) -> Self {
        self.config.subprocess_concurrency = n.max(1);
        self
    }

    pub fn network_concurrency(mut self, n: usize) -> Self {
        self.config.network_concurrency = n.max(1);
        self
    }

    pub fn chunk_window(mut self, pages: u32) -> Self {
        self.config.chunk_window = pages.max(1);
        self
    }

    pub fn speculative_windows(mut self, n: usize) -> Self {
        self.config.speculative_windows = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn admission_timeout_secs(mut self, secs: u64) -> Self {
        self.config.admission_timeout_secs = secs.max(1);
        self
    }

    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.call_timeout_secs = secs.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn engine_cooldown_secs(mut self, secs: u64) -> Self {
        self.config.engine_cooldown_secs = secs;
        self
    }

    pub fn engines(mut self, engines: EngineSettings) -> Self {
        self.config.engines = engines;
        self
    }

    pub fn vlm_server_url(mut self, url: impl Into<String>) -> Self {
        self.config.engines.vlm_server_url = Some(url.into());
        self
    }

    pub fn progress_callback(mut self, cb: Arc<dyn ConversionProgressCallback>) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating cross-field constraints.
    pub fn build(self) -> Result<OrchestratorConfig, ConvertError> {
        let c = &self.config;
        if c.global_concurrency == 0 {
            return Err(ConvertError::InvalidConfig(
                "global concurrency must be ≥ 1".into(),
            ));
        }
        for (name, cap) in [
            ("gpu", c.gpu_concurrency),
            ("vlm", c.vlm_concurrency),
            ("subprocess", c.subprocess_concurrency),
            ("network", c.network_concurrency),
        ] {
            if cap > c.global_concurrency {
                tracing::warn!(
                    class = name,
                    cap,
                    global = c.global_concurrency,
                    "per-class cap exceeds global cap; global cap binds"
                );
            }
        }
        if c.chunk_window == 0 {
            return Err(ConvertError::InvalidConfig(
                "chunk window must be ≥ 1 page".into(),
            ));
        }
        Ok(self.config)
    }
}
