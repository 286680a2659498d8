//! The conversion orchestrator: validate, resolve, plan, dispatch, merge.
//!
//! [`Orchestrator::convert`] is the library's main entry point. One call
//! runs the whole pipeline for a request:
//!
//! 1. **Validate** the request shape and the (format, policy) routing —
//!    anything unsupported is rejected here, before any engine spins up.
//! 2. **Resolve** the input: local-path checks, or a streamed download for
//!    URL inputs (web pages pass through to the web engine).
//! 3. **Plan** the page range into chunk windows.
//! 4. **Dispatch** chunks concurrently. Each chunk waits for an admission
//!    ticket from the [`ConcurrencyGovernor`], then calls the backend with
//!    a per-call timeout and an exponential-backoff retry budget for
//!    transient failures. Legacy office inputs run the LibreOffice first
//!    stage inside the chunk, so it shares the chunk's retry budget, and
//!    its failure means the modern engine is never invoked.
//! 5. **Merge** per-chunk outcomes into a [`ConversionResult`] in plan
//!    order, partial successes included.
//!
//! Post-dispatch failures never abort the conversion: a chunk that fails
//! after retries becomes a `Failed` entry in the result and the rest of the
//! document still converts. Only pre-dispatch problems (bad request,
//! unreachable input, engine init failure) surface as `Err(ConvertError)`.

use crate::backend::{BackendAdapter, BackendOptions, BackendRequest, LegacyConverter, ResolvedSource};
use crate::cancel::CancelToken;
use crate::chunk::{ChunkPlan, ChunkWindow};
use crate::config::OrchestratorConfig;
use crate::error::{ChunkError, ConvertError};
use crate::governor::{AdmitError, ConcurrencyGovernor};
use crate::input;
use crate::normalize;
use crate::output::{ChunkResult, ChunkState, ConversionResult};
use crate::progress::ConversionProgressCallback;
use crate::registry::{self, EngineRegistry};
use crate::request::ConversionRequest;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Orchestrates conversions against a shared engine registry.
///
/// Cheap to share behind an `Arc`; all mutable state lives in the registry
/// cells and the governor's semaphores.
pub struct Orchestrator {
    config: OrchestratorConfig,
    governor: ConcurrencyGovernor,
    registry: Arc<EngineRegistry>,
    client: reqwest::Client,
}

/// What one chunk task produced, before truncation and merge.
struct ChunkOutcome {
    result: ChunkResult,
    /// The backend saw the document end inside (or before) this window.
    reached_end: bool,
}

/// Shared per-request context borrowed by every chunk task.
struct ChunkCtx<'a> {
    adapter: &'a Arc<dyn BackendAdapter>,
    legacy: Option<LegacyStage<'a>>,
    source: ResolvedSource<'a>,
    options: &'a BackendOptions,
    request: &'a ConversionRequest,
    call_timeout: Duration,
    cancel: &'a CancelToken,
}

struct LegacyStage<'a> {
    converter: &'a Arc<dyn LegacyConverter>,
    target_ext: &'a str,
    staging: &'a Path,
}

impl Orchestrator {
    /// An orchestrator with the default (real) engines.
    pub fn new(config: OrchestratorConfig) -> Result<Self, ConvertError> {
        let registry = Arc::new(EngineRegistry::from_config(&config));
        Self::with_registry(config, registry)
    }

    /// An orchestrator over a caller-built registry (custom or mock
    /// engines).
    pub fn with_registry(
        config: OrchestratorConfig,
        registry: Arc<EngineRegistry>,
    ) -> Result<Self, ConvertError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("docmark/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConvertError::Internal(format!("http client construction: {e}")))?;
        let governor = ConcurrencyGovernor::new(config.governor_limits());
        Ok(Self {
            config,
            governor,
            registry,
            client,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The engine registry, for warm-up and health reporting.
    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Convert one document. Equivalent to [`Self::convert_cancellable`]
    /// with a token nobody cancels.
    pub async fn convert(
        &self,
        request: &ConversionRequest,
    ) -> Result<ConversionResult, ConvertError> {
        self.convert_cancellable(request, &CancelToken::new()).await
    }

    /// Convert one document, abandoning promptly if `cancel` fires.
    ///
    /// Cancellation before dispatch returns [`ConvertError::Cancelled`].
    /// Cancellation mid-flight returns `Ok` with the chunks that completed;
    /// abandoned chunks appear as `Skipped` with a cancellation error, so
    /// partial content survives an interactive Ctrl-C.
    pub async fn convert_cancellable(
        &self,
        request: &ConversionRequest,
        cancel: &CancelToken,
    ) -> Result<ConversionResult, ConvertError> {
        let started = Instant::now();
        let format = request.format();

        if let Some(detail) = request.pages().validate() {
            return Err(ConvertError::InvalidRequest { detail });
        }
        // Fail fast on an unroutable (format, policy) pair: no download, no
        // engine initialisation, no backend call.
        let engine_id = registry::route(format, request.policy())?;
        info!(
            input = %request.input(),
            %format,
            policy = %request.policy(),
            engine = %engine_id,
            pages = %request.pages(),
            "conversion started"
        );
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        let resolved = tokio::select! {
            _ = cancel.cancelled() => return Err(ConvertError::Cancelled),
            resolved = input::resolve(
                request.input(),
                format,
                &self.client,
                Duration::from_secs(self.config.download_timeout_secs),
            ) => resolved?,
        };

        let adapter = self.registry.adapter(engine_id).await?;
        let legacy_converter: Option<Arc<dyn LegacyConverter>> = if format.is_legacy() {
            Some(self.registry.legacy_converter().await?)
        } else {
            None
        };
        // Staging dir for the legacy first stage; removed on drop at the
        // end of this call unless the request keeps intermediates.
        let staging: Option<TempDir> = match &legacy_converter {
            Some(_) => Some(TempDir::new().map_err(|e| {
                ConvertError::Internal(format!("could not create staging directory: {e}"))
            })?),
            None => None,
        };

        let options = BackendOptions {
            persist_intermediate: request.output().persist_intermediate,
            artifacts_dir: request.output().output_dir.clone(),
        };
        let call_timeout = request.timeout().unwrap_or_else(|| self.config.call_timeout());
        let target_ext = format.modern_equivalent().to_string();

        let plan = ChunkPlan::plan(request.pages(), self.config.chunk_window, format.is_paginated());
        self.emit(|p| p.on_plan_ready(plan.len()));
        debug!(chunks = plan.len(), open_ended = plan.is_open_ended(), "plan ready");

        let ctx = ChunkCtx {
            adapter: &adapter,
            legacy: match (&legacy_converter, &staging) {
                (Some(converter), Some(dir)) => Some(LegacyStage {
                    converter,
                    target_ext: &target_ext,
                    staging: dir.path(),
                }),
                _ => None,
            },
            source: resolved.source(),
            options: &options,
            request,
            call_timeout,
            cancel,
        };

        let outcomes = if plan.is_open_ended() {
            self.run_open_ended(&ctx, &plan).await
        } else {
            stream::iter(plan.windows().iter().copied())
                .map(|window| self.run_chunk(&ctx, window))
                .buffer_unordered(self.config.global_concurrency)
                .collect::<Vec<_>>()
                .await
        };

        let results: Vec<ChunkResult> = outcomes.into_iter().map(|o| o.result).collect();
        let result = normalize::merge(results, started.elapsed().as_millis() as u64);
        self.emit(|p| p.on_complete(result.stats.total_chunks, result.stats.succeeded_chunks));
        info!(
            status = ?result.status,
            chunks = result.stats.total_chunks,
            succeeded = result.stats.succeeded_chunks,
            failed = result.stats.failed_chunks,
            retries = result.stats.total_retries,
            elapsed_ms = result.stats.total_duration_ms,
            "conversion finished"
        );
        Ok(result)
    }

    /// Dispatch speculative waves until a window reports end-of-document.
    ///
    /// The true page count is unknown; waves of `speculative_windows`
    /// full-size windows go out and the plan truncates at the first window
    /// that reached the end. Windows past that point were speculation and
    /// become `Skipped`. A wave with a real failure and no end-of-document
    /// stops speculation too — past-the-end and genuinely-broken look the
    /// same from here, and the failed entry carries the detail either way.
    async fn run_open_ended(&self, ctx: &ChunkCtx<'_>, plan: &ChunkPlan) -> Vec<ChunkOutcome> {
        let wave_size = self.config.speculative_windows.max(1);
        let mut outcomes: Vec<ChunkOutcome> = Vec::new();
        let mut next_seq = 0usize;

        loop {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let windows: Vec<ChunkWindow> =
                (next_seq..next_seq + wave_size).map(|seq| plan.window_at(seq)).collect();
            next_seq += wave_size;

            let mut wave: Vec<ChunkOutcome> = stream::iter(windows)
                .map(|window| self.run_chunk(ctx, window))
                .buffer_unordered(self.config.global_concurrency)
                .collect()
                .await;

            let reached_end = wave.iter().any(|o| o.reached_end);
            let failed = wave.iter().any(|o| o.result.state == ChunkState::Failed);
            outcomes.append(&mut wave);
            if reached_end || failed || ctx.cancel.is_cancelled() {
                break;
            }
        }

        // Reclassify everything past the first end-reporting window: those
        // chunks covered pages that do not exist.
        if let Some(end_seq) = outcomes
            .iter()
            .filter(|o| o.reached_end)
            .map(|o| o.result.seq)
            .min()
        {
            for outcome in &mut outcomes {
                if outcome.result.seq > end_seq {
                    let window = ChunkWindow {
                        seq: outcome.result.seq,
                        start: outcome.result.start_page,
                        end: outcome.result.end_page,
                    };
                    outcome.result = normalize::skipped_chunk(window, None);
                }
            }
        }
        outcomes
    }

    /// Run one chunk to a final outcome: admission, backend call, retries.
    /// Never returns early without a result — every chunk settles.
    async fn run_chunk(&self, ctx: &ChunkCtx<'_>, window: ChunkWindow) -> ChunkOutcome {
        let started = Instant::now();
        let seq = window.seq;

        let _ticket = match self
            .governor
            .admit(ctx.adapter.engine_class(), self.config.admission_timeout(), ctx.cancel)
            .await
        {
            Ok(ticket) => ticket,
            Err(AdmitError::Timeout { waited_ms }) => {
                let error = ChunkError::AdmissionTimeout { chunk: seq, waited_ms };
                warn!(chunk = seq, waited_ms, "admission timed out");
                self.emit(|p| p.on_chunk_error(seq, &error.to_string()));
                return ChunkOutcome {
                    result: normalize::failed_chunk(window, error, elapsed_ms(started), 0),
                    reached_end: false,
                };
            }
            Err(AdmitError::Cancelled) => return cancelled_outcome(window),
        };
        self.emit(|p| p.on_chunk_start(seq));

        let mut retries: u32 = 0;
        let mut modern_input: Option<PathBuf> = None;
        loop {
            if ctx.cancel.is_cancelled() {
                return cancelled_outcome(window);
            }

            // Legacy first stage, once per chunk; its success is cached so
            // a transient modern-engine failure does not re-run soffice.
            if let Some(stage) = &ctx.legacy {
                if modern_input.is_none() {
                    match self.run_legacy_stage(ctx, stage, seq).await {
                        Ok(path) => modern_input = Some(path),
                        Err(StageFailure::Retry(detail)) if retries < self.config.max_retries => {
                            warn!(chunk = seq, %detail, "legacy stage failed, retrying");
                            retries += 1;
                            if !self.backoff(retries, ctx.cancel).await {
                                return cancelled_outcome(window);
                            }
                            continue;
                        }
                        Err(StageFailure::Retry(detail)) | Err(StageFailure::Final(detail)) => {
                            let error = ChunkError::LegacyConversionFailed { chunk: seq, detail };
                            self.emit(|p| p.on_chunk_error(seq, &error.to_string()));
                            return ChunkOutcome {
                                result: normalize::failed_chunk(
                                    window,
                                    error,
                                    elapsed_ms(started),
                                    retries,
                                ),
                                reached_end: false,
                            };
                        }
                    }
                }
            }

            let source = match &modern_input {
                Some(path) => ResolvedSource::File(path),
                None => ctx.source,
            };
            let backend_request = BackendRequest {
                input: source,
                window,
                policy: ctx.request.policy(),
                options: ctx.options,
            };

            let attempt = tokio::select! {
                _ = ctx.cancel.cancelled() => return cancelled_outcome(window),
                attempt = tokio::time::timeout(ctx.call_timeout, ctx.adapter.convert(backend_request)) => attempt,
            };

            match attempt {
                Ok(Ok(output)) => {
                    let reached_end = output.reached_end
                        || window
                            .page_count()
                            .is_some_and(|n| output.pages_converted < n);
                    debug!(chunk = seq, pages = output.pages_converted, reached_end, "chunk converted");
                    let result =
                        normalize::success_chunk(window, output, elapsed_ms(started), retries);
                    self.emit(|p| p.on_chunk_complete(seq, result.markdown.len()));
                    return ChunkOutcome { result, reached_end };
                }
                Ok(Err(e)) if e.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    warn!(chunk = seq, retry = retries, error = %e, "transient backend failure, retrying");
                    if !self.backoff(retries, ctx.cancel).await {
                        return cancelled_outcome(window);
                    }
                }
                Ok(Err(e)) => {
                    let error = ChunkError::BackendFailure {
                        chunk: seq,
                        retries,
                        detail: e.to_string(),
                    };
                    warn!(chunk = seq, retries, error = %e, "chunk failed");
                    self.emit(|p| p.on_chunk_error(seq, &error.to_string()));
                    return ChunkOutcome {
                        result: normalize::failed_chunk(window, error, elapsed_ms(started), retries),
                        reached_end: false,
                    };
                }
                Err(_) if retries < self.config.max_retries => {
                    retries += 1;
                    warn!(chunk = seq, retry = retries, timeout_ms = ctx.call_timeout.as_millis() as u64, "backend call timed out, retrying");
                    if !self.backoff(retries, ctx.cancel).await {
                        return cancelled_outcome(window);
                    }
                }
                Err(_) => {
                    let error = ChunkError::BackendTimeout {
                        chunk: seq,
                        elapsed_ms: ctx.call_timeout.as_millis() as u64,
                    };
                    self.emit(|p| p.on_chunk_error(seq, &error.to_string()));
                    return ChunkOutcome {
                        result: normalize::failed_chunk(window, error, elapsed_ms(started), retries),
                        reached_end: false,
                    };
                }
            }
        }
    }

    async fn run_legacy_stage(
        &self,
        ctx: &ChunkCtx<'_>,
        stage: &LegacyStage<'_>,
        seq: usize,
    ) -> Result<PathBuf, StageFailure> {
        let input = ctx
            .source
            .as_file()
            .map_err(|e| StageFailure::Final(e.to_string()))?;
        debug!(chunk = seq, target = stage.target_ext, "running legacy first stage");
        match stage
            .converter
            .convert_to_modern(input, stage.target_ext, stage.staging)
            .await
        {
            Ok(path) => Ok(path),
            Err(e) if e.is_retryable() => Err(StageFailure::Retry(e.to_string())),
            Err(e) => Err(StageFailure::Final(e.to_string())),
        }
    }

    /// Sleep out the backoff for retry number `retry` (1-based), racing
    /// cancellation. Returns `false` when cancelled.
    async fn backoff(&self, retry: u32, cancel: &CancelToken) -> bool {
        let delay = backoff_delay(self.config.retry_backoff_ms, retry);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn emit(&self, f: impl FnOnce(&dyn ConversionProgressCallback)) {
        if let Some(cb) = &self.config.progress_callback {
            f(cb.as_ref());
        }
    }
}

/// Exponential backoff: `base * 2^(retry-1)`, capped to avoid overflow.
fn backoff_delay(base_ms: u64, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn cancelled_outcome(window: ChunkWindow) -> ChunkOutcome {
    ChunkOutcome {
        result: normalize::skipped_chunk(
            window,
            Some(ChunkError::Cancelled { chunk: window.seq }),
        ),
        reached_end: false,
    }
}

enum StageFailure {
    /// Transient; eligible for the chunk's retry budget.
    Retry(String),
    /// Permanent; the modern engine is never invoked.
    Final(String),
}
