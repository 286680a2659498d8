//! Integration tests for the conversion orchestrator.
//!
//! Engines are replaced with scripted in-process adapters injected through
//! the registry builder, so every scenario — retries, partial failure,
//! legacy two-stage, cancellation, concurrency caps, open-ended planning —
//! runs hermetically with no external tools.

use async_trait::async_trait;
use docmark::backend::{BackendAdapter, BackendOutput, BackendRequest, LegacyConverter};
use docmark::{
    AggregateStatus, BackendError, CancelToken, ChunkError, ChunkState, ConversionRequest,
    ConvertError, DocumentFormat, EngineClass, EngineHealth, EngineId, EnginePolicy,
    EngineRegistry, Orchestrator, OrchestratorConfig, PageRange,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Test doubles ─────────────────────────────────────────────────────────

/// A scripted backend: optional per-chunk transient failures, optional
/// fixed document length for end-of-document reporting, optional delay,
/// with call and peak-concurrency accounting.
#[derive(Debug)]
struct ScriptedAdapter {
    id: EngineId,
    class: EngineClass,
    /// Real page count of the "document"; windows past it report the end.
    pages_total: Option<u32>,
    delay: Duration,
    /// seq → transient failures to emit before succeeding.
    transient_budget: Mutex<HashMap<usize, u32>>,
    always_fatal: bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    seen_inputs: Mutex<Vec<PathBuf>>,
}

impl ScriptedAdapter {
    fn new(id: EngineId, class: EngineClass) -> Self {
        Self {
            id,
            class,
            pages_total: None,
            delay: Duration::ZERO,
            transient_budget: Mutex::new(HashMap::new()),
            always_fatal: false,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen_inputs: Mutex::new(Vec::new()),
        }
    }

    fn pdf() -> Self {
        Self::new(EngineId::PdfPipeline, EngineClass::GpuModel)
    }

    fn with_transient_failures(self, seq: usize, count: u32) -> Self {
        self.transient_budget.lock().unwrap().insert(seq, count);
        self
    }

    fn with_pages_total(mut self, total: u32) -> Self {
        self.pages_total = Some(total);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn fatal(mut self) -> Self {
        self.always_fatal = true;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn id(&self) -> EngineId {
        self.id
    }

    fn engine_class(&self) -> EngineClass {
        self.class
    }

    async fn convert(&self, req: BackendRequest<'_>) -> Result<BackendOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Ok(path) = req.input.as_file() {
            self.seen_inputs.lock().unwrap().push(path.to_path_buf());
        }
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.always_fatal {
            return Err(BackendError::Fatal {
                detail: "corrupt object stream".into(),
            });
        }
        {
            let mut budget = self.transient_budget.lock().unwrap();
            if let Some(remaining) = budget.get_mut(&req.window.seq) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::Transient {
                        detail: "connection reset by engine".into(),
                    });
                }
            }
        }

        let seq = req.window.seq;
        match (self.pages_total, req.window.end) {
            (Some(total), Some(_)) if req.window.start >= total => Ok(BackendOutput {
                markdown: String::new(),
                pages_converted: 0,
                reached_end: true,
                warnings: Vec::new(),
            }),
            (Some(total), Some(end)) => {
                let last = end.min(total - 1);
                Ok(BackendOutput {
                    markdown: format!("## part {seq}"),
                    pages_converted: last - req.window.start + 1,
                    reached_end: end >= total - 1,
                    warnings: Vec::new(),
                })
            }
            _ => Ok(BackendOutput {
                markdown: format!("## part {seq}"),
                pages_converted: req.window.page_count().unwrap_or(1),
                reached_end: false,
                warnings: Vec::new(),
            }),
        }
    }
}

struct ScriptedLegacy {
    fail: bool,
    calls: AtomicUsize,
    produced: Mutex<Vec<PathBuf>>,
}

impl ScriptedLegacy {
    fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
            produced: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
            produced: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LegacyConverter for ScriptedLegacy {
    async fn convert_to_modern(
        &self,
        input: &std::path::Path,
        target_ext: &str,
        staging: &std::path::Path,
    ) -> Result<PathBuf, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BackendError::Fatal {
                detail: "soffice exited with code 77".into(),
            });
        }
        let stem = input.file_stem().unwrap().to_string_lossy();
        let out = staging.join(format!("{stem}.{target_ext}"));
        std::fs::write(&out, b"converted").unwrap();
        self.produced.lock().unwrap().push(out.clone());
        Ok(out)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::builder()
        .global_concurrency(8)
        .gpu_concurrency(8)
        .subprocess_concurrency(8)
        .retry_backoff_ms(1)
        .build()
        .unwrap()
}

fn fake_pdf(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("doc.pdf");
    std::fs::write(&path, b"%PDF-1.7\nstub").unwrap();
    path
}

fn orchestrator_with(
    config: OrchestratorConfig,
    id: EngineId,
    adapter: Arc<ScriptedAdapter>,
) -> Orchestrator {
    let registry = EngineRegistry::builder(&config)
        .adapter(id, adapter as Arc<dyn BackendAdapter>)
        .build();
    Orchestrator::with_registry(config, Arc::new(registry)).unwrap()
}

// ── Retry behaviour ──────────────────────────────────────────────────────

#[tokio::test]
async fn transient_failure_retries_to_success() {
    let dir = TempDir::new().unwrap();
    let pdf = fake_pdf(&dir);
    let adapter = Arc::new(ScriptedAdapter::pdf().with_transient_failures(1, 1));
    let orchestrator = orchestrator_with(fast_config(), EngineId::PdfPipeline, adapter.clone());

    let request = ConversionRequest::new(pdf.to_string_lossy(), DocumentFormat::Pdf)
        .with_pages(PageRange::bounded(0, 47));
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.status, AggregateStatus::Success);
    assert_eq!(result.stats.total_chunks, 3);
    assert_eq!(result.stats.total_retries, 1);
    // 3 chunks + 1 retried call.
    assert_eq!(adapter.calls(), 4);
    assert_eq!(result.markdown, "## part 0\n\n## part 1\n\n## part 2\n");
}

#[tokio::test]
async fn exhausted_retries_give_partial_result_with_gap_marker() {
    let dir = TempDir::new().unwrap();
    let pdf = fake_pdf(&dir);
    let config = OrchestratorConfig::builder()
        .global_concurrency(8)
        .gpu_concurrency(8)
        .max_retries(2)
        .retry_backoff_ms(1)
        .build()
        .unwrap();
    // More failures than the retry budget allows.
    let adapter = Arc::new(ScriptedAdapter::pdf().with_transient_failures(1, 99));
    let orchestrator = orchestrator_with(config, EngineId::PdfPipeline, adapter.clone());

    let request = ConversionRequest::new(pdf.to_string_lossy(), DocumentFormat::Pdf)
        .with_pages(PageRange::bounded(0, 47));
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.status, AggregateStatus::Partial);
    assert_eq!(result.failed_chunk_indices(), vec![1]);
    let failed = &result.chunks[1];
    assert_eq!(failed.state, ChunkState::Failed);
    assert_eq!(failed.retries, 2);
    assert!(matches!(
        failed.error,
        Some(ChunkError::BackendFailure { retries: 2, .. })
    ));
    // Surviving content plus a marker where chunk 1 should be.
    assert!(result.markdown.contains("## part 0"));
    assert!(result.markdown.contains("## part 2"));
    assert!(result.markdown.contains("<!-- chunk 1 (pages 16-31) failed:"));
    // Strict adapter rejects the partial.
    assert!(matches!(
        result.into_result(),
        Err(ConvertError::PartialFailure { failed: 1, total: 3, .. })
    ));
}

#[tokio::test]
async fn fatal_failure_is_never_retried() {
    let dir = TempDir::new().unwrap();
    let pdf = fake_pdf(&dir);
    let adapter = Arc::new(ScriptedAdapter::pdf().fatal());
    let orchestrator = orchestrator_with(fast_config(), EngineId::PdfPipeline, adapter.clone());

    let request = ConversionRequest::new(pdf.to_string_lossy(), DocumentFormat::Pdf)
        .with_pages(PageRange::bounded(0, 15));
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.status, AggregateStatus::Failed);
    assert_eq!(adapter.calls(), 1, "fatal errors must not burn retries");
    assert_eq!(result.chunks[0].retries, 0);
}

// ── Routing and validation ───────────────────────────────────────────────

#[tokio::test]
async fn unsupported_engine_fails_before_any_backend_work() {
    let config = fast_config();
    let registry = Arc::new(EngineRegistry::builder(&config).build());
    let orchestrator = Orchestrator::with_registry(config, Arc::clone(&registry)).unwrap();

    let request =
        ConversionRequest::new("sheet.xlsx", DocumentFormat::Xlsx).with_policy(EnginePolicy::Vlm);
    let err = orchestrator.convert(&request).await.unwrap_err();

    assert!(matches!(err, ConvertError::UnsupportedEngine { .. }));
    // Rejected before the office engine was ever initialised.
    assert_eq!(registry.health(EngineId::Office), EngineHealth::Uninitialized);
}

#[tokio::test]
async fn missing_input_fails_before_engine_init() {
    let config = fast_config();
    let registry = Arc::new(EngineRegistry::builder(&config).build());
    let orchestrator = Orchestrator::with_registry(config, Arc::clone(&registry)).unwrap();

    let request = ConversionRequest::new("/no/such/file.pdf", DocumentFormat::Pdf);
    let err = orchestrator.convert(&request).await.unwrap_err();

    assert!(matches!(err, ConvertError::InputNotFound { .. }));
    assert_eq!(
        registry.health(EngineId::PdfPipeline),
        EngineHealth::Uninitialized
    );
}

#[tokio::test]
async fn inverted_page_range_is_rejected() {
    let adapter = Arc::new(ScriptedAdapter::pdf());
    let orchestrator = orchestrator_with(fast_config(), EngineId::PdfPipeline, adapter.clone());

    let request = ConversionRequest::new("doc.pdf", DocumentFormat::Pdf)
        .with_pages(PageRange { start: 10, end: Some(2) });
    let err = orchestrator.convert(&request).await.unwrap_err();
    assert!(matches!(err, ConvertError::InvalidRequest { .. }));
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn vlm_policy_routes_to_the_vlm_engine() {
    let dir = TempDir::new().unwrap();
    let pdf = fake_pdf(&dir);
    let config = fast_config();
    let pipeline = Arc::new(ScriptedAdapter::pdf());
    let vlm = Arc::new(ScriptedAdapter::new(EngineId::PdfVlm, EngineClass::RemoteVlm));
    let registry = EngineRegistry::builder(&config)
        .adapter(EngineId::PdfPipeline, pipeline.clone() as Arc<dyn BackendAdapter>)
        .adapter(EngineId::PdfVlm, vlm.clone() as Arc<dyn BackendAdapter>)
        .build();
    let orchestrator = Orchestrator::with_registry(config, Arc::new(registry)).unwrap();

    let request = ConversionRequest::new(pdf.to_string_lossy(), DocumentFormat::Pdf)
        .with_policy(EnginePolicy::Vlm)
        .with_pages(PageRange::bounded(0, 15));
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.status, AggregateStatus::Success);
    assert_eq!(vlm.calls(), 1);
    assert_eq!(pipeline.calls(), 0);
}

// ── Legacy two-stage pipeline ────────────────────────────────────────────

#[tokio::test]
async fn legacy_failure_means_modern_engine_never_runs() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("minutes.doc");
    std::fs::write(&doc, b"legacy bytes").unwrap();

    let config = fast_config();
    let office = Arc::new(ScriptedAdapter::new(EngineId::Office, EngineClass::Subprocess));
    let legacy = Arc::new(ScriptedLegacy::failing());
    let registry = EngineRegistry::builder(&config)
        .adapter(EngineId::Office, office.clone() as Arc<dyn BackendAdapter>)
        .legacy_converter(legacy.clone() as Arc<dyn LegacyConverter>)
        .build();
    let orchestrator = Orchestrator::with_registry(config, Arc::new(registry)).unwrap();

    let request = ConversionRequest::new(doc.to_string_lossy(), DocumentFormat::Doc);
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.status, AggregateStatus::Failed);
    assert!(matches!(
        result.chunks[0].error,
        Some(ChunkError::LegacyConversionFailed { .. })
    ));
    assert_eq!(legacy.calls.load(Ordering::SeqCst), 1);
    assert_eq!(office.calls(), 0);
}

#[tokio::test]
async fn legacy_success_feeds_converted_file_to_modern_engine() {
    let dir = TempDir::new().unwrap();
    let ppt = dir.path().join("deck.ppt");
    std::fs::write(&ppt, b"legacy bytes").unwrap();

    let config = fast_config();
    let office = Arc::new(ScriptedAdapter::new(EngineId::Office, EngineClass::Subprocess));
    let legacy = Arc::new(ScriptedLegacy::ok());
    let registry = EngineRegistry::builder(&config)
        .adapter(EngineId::Office, office.clone() as Arc<dyn BackendAdapter>)
        .legacy_converter(legacy.clone() as Arc<dyn LegacyConverter>)
        .build();
    let orchestrator = Orchestrator::with_registry(config, Arc::new(registry)).unwrap();

    let request = ConversionRequest::new(ppt.to_string_lossy(), DocumentFormat::Ppt);
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.status, AggregateStatus::Success);
    // The office engine saw the staged pptx, not the original ppt.
    let produced = legacy.produced.lock().unwrap().clone();
    let seen = office.seen_inputs.lock().unwrap().clone();
    assert_eq!(seen, produced);
    assert!(seen[0].to_string_lossy().ends_with("deck.pptx"));
}

// ── Concurrency and cancellation ─────────────────────────────────────────

#[tokio::test]
async fn gpu_class_cap_bounds_in_flight_calls() {
    let dir = TempDir::new().unwrap();
    let pdf = fake_pdf(&dir);
    let config = OrchestratorConfig::builder()
        .global_concurrency(8)
        .gpu_concurrency(2)
        .retry_backoff_ms(1)
        .chunk_window(4)
        .build()
        .unwrap();
    let adapter =
        Arc::new(ScriptedAdapter::pdf().with_delay(Duration::from_millis(20)));
    let orchestrator = orchestrator_with(config, EngineId::PdfPipeline, adapter.clone());

    // 8 chunks of 4 pages.
    let request = ConversionRequest::new(pdf.to_string_lossy(), DocumentFormat::Pdf)
        .with_pages(PageRange::bounded(0, 31));
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.status, AggregateStatus::Success);
    assert_eq!(result.stats.total_chunks, 8);
    assert!(
        adapter.peak.load(Ordering::SeqCst) <= 2,
        "peak {} exceeded gpu cap 2",
        adapter.peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn cancellation_keeps_completed_chunks() {
    let dir = TempDir::new().unwrap();
    let pdf = fake_pdf(&dir);
    let config = OrchestratorConfig::builder()
        .global_concurrency(1)
        .gpu_concurrency(1)
        .retry_backoff_ms(1)
        .build()
        .unwrap();
    let adapter =
        Arc::new(ScriptedAdapter::pdf().with_delay(Duration::from_millis(100)));
    let orchestrator = orchestrator_with(config, EngineId::PdfPipeline, adapter.clone());

    let request = ConversionRequest::new(pdf.to_string_lossy(), DocumentFormat::Pdf)
        .with_pages(PageRange::bounded(0, 47));
    let cancel = CancelToken::new();

    let (result, ()) = tokio::join!(orchestrator.convert_cancellable(&request, &cancel), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
    });
    let result = result.unwrap();

    assert!(result.stats.succeeded_chunks >= 1, "first chunk had time to finish");
    assert!(result.stats.skipped_chunks >= 1, "later chunks were abandoned");
    let abandoned = result
        .chunks
        .iter()
        .find(|c| c.state == ChunkState::Skipped)
        .unwrap();
    assert!(matches!(abandoned.error, Some(ChunkError::Cancelled { .. })));
}

#[tokio::test]
async fn cancellation_before_dispatch_is_fatal() {
    let adapter = Arc::new(ScriptedAdapter::pdf());
    let orchestrator = orchestrator_with(fast_config(), EngineId::PdfPipeline, adapter.clone());
    let cancel = CancelToken::new();
    cancel.cancel();

    let request = ConversionRequest::new("doc.pdf", DocumentFormat::Pdf);
    let err = orchestrator
        .convert_cancellable(&request, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::Cancelled));
    assert_eq!(adapter.calls(), 0);
}

// ── Open-ended planning ──────────────────────────────────────────────────

#[tokio::test]
async fn unknown_length_truncates_at_reported_end() {
    let dir = TempDir::new().unwrap();
    let pdf = fake_pdf(&dir);
    let config = OrchestratorConfig::builder()
        .global_concurrency(8)
        .gpu_concurrency(8)
        .chunk_window(16)
        .speculative_windows(4)
        .retry_backoff_ms(1)
        .build()
        .unwrap();
    // 40 real pages: windows 0-15, 16-31 full; 32-47 reaches the end;
    // 48-63 is pure speculation.
    let adapter = Arc::new(ScriptedAdapter::pdf().with_pages_total(40));
    let orchestrator = orchestrator_with(config, EngineId::PdfPipeline, adapter.clone());

    let request = ConversionRequest::new(pdf.to_string_lossy(), DocumentFormat::Pdf);
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.status, AggregateStatus::Success);
    assert_eq!(result.stats.total_chunks, 4);
    assert_eq!(result.stats.succeeded_chunks, 3);
    assert_eq!(result.stats.skipped_chunks, 1);
    assert_eq!(result.chunks[3].state, ChunkState::Skipped);
    assert_eq!(result.markdown, "## part 0\n\n## part 1\n\n## part 2\n");
    // Exactly one wave: no second round of speculative calls.
    assert_eq!(adapter.calls(), 4);
}

#[tokio::test]
async fn non_paginated_input_is_a_single_unit_of_work() {
    let dir = TempDir::new().unwrap();
    let epub = dir.path().join("book.epub");
    std::fs::write(&epub, b"zip bytes").unwrap();

    let config = fast_config();
    let adapter = Arc::new(ScriptedAdapter::new(EngineId::Epub, EngineClass::Subprocess));
    let orchestrator = orchestrator_with(config, EngineId::Epub, adapter.clone());

    let request = ConversionRequest::new(epub.to_string_lossy(), DocumentFormat::Epub);
    let result = orchestrator.convert(&request).await.unwrap();

    assert_eq!(result.stats.total_chunks, 1);
    assert_eq!(adapter.calls(), 1);
    assert_eq!(result.chunks[0].end_page, None);
}
