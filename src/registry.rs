//! Engine registry: routing plus lazy, at-most-once engine initialisation.
//!
//! Heavy engines (model weights, a live inference session, a probed tool
//! chain) are process-wide resources. The registry owns one cell per
//! engine id with an explicit state machine:
//!
//! ```text
//! uninitialized ──init ok──▶ ready
//!       │  ▲
//!  init fails  cool-down elapsed
//!       ▼  │
//!    degraded
//! ```
//!
//! Initialisation runs at most once per engine id: the cell's async mutex
//! is held for the duration of the in-flight init, so concurrent
//! first-callers block on the same attempt instead of racing. A failed
//! init parks the engine in `degraded` — repeated requests get a fast
//! classified error instead of re-running an expensive doomed setup — and
//! a cool-down lets it re-attempt lazily later. [`EngineRegistry::reset`]
//! clears the state immediately (after an operator fixed the environment).
//!
//! Resolution itself is pure data: [`ROUTES`] maps (format, policy) to an
//! engine id. Adding a format or engine is a table edit.

use crate::backend::epub::EpubAdapter;
use crate::backend::image::ImageOcrAdapter;
use crate::backend::office::{OfficeAdapter, SofficeConverter};
use crate::backend::pdf::PdfPipelineAdapter;
use crate::backend::vlm::VlmAdapter;
use crate::backend::web::WebAdapter;
use crate::backend::{BackendAdapter, LegacyConverter};
use crate::config::{EngineSettings, OrchestratorConfig};
use crate::error::{BackendError, ConvertError};
use crate::request::{DocumentFormat, EnginePolicy};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Identity of one engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineId {
    /// GPU layout/OCR pipeline for PDFs.
    PdfPipeline,
    /// Remote vision-language-model engine for PDFs.
    PdfVlm,
    /// Modern office formats (docx, pptx, xlsx).
    Office,
    /// LibreOffice first stage for legacy binary formats.
    LegacyOffice,
    /// Web page fetch + HTML conversion.
    Web,
    Epub,
    ImageOcr,
}

impl EngineId {
    pub const ALL: [EngineId; 7] = [
        EngineId::PdfPipeline,
        EngineId::PdfVlm,
        EngineId::Office,
        EngineId::LegacyOffice,
        EngineId::Web,
        EngineId::Epub,
        EngineId::ImageOcr,
    ];
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PdfPipeline => "pdf-pipeline",
            Self::PdfVlm => "pdf-vlm",
            Self::Office => "office",
            Self::LegacyOffice => "legacy-office",
            Self::Web => "web",
            Self::Epub => "epub",
            Self::ImageOcr => "image-ocr",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for EngineId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf-pipeline" | "pipeline" => Ok(Self::PdfPipeline),
            "pdf-vlm" | "vlm" => Ok(Self::PdfVlm),
            "office" => Ok(Self::Office),
            "legacy-office" | "soffice" => Ok(Self::LegacyOffice),
            "web" => Ok(Self::Web),
            "epub" => Ok(Self::Epub),
            "image-ocr" | "ocr" => Ok(Self::ImageOcr),
            other => Err(format!("unknown engine id: '{other}'")),
        }
    }
}

/// Externally visible engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineHealth {
    Uninitialized,
    /// An initialisation attempt is in flight right now.
    Initializing,
    Ready,
    Degraded,
}

/// The routing table: (format, policy) → engine id.
///
/// Legacy formats route to the *modern* adapter; the orchestrator runs the
/// [`EngineId::LegacyOffice`] first stage before it. Combinations absent
/// from this table are `UnsupportedEngine` (known format) or
/// `UnsupportedFormat` (format absent entirely — cannot happen while every
/// format has at least one row, which `routes_cover_every_format` pins).
pub const ROUTES: &[(DocumentFormat, EnginePolicy, EngineId)] = &[
    (DocumentFormat::Pdf, EnginePolicy::Auto, EngineId::PdfPipeline),
    (DocumentFormat::Pdf, EnginePolicy::Text, EngineId::PdfPipeline),
    (DocumentFormat::Pdf, EnginePolicy::Ocr, EngineId::PdfPipeline),
    (DocumentFormat::Pdf, EnginePolicy::Vlm, EngineId::PdfVlm),
    (DocumentFormat::Docx, EnginePolicy::Auto, EngineId::Office),
    (DocumentFormat::Pptx, EnginePolicy::Auto, EngineId::Office),
    (DocumentFormat::Xlsx, EnginePolicy::Auto, EngineId::Office),
    (DocumentFormat::Doc, EnginePolicy::Auto, EngineId::Office),
    (DocumentFormat::Ppt, EnginePolicy::Auto, EngineId::Office),
    (DocumentFormat::Html, EnginePolicy::Auto, EngineId::Web),
    (DocumentFormat::Epub, EnginePolicy::Auto, EngineId::Epub),
    (DocumentFormat::Image, EnginePolicy::Auto, EngineId::ImageOcr),
    (DocumentFormat::Image, EnginePolicy::Ocr, EngineId::ImageOcr),
];

/// Pure table lookup; no engine is touched.
pub fn route(format: DocumentFormat, policy: EnginePolicy) -> Result<EngineId, ConvertError> {
    if let Some((_, _, id)) = ROUTES.iter().find(|(f, p, _)| *f == format && *p == policy) {
        return Ok(*id);
    }
    if ROUTES.iter().any(|(f, _, _)| *f == format) {
        Err(ConvertError::UnsupportedEngine {
            format: format.to_string(),
            policy: policy.to_string(),
        })
    } else {
        Err(ConvertError::UnsupportedFormat {
            format: format.to_string(),
        })
    }
}

type AdapterFactory =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn BackendAdapter>, BackendError>> + Send + Sync>;

enum CellState<T> {
    Uninitialized,
    Ready(T),
    Degraded { detail: String, since: Instant },
}

struct Cell<T> {
    factory: Box<dyn Fn() -> BoxFuture<'static, Result<T, BackendError>> + Send + Sync>,
    state: Mutex<CellState<T>>,
}

impl<T: Clone> Cell<T> {
    fn new(factory: Box<dyn Fn() -> BoxFuture<'static, Result<T, BackendError>> + Send + Sync>) -> Self {
        Self {
            factory,
            state: Mutex::new(CellState::Uninitialized),
        }
    }

    fn ready(value: T) -> Self
    where
        T: Send + 'static,
    {
        Self {
            factory: Box::new(|| unreachable!("pre-initialised cell never re-runs its factory")),
            state: Mutex::new(CellState::Ready(value)),
        }
    }

    /// Get the initialised value, running the factory at most once.
    ///
    /// The mutex is held across the init await, so concurrent first-callers
    /// queue behind the same attempt rather than double-initialising.
    async fn acquire(&self, id: EngineId, cooldown: Duration) -> Result<T, ConvertError> {
        let mut state = self.state.lock().await;
        match &*state {
            CellState::Ready(v) => return Ok(v.clone()),
            CellState::Degraded { detail, since } if since.elapsed() < cooldown => {
                return Err(ConvertError::EngineInitFailed {
                    engine: id,
                    detail: detail.clone(),
                });
            }
            CellState::Degraded { .. } => {
                info!(engine = %id, "cool-down elapsed, re-attempting initialisation");
            }
            CellState::Uninitialized => {
                info!(engine = %id, "initialising engine");
            }
        }

        match (self.factory)().await {
            Ok(v) => {
                info!(engine = %id, "engine ready");
                *state = CellState::Ready(v.clone());
                Ok(v)
            }
            Err(e) => {
                let detail = e.to_string();
                warn!(engine = %id, %detail, "engine initialisation failed");
                *state = CellState::Degraded {
                    detail: detail.clone(),
                    since: Instant::now(),
                };
                Err(ConvertError::EngineInitFailed { engine: id, detail })
            }
        }
    }

    fn health(&self) -> EngineHealth {
        match self.state.try_lock() {
            Err(_) => EngineHealth::Initializing,
            Ok(state) => match &*state {
                CellState::Uninitialized => EngineHealth::Uninitialized,
                CellState::Ready(_) => EngineHealth::Ready,
                CellState::Degraded { .. } => EngineHealth::Degraded,
            },
        }
    }

    async fn reset(&self) {
        *self.state.lock().await = CellState::Uninitialized;
    }
}

/// Owns every engine cell; shared process-wide behind an `Arc`.
pub struct EngineRegistry {
    cooldown: Duration,
    cells: HashMap<EngineId, Cell<Arc<dyn BackendAdapter>>>,
    legacy: Cell<Arc<dyn LegacyConverter>>,
}

impl EngineRegistry {
    /// Registry with the default (real) engine factories.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: &OrchestratorConfig) -> EngineRegistryBuilder {
        EngineRegistryBuilder {
            cooldown: config.engine_cooldown(),
            settings: config.engines.clone(),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            overrides: HashMap::new(),
            legacy_override: None,
        }
    }

    /// Resolve (format, policy) to a ready adapter, initialising lazily.
    pub async fn resolve(
        &self,
        format: DocumentFormat,
        policy: EnginePolicy,
    ) -> Result<Arc<dyn BackendAdapter>, ConvertError> {
        let id = route(format, policy)?;
        self.adapter(id).await
    }

    /// Ready adapter for an engine id, initialising lazily.
    pub async fn adapter(&self, id: EngineId) -> Result<Arc<dyn BackendAdapter>, ConvertError> {
        let cell = self
            .cells
            .get(&id)
            .ok_or_else(|| ConvertError::Internal(format!("engine '{id}' has no adapter cell")))?;
        cell.acquire(id, self.cooldown).await
    }

    /// The legacy-office first-stage converter, initialising lazily.
    pub async fn legacy_converter(&self) -> Result<Arc<dyn LegacyConverter>, ConvertError> {
        self.legacy.acquire(EngineId::LegacyOffice, self.cooldown).await
    }

    /// Pre-initialise an engine (deployment warm-up).
    pub async fn warm(&self, id: EngineId) -> Result<(), ConvertError> {
        if id == EngineId::LegacyOffice {
            self.legacy_converter().await.map(|_| ())
        } else {
            self.adapter(id).await.map(|_| ())
        }
    }

    /// Current lifecycle state of an engine, without touching it.
    pub fn health(&self, id: EngineId) -> EngineHealth {
        if id == EngineId::LegacyOffice {
            return self.legacy.health();
        }
        self.cells
            .get(&id)
            .map(|c| c.health())
            .unwrap_or(EngineHealth::Uninitialized)
    }

    /// Forget a degraded (or ready) engine so the next use re-initialises.
    pub async fn reset(&self, id: EngineId) {
        if id == EngineId::LegacyOffice {
            self.legacy.reset().await;
            return;
        }
        if let Some(cell) = self.cells.get(&id) {
            cell.reset().await;
        }
    }
}

/// Builder: default factories from [`EngineSettings`], with per-engine
/// overrides used by tests and by embedders with custom engines.
pub struct EngineRegistryBuilder {
    cooldown: Duration,
    settings: EngineSettings,
    download_timeout: Duration,
    overrides: HashMap<EngineId, Cell<Arc<dyn BackendAdapter>>>,
    legacy_override: Option<Cell<Arc<dyn LegacyConverter>>>,
}

impl EngineRegistryBuilder {
    /// Install a pre-initialised adapter for an engine id.
    pub fn adapter(mut self, id: EngineId, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.overrides.insert(id, Cell::ready(adapter));
        self
    }

    /// Install a custom initialisation factory for an engine id.
    pub fn adapter_factory(
        mut self,
        id: EngineId,
        factory: impl Fn() -> BoxFuture<'static, Result<Arc<dyn BackendAdapter>, BackendError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.overrides.insert(id, Cell::new(Box::new(factory)));
        self
    }

    /// Install a pre-initialised legacy converter.
    pub fn legacy_converter(mut self, converter: Arc<dyn LegacyConverter>) -> Self {
        self.legacy_override = Some(Cell::ready(converter));
        self
    }

    /// Install a custom legacy-converter factory.
    pub fn legacy_factory(
        mut self,
        factory: impl Fn() -> BoxFuture<'static, Result<Arc<dyn LegacyConverter>, BackendError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.legacy_override = Some(Cell::new(Box::new(factory)));
        self
    }

    pub fn build(mut self) -> EngineRegistry {
        let mut cells = HashMap::new();
        for id in EngineId::ALL {
            if id == EngineId::LegacyOffice {
                continue;
            }
            let cell = self
                .overrides
                .remove(&id)
                .unwrap_or_else(|| Cell::new(default_factory(id, &self.settings, self.download_timeout)));
            cells.insert(id, cell);
        }
        let legacy = self.legacy_override.take().unwrap_or_else(|| {
            let cmd = self.settings.soffice_cmd.clone();
            Cell::new(Box::new(move || {
                let cmd = cmd.clone();
                Box::pin(async move {
                    let conv = SofficeConverter::init(&cmd).await?;
                    Ok(Arc::new(conv) as Arc<dyn LegacyConverter>)
                })
            }))
        });
        EngineRegistry {
            cooldown: self.cooldown,
            cells,
            legacy,
        }
    }
}

fn default_factory(
    id: EngineId,
    settings: &EngineSettings,
    download_timeout: Duration,
) -> AdapterFactory {
    match id {
        EngineId::PdfPipeline => {
            let tool = settings.pipeline_cmd.clone();
            Box::new(move || {
                let tool = tool.clone();
                Box::pin(async move {
                    let a = PdfPipelineAdapter::init(&tool).await?;
                    Ok(Arc::new(a) as Arc<dyn BackendAdapter>)
                })
            })
        }
        EngineId::PdfVlm => {
            let url = settings.vlm_server_url.clone();
            Box::new(move || {
                let url = url.clone();
                Box::pin(async move {
                    let url = url.ok_or_else(|| BackendError::Unavailable {
                        detail: "vlm_server_url is not configured; the vlm policy needs one"
                            .into(),
                    })?;
                    let a = VlmAdapter::init(&url, Duration::from_secs(10)).await?;
                    Ok(Arc::new(a) as Arc<dyn BackendAdapter>)
                })
            })
        }
        EngineId::Office => {
            let tool = settings.office_cmd.clone();
            Box::new(move || {
                let tool = tool.clone();
                Box::pin(async move {
                    let a = OfficeAdapter::init(&tool).await?;
                    Ok(Arc::new(a) as Arc<dyn BackendAdapter>)
                })
            })
        }
        EngineId::Web => {
            let tool = settings.pandoc_cmd.clone();
            Box::new(move || {
                let tool = tool.clone();
                Box::pin(async move {
                    let a = WebAdapter::init(&tool, download_timeout).await?;
                    Ok(Arc::new(a) as Arc<dyn BackendAdapter>)
                })
            })
        }
        EngineId::Epub => {
            let tool = settings.pandoc_cmd.clone();
            Box::new(move || {
                let tool = tool.clone();
                Box::pin(async move {
                    let a = EpubAdapter::init(&tool).await?;
                    Ok(Arc::new(a) as Arc<dyn BackendAdapter>)
                })
            })
        }
        EngineId::ImageOcr => {
            let tool = settings.pipeline_cmd.clone();
            Box::new(move || {
                let tool = tool.clone();
                Box::pin(async move {
                    let a = ImageOcrAdapter::init(&tool).await?;
                    Ok(Arc::new(a) as Arc<dyn BackendAdapter>)
                })
            })
        }
        EngineId::LegacyOffice => {
            unreachable!("legacy converter has its own cell")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOutput, BackendRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct NoopAdapter;

    #[async_trait]
    impl BackendAdapter for NoopAdapter {
        fn id(&self) -> EngineId {
            EngineId::PdfPipeline
        }
        fn engine_class(&self) -> crate::governor::EngineClass {
            crate::governor::EngineClass::GpuModel
        }
        async fn convert(&self, _req: BackendRequest<'_>) -> Result<BackendOutput, BackendError> {
            Ok(BackendOutput {
                markdown: String::new(),
                pages_converted: 0,
                reached_end: true,
                warnings: Vec::new(),
            })
        }
    }

    fn registry_with_factory(
        init_calls: Arc<AtomicUsize>,
        fail_first: usize,
        cooldown_secs: u64,
    ) -> EngineRegistry {
        let config = OrchestratorConfig::builder()
            .engine_cooldown_secs(cooldown_secs)
            .build()
            .unwrap();
        EngineRegistry::builder(&config)
            .adapter_factory(EngineId::PdfPipeline, move || {
                let calls = Arc::clone(&init_calls);
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < fail_first {
                        Err(BackendError::Unavailable {
                            detail: "weights missing".into(),
                        })
                    } else {
                        Ok(Arc::new(NoopAdapter) as Arc<dyn BackendAdapter>)
                    }
                })
            })
            .build()
    }

    #[test]
    fn routes_cover_every_format() {
        use DocumentFormat::*;
        for format in [Pdf, Docx, Doc, Pptx, Ppt, Xlsx, Html, Epub, Image] {
            assert!(
                ROUTES.iter().any(|(f, _, _)| *f == format),
                "no route for {format}"
            );
        }
    }

    #[test]
    fn route_rejects_unavailable_policy() {
        let err = route(DocumentFormat::Xlsx, EnginePolicy::Vlm).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedEngine { .. }));
        let err = route(DocumentFormat::Epub, EnginePolicy::Ocr).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedEngine { .. }));
    }

    #[test]
    fn route_pdf_policies() {
        assert_eq!(
            route(DocumentFormat::Pdf, EnginePolicy::Auto).unwrap(),
            EngineId::PdfPipeline
        );
        assert_eq!(
            route(DocumentFormat::Pdf, EnginePolicy::Vlm).unwrap(),
            EngineId::PdfVlm
        );
    }

    #[tokio::test]
    async fn initialisation_runs_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = Arc::new(registry_with_factory(Arc::clone(&calls), 0, 60));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.adapter(EngineId::PdfPipeline).await.map(|_| ())
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reg.health(EngineId::PdfPipeline), EngineHealth::Ready);
    }

    #[tokio::test]
    async fn failed_init_degrades_and_respects_cooldown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = registry_with_factory(Arc::clone(&calls), 1, 3600);

        let err = reg.adapter(EngineId::PdfPipeline).await.unwrap_err();
        assert!(matches!(err, ConvertError::EngineInitFailed { .. }));
        assert_eq!(reg.health(EngineId::PdfPipeline), EngineHealth::Degraded);

        // Within the cool-down: no second factory run.
        let err = reg.adapter(EngineId::PdfPipeline).await.unwrap_err();
        assert!(err.to_string().contains("weights missing"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_cooldown_reattempts_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = registry_with_factory(Arc::clone(&calls), 1, 0);

        reg.adapter(EngineId::PdfPipeline).await.unwrap_err();
        // Second attempt runs the factory again and succeeds.
        reg.adapter(EngineId::PdfPipeline).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reset_clears_degraded_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = registry_with_factory(Arc::clone(&calls), 1, 3600);

        reg.adapter(EngineId::PdfPipeline).await.unwrap_err();
        reg.reset(EngineId::PdfPipeline).await;
        assert_eq!(reg.health(EngineId::PdfPipeline), EngineHealth::Uninitialized);
        reg.adapter(EngineId::PdfPipeline).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_initialises_without_a_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = registry_with_factory(Arc::clone(&calls), 0, 60);
        assert_eq!(reg.health(EngineId::PdfPipeline), EngineHealth::Uninitialized);
        reg.warm(EngineId::PdfPipeline).await.unwrap();
        assert_eq!(reg.health(EngineId::PdfPipeline), EngineHealth::Ready);
    }
}
