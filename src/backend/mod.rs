//! Backend adapters: one narrow wrapper per external engine family.
//!
//! Every engine — GPU layout model, remote VLM server, office converter,
//! web fetcher, ebook tool, image OCR — sits behind the same
//! [`BackendAdapter`] contract: `convert(request) -> output | error`. The
//! orchestrator neither knows nor cares what runs inside an adapter; it
//! only needs the engine class (for admission) and the tagged outcome (for
//! retry classification).
//!
//! Adapters never own engine state. The [`crate::registry::EngineRegistry`]
//! owns each initialised adapter behind an `Arc` and hands out borrows per
//! call.

pub mod epub;
pub mod exec;
pub mod image;
pub mod office;
pub mod pdf;
pub mod vlm;
pub mod web;

use crate::chunk::ChunkWindow;
use crate::error::BackendError;
use crate::governor::EngineClass;
use crate::registry::EngineId;
use crate::request::EnginePolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-call options forwarded to the engine.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Keep intermediate engine artifacts (layout JSON, extracted images).
    pub persist_intermediate: bool,
    /// Where to place intermediate artifacts when kept.
    pub artifacts_dir: Option<PathBuf>,
}

/// The input as the adapter receives it.
///
/// Most formats are resolved to a local file before dispatch (URL inputs
/// are downloaded first). Web pages are the exception: the web engine
/// fetches the URL itself, so it receives the URL as-is.
#[derive(Debug, Clone, Copy)]
pub enum ResolvedSource<'a> {
    File(&'a Path),
    Url(&'a str),
}

impl<'a> ResolvedSource<'a> {
    /// The local file path, for adapters whose engines require one.
    ///
    /// Routing guarantees URL pass-through only reaches the web engine;
    /// anything else seeing a URL is a wiring bug reported as a failure,
    /// not a panic.
    pub fn as_file(&self) -> Result<&'a Path, BackendError> {
        match self {
            Self::File(p) => Ok(p),
            Self::Url(u) => Err(BackendError::Fatal {
                detail: format!("engine requires a local file, got URL: {u}"),
            }),
        }
    }
}

/// One backend invocation: a resolved input plus the window to cover.
#[derive(Debug)]
pub struct BackendRequest<'a> {
    pub input: ResolvedSource<'a>,
    /// The page window this call covers. For non-paginated inputs the
    /// window is "the whole input" (`end = None`).
    pub window: ChunkWindow,
    /// Engine policy, meaningful only to engines with multiple modes.
    pub policy: EnginePolicy,
    pub options: &'a BackendOptions,
}

/// What a backend reports for one successful call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendOutput {
    /// Raw Markdown for the window, before normalization.
    pub markdown: String,
    /// Pages actually present in the window. Less than the window size
    /// means the document ended inside the window.
    pub pages_converted: u32,
    /// The document end lies inside or before this window; for open-ended
    /// plans this terminates speculative dispatch.
    pub reached_end: bool,
    /// Non-fatal diagnostics (dropped tables, low-confidence OCR regions).
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Uniform call contract every engine family implements.
#[async_trait]
pub trait BackendAdapter: Send + Sync + std::fmt::Debug {
    fn id(&self) -> EngineId;

    /// Which admission cap this adapter's calls are charged against.
    fn engine_class(&self) -> EngineClass;

    async fn convert(&self, req: BackendRequest<'_>) -> Result<BackendOutput, BackendError>;
}

/// First stage of the legacy-office pipeline: convert an older binary
/// format (doc, ppt) to its modern equivalent before the normal adapter
/// runs. A retryable backend call in its own right.
#[async_trait]
pub trait LegacyConverter: Send + Sync {
    /// Convert `input` into `staging` with the given modern extension
    /// (`docx` for doc, `pptx` for ppt), returning the converted file's
    /// path.
    async fn convert_to_modern(
        &self,
        input: &Path,
        target_ext: &str,
        staging: &Path,
    ) -> Result<PathBuf, BackendError>;
}
