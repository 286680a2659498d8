//! # docmark
//!
//! Convert documents to Markdown through a fleet of heavyweight engines,
//! without letting the engines fight each other for the machine.
//!
//! ## Why this crate?
//!
//! The engines that actually read documents well — GPU layout models,
//! vision-language-model servers, headless LibreOffice — are expensive and
//! fragile in different ways: multi-gigabyte weights, remote concurrency
//! ceilings, whole forked processes. Calling them naively from a concurrent
//! service means VRAM exhaustion, 429 storms, and a 900-page PDF pinning a
//! worker for an hour. This crate is the orchestration layer that makes
//! those engines usable: routing, lazy initialisation, chunked dispatch
//! under admission control, retries, and partial-success results.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request (path or URL, format, policy, page range)
//!  │
//!  ├─ 1. Route    (format, policy) → engine id; unsupported pairs fail fast
//!  ├─ 2. Resolve  validate local file, or stream a URL to a temp file
//!  ├─ 3. Plan     split the page range into bounded chunk windows
//!  ├─ 4. Admit    per-chunk ticket: global + engine-class concurrency caps
//!  ├─ 5. Call     backend adapter, per-call timeout, exponential retry
//!  └─ 6. Merge    plan-ordered Markdown + per-chunk outcomes and stats
//! ```
//!
//! Legacy office formats (doc, ppt) get a first stage inside step 5:
//! headless LibreOffice rewrites them to the modern format, and only on
//! success does the office engine run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docmark::{ConversionRequest, DocumentFormat, Orchestrator, OrchestratorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
//!     let request = ConversionRequest::new("report.pdf", DocumentFormat::Pdf);
//!     let result = orchestrator.convert(&request).await?;
//!     println!("{}", result.markdown);
//!     eprintln!(
//!         "{}/{} chunks converted",
//!         result.stats.succeeded_chunks, result.stats.total_chunks
//!     );
//!     Ok(())
//! }
//! ```
//!
//! A chunk that fails after its retry budget does not fail the conversion:
//! the result carries the surviving content, a gap marker at the failed
//! range, and enough per-chunk detail to re-request exactly the missing
//! pages. Call [`ConversionResult::into_result`] for strict
//! all-or-nothing semantics.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docmark` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when embedding the library:
//! ```toml
//! docmark = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod cancel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod governor;
pub mod input;
pub mod normalize;
pub mod orchestrate;
pub mod output;
pub mod progress;
pub mod registry;
pub mod request;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelToken;
pub use chunk::{ChunkPlan, ChunkWindow};
pub use config::{EngineSettings, OrchestratorConfig, OrchestratorConfigBuilder};
pub use error::{BackendError, ChunkError, ConvertError};
pub use governor::{ConcurrencyGovernor, EngineClass, GovernorLimits};
pub use orchestrate::Orchestrator;
pub use output::{AggregateStatus, ChunkResult, ChunkState, ConversionResult, ConversionStats};
pub use progress::ConversionProgressCallback;
pub use registry::{EngineHealth, EngineId, EngineRegistry};
pub use request::{
    ConversionRequest, DocumentFormat, EnginePolicy, InputRef, OutputOptions, PageRange,
};
