//! Error types for the docmark library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConvertError`] — **Fatal**: the conversion could not be dispatched at
//!   all (bad request shape, unsupported format/engine combination, engine
//!   failed to initialise, missing input). Returned as `Err(ConvertError)`
//!   from the top-level `convert*` entry points, always *before* any backend
//!   call is attempted.
//!
//! * [`ChunkError`] — **Non-fatal**: a single chunk (page range) failed after
//!   dispatch. Stored inside [`crate::output::ChunkResult`] so callers can
//!   inspect partial success and re-request only the failed ranges rather
//!   than reprocessing the whole document.
//!
//! The split also encodes the retry contract: only `BackendTimeout` and
//! *transient* `BackendFailure` chunk errors are ever retried; everything in
//! `ConvertError` is rejected immediately.

use crate::registry::EngineId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the docmark library.
///
/// Chunk-level failures use [`ChunkError`] and are stored in
/// [`crate::output::ChunkResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Validation errors (pre-dispatch) ──────────────────────────────────
    /// The request shape is invalid (bad page range, empty input, …).
    #[error("Invalid request: {detail}")]
    InvalidRequest { detail: String },

    /// No engine exists for this input format.
    #[error("Unsupported format: '{format}'")]
    UnsupportedFormat { format: String },

    /// The format is known, but the requested engine policy is not
    /// available for it (e.g. `vlm` for a spreadsheet).
    #[error("Engine policy '{policy}' is not available for format '{format}'")]
    UnsupportedEngine { format: String, policy: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    InputNotFound { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Engine errors ─────────────────────────────────────────────────────
    /// Engine setup failed (model weights missing, tool not installed,
    /// remote session unreachable). The registry re-attempts lazily after
    /// a cool-down; [`crate::registry::EngineRegistry::reset`] clears the
    /// state immediately.
    #[error("Engine '{engine}' failed to initialise: {detail}")]
    EngineInitFailed { engine: EngineId, detail: String },

    // ── Aggregate errors (only via `ConversionResult::into_result`) ──────
    /// Every chunk failed; output would be empty.
    #[error("All {total} chunks failed.\nFirst error: {first_error}")]
    AllChunksFailed { total: usize, first_error: String },

    /// Some chunks succeeded but at least one failed.
    ///
    /// Returned by [`crate::output::ConversionResult::into_result`] when the
    /// caller wants to treat any chunk failure as an error.
    #[error("{failed}/{total} chunks failed during conversion.\nFirst error: {first_error}")]
    PartialFailure {
        failed: usize,
        total: usize,
        first_error: String,
    },

    /// The request was cancelled before producing a result.
    #[error("Conversion cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single chunk.
///
/// Stored in [`crate::output::ChunkResult`] when a chunk fails. The overall
/// conversion continues; the aggregate status reflects the mix.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ChunkError {
    /// The chunk never got a concurrency slot in time. Distinct from
    /// [`ChunkError::BackendTimeout`] so callers can tell "never got a
    /// chance to run" from "ran too long".
    #[error("Chunk {chunk}: no admission slot after {waited_ms}ms")]
    AdmissionTimeout { chunk: usize, waited_ms: u64 },

    /// The backend call exceeded its allotted time after being admitted.
    #[error("Chunk {chunk}: backend call timed out after {elapsed_ms}ms")]
    BackendTimeout { chunk: usize, elapsed_ms: u64 },

    /// The backend ran and reported a content-level failure.
    #[error("Chunk {chunk}: backend failed after {retries} retries: {detail}")]
    BackendFailure {
        chunk: usize,
        retries: u32,
        detail: String,
    },

    /// The two-stage legacy pipeline's first stage (conversion to the
    /// modern format) failed; the modern-format engine was never invoked.
    #[error("Chunk {chunk}: legacy conversion failed: {detail}")]
    LegacyConversionFailed { chunk: usize, detail: String },

    /// The request was cancelled while this chunk was pending or running.
    #[error("Chunk {chunk}: cancelled")]
    Cancelled { chunk: usize },
}

impl ChunkError {
    /// Index of the chunk this error belongs to.
    pub fn chunk(&self) -> usize {
        match self {
            Self::AdmissionTimeout { chunk, .. }
            | Self::BackendTimeout { chunk, .. }
            | Self::BackendFailure { chunk, .. }
            | Self::LegacyConversionFailed { chunk, .. }
            | Self::Cancelled { chunk } => *chunk,
        }
    }
}

/// What a backend adapter reports when a call fails.
///
/// This is the tagged outcome at the adapter boundary; the orchestrator's
/// retry loop folds it into a [`ChunkError`] once attempts are exhausted.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection reset, 5xx from a remote engine, engine process killed
    /// under memory pressure — worth retrying.
    #[error("transient backend failure: {detail}")]
    Transient { detail: String },

    /// Corrupt input, unreadable format internals, 4xx from a remote
    /// engine — retrying cannot help.
    #[error("backend failure: {detail}")]
    Fatal { detail: String },

    /// The engine or its tool is missing/unusable. Surfaced during
    /// initialisation as [`ConvertError::EngineInitFailed`].
    #[error("engine unavailable: {detail}")]
    Unavailable { detail: String },
}

impl BackendError {
    /// Whether the orchestrator's retry policy applies to this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
