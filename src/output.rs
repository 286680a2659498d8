//! Output types: the normalized result shape every backend folds into.
//!
//! A [`ConversionResult`] is built once by the result normalizer and never
//! mutated afterwards — a retried conversion produces a new result. The
//! per-chunk statuses are kept alongside the assembled Markdown so a caller
//! facing a partial success can see exactly which page ranges failed, why,
//! and re-request just those.

use crate::error::{ChunkError, ConvertError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of one chunk (page-range) conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Success,
    Failed,
    /// Dispatched speculatively past the true document end, or abandoned
    /// after cancellation; contributes no content and no failure.
    Skipped,
}

/// Result of a single chunk, produced by the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    /// Plan sequence index; merge order is ascending `seq`.
    pub seq: usize,
    /// First page this chunk covered (0-indexed).
    pub start_page: u32,
    /// Last page, inclusive; `None` for "whole input" chunks.
    pub end_page: Option<u32>,
    pub state: ChunkState,
    /// Cleaned Markdown for a successful chunk; empty otherwise.
    pub markdown: String,
    /// Cause of failure, present iff `state == Failed`
    /// (or `Skipped` after cancellation).
    pub error: Option<ChunkError>,
    /// Wall-clock time from admission wait to outcome.
    pub duration_ms: u64,
    /// Retries performed before this outcome.
    pub retries: u32,
    /// Non-fatal diagnostics reported by the backend.
    pub warnings: Vec<String>,
}

impl ChunkResult {
    pub fn is_success(&self) -> bool {
        self.state == ChunkState::Success
    }
}

/// Aggregate status over all chunks of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    /// Every chunk succeeded.
    Success,
    /// Some chunks succeeded, some failed; content assembled from the
    /// successes only.
    Partial,
    /// No chunk succeeded; no content.
    Failed,
}

/// Timing and counting metadata for one conversion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_chunks: usize,
    pub succeeded_chunks: usize,
    pub failed_chunks: usize,
    pub skipped_chunks: usize,
    /// Sum of retries across all chunks.
    pub total_retries: u32,
    /// Time spent in backend calls (sum over chunks; overlaps under
    /// concurrency, so this can exceed `total_duration_ms`).
    pub backend_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// The normalized output of one conversion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Assembled Markdown, plan-ordered, from successful chunks only.
    pub markdown: String,
    /// Per-chunk outcomes in plan order.
    pub chunks: Vec<ChunkResult>,
    pub status: AggregateStatus,
    pub stats: ConversionStats,
    /// Diagnostic detail of the first failed chunk, kept verbatim so the
    /// top-level summary stays actionable.
    pub first_error: Option<String>,
    /// Files written on behalf of the request by the caller-facing layer.
    /// The core never writes here; the CLI fills it in after persisting.
    pub persisted: Vec<PathBuf>,
}

impl ConversionResult {
    /// Indices of failed chunks, for re-requesting just those ranges.
    pub fn failed_chunk_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Failed)
            .map(|c| c.seq)
            .collect()
    }

    /// Treat anything short of full success as an error.
    ///
    /// The orchestrator itself never fails for post-dispatch problems; this
    /// adapter is for callers that want strict all-or-nothing semantics.
    pub fn into_result(self) -> Result<Self, ConvertError> {
        match self.status {
            AggregateStatus::Success => Ok(self),
            AggregateStatus::Partial => Err(ConvertError::PartialFailure {
                failed: self.stats.failed_chunks,
                total: self.stats.total_chunks,
                first_error: self.first_error.unwrap_or_else(|| "unknown".into()),
            }),
            AggregateStatus::Failed => Err(ConvertError::AllChunksFailed {
                total: self.stats.total_chunks,
                first_error: self.first_error.unwrap_or_else(|| "unknown".into()),
            }),
        }
    }
}
