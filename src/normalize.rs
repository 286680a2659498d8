//! Result normalization: per-chunk cleanup and plan-ordered merge.
//!
//! Backends return raw Markdown with engine quirks — the whole payload
//! wrapped in a code fence, CRLF line endings, trailing whitespace, runs of
//! blank lines. [`clean_markdown`] fixes those once, at the boundary, so
//! merge and every consumer downstream see uniform text.
//!
//! [`merge`] assembles the final document strictly in plan (`seq`) order
//! regardless of the order chunks completed in. Failed chunks leave an HTML
//! comment at their position so a reader of a partial document can see
//! where content is missing and why, without consulting the result struct.

use crate::backend::BackendOutput;
use crate::chunk::ChunkWindow;
use crate::error::ChunkError;
use crate::output::{
    AggregateStatus, ChunkResult, ChunkState, ConversionResult, ConversionStats,
};
use once_cell::sync::Lazy;
use regex::Regex;

// Matches ```markdown / ``` / ```md fences wrapping the entire payload.
static FULL_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A\s*```(?:markdown|md)?\s*\n(.*?)\n?```\s*\z")
        .unwrap_or_else(|e| panic!("fence regex: {e}"))
});

static TRAILING_WS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+\n").unwrap_or_else(|e| panic!("ws regex: {e}")));

static EXCESS_BLANKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").unwrap_or_else(|e| panic!("blanks regex: {e}")));

/// Clean one chunk's raw Markdown. Idempotent.
pub fn clean_markdown(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n");

    // Engines that answer through an LLM sometimes fence the whole reply.
    let text = match FULL_FENCE.captures(&text) {
        Some(caps) => caps[1].to_string(),
        None => text,
    };

    let text = TRAILING_WS.replace_all(&text, "\n");
    let text = EXCESS_BLANKS.replace_all(&text, "\n\n");

    let trimmed = text.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

/// Build the result of a successful chunk, cleaning its Markdown.
pub fn success_chunk(
    window: ChunkWindow,
    output: BackendOutput,
    duration_ms: u64,
    retries: u32,
) -> ChunkResult {
    ChunkResult {
        seq: window.seq,
        start_page: window.start,
        end_page: window.end,
        state: ChunkState::Success,
        markdown: clean_markdown(&output.markdown),
        error: None,
        duration_ms,
        retries,
        warnings: output.warnings,
    }
}

/// Build the result of a failed chunk.
pub fn failed_chunk(
    window: ChunkWindow,
    error: ChunkError,
    duration_ms: u64,
    retries: u32,
) -> ChunkResult {
    ChunkResult {
        seq: window.seq,
        start_page: window.start,
        end_page: window.end,
        state: ChunkState::Failed,
        markdown: String::new(),
        error: Some(error),
        duration_ms,
        retries,
        warnings: Vec::new(),
    }
}

/// Build the result of a chunk that never ran (speculation past the
/// document end, or pending work at cancellation).
pub fn skipped_chunk(window: ChunkWindow, error: Option<ChunkError>) -> ChunkResult {
    ChunkResult {
        seq: window.seq,
        start_page: window.start,
        end_page: window.end,
        state: ChunkState::Skipped,
        markdown: String::new(),
        error,
        duration_ms: 0,
        retries: 0,
        warnings: Vec::new(),
    }
}

fn gap_marker(chunk: &ChunkResult) -> String {
    let pages = match chunk.end_page {
        Some(end) if end != chunk.start_page => format!("pages {}-{}", chunk.start_page, end),
        Some(_) => format!("page {}", chunk.start_page),
        None => "input".to_string(),
    };
    let detail = chunk
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string());
    format!("<!-- chunk {} ({pages}) failed: {detail} -->", chunk.seq)
}

/// Assemble per-chunk outcomes into the final [`ConversionResult`].
///
/// Chunks arrive in completion order; the merge re-establishes plan order,
/// joins successful content with blank lines, and leaves a gap marker
/// where a chunk failed. Skipped chunks contribute nothing.
pub fn merge(mut chunks: Vec<ChunkResult>, total_duration_ms: u64) -> ConversionResult {
    chunks.sort_by_key(|c| c.seq);

    let mut stats = ConversionStats {
        total_chunks: chunks.len(),
        total_duration_ms,
        ..Default::default()
    };
    let mut parts: Vec<String> = Vec::new();
    let mut first_error: Option<String> = None;

    for chunk in &chunks {
        stats.total_retries += chunk.retries;
        stats.backend_duration_ms += chunk.duration_ms;
        match chunk.state {
            ChunkState::Success => {
                stats.succeeded_chunks += 1;
                if !chunk.markdown.is_empty() {
                    parts.push(chunk.markdown.trim_end().to_string());
                }
            }
            ChunkState::Failed => {
                stats.failed_chunks += 1;
                if first_error.is_none() {
                    first_error = chunk.error.as_ref().map(|e| e.to_string());
                }
                parts.push(gap_marker(chunk));
            }
            ChunkState::Skipped => {
                stats.skipped_chunks += 1;
            }
        }
    }

    let status = if stats.failed_chunks == 0 && stats.succeeded_chunks > 0 {
        AggregateStatus::Success
    } else if stats.succeeded_chunks > 0 {
        AggregateStatus::Partial
    } else {
        AggregateStatus::Failed
    };

    let markdown = if parts.is_empty() {
        String::new()
    } else {
        format!("{}\n", parts.join("\n\n"))
    };

    ConversionResult {
        markdown,
        chunks,
        status,
        stats,
        first_error,
        persisted: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(seq: usize) -> ChunkWindow {
        ChunkWindow {
            seq,
            start: seq as u32 * 16,
            end: Some(seq as u32 * 16 + 15),
        }
    }

    fn ok_chunk(seq: usize, text: &str) -> ChunkResult {
        success_chunk(
            window(seq),
            BackendOutput {
                markdown: text.to_string(),
                pages_converted: 16,
                reached_end: false,
                warnings: Vec::new(),
            },
            10,
            0,
        )
    }

    #[test]
    fn strips_wrapping_fence() {
        assert_eq!(clean_markdown("```markdown\n# Title\n\nBody\n```"), "# Title\n\nBody\n");
        assert_eq!(clean_markdown("```\ntext\n```"), "text\n");
        // An interior fence is content, not wrapping.
        let interior = "para\n\n```rust\nfn main() {}\n```\n\nmore";
        assert_eq!(clean_markdown(interior), format!("{interior}\n"));
    }

    #[test]
    fn normalises_line_endings_and_whitespace() {
        assert_eq!(clean_markdown("a  \r\nb\t\r\n"), "a\nb\n");
        assert_eq!(clean_markdown("a\n\n\n\n\nb"), "a\n\nb\n");
        assert_eq!(clean_markdown("   \n \n"), "");
    }

    #[test]
    fn clean_is_idempotent() {
        let once = clean_markdown("```md\n# H  \r\n\n\n\ntext\n```");
        assert_eq!(clean_markdown(&once), once);
    }

    #[test]
    fn merge_orders_by_seq_not_completion() {
        let r = merge(vec![ok_chunk(2, "third"), ok_chunk(0, "first"), ok_chunk(1, "second")], 100);
        assert_eq!(r.markdown, "first\n\nsecond\n\nthird\n");
        assert_eq!(r.status, AggregateStatus::Success);
        let seqs: Vec<usize> = r.chunks.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn merge_is_idempotent_over_the_same_chunk_list() {
        let chunks = vec![
            ok_chunk(0, "alpha"),
            failed_chunk(
                window(1),
                ChunkError::BackendFailure {
                    chunk: 1,
                    retries: 1,
                    detail: "boom".into(),
                },
                5,
                1,
            ),
            ok_chunk(2, "omega"),
        ];
        let first = merge(chunks.clone(), 50);
        let second = merge(chunks, 50);
        assert_eq!(first.markdown, second.markdown);
        assert_eq!(first.status, second.status);
        // Re-merging the merged chunk list is also stable.
        let third = merge(first.chunks.clone(), 50);
        assert_eq!(third.markdown, first.markdown);
    }

    #[test]
    fn failed_chunk_leaves_gap_marker() {
        let failed = failed_chunk(
            window(1),
            ChunkError::BackendTimeout {
                chunk: 1,
                elapsed_ms: 60_000,
            },
            60_000,
            2,
        );
        let r = merge(vec![ok_chunk(0, "before"), failed, ok_chunk(2, "after")], 100);
        assert_eq!(r.status, AggregateStatus::Partial);
        assert!(r.markdown.contains("<!-- chunk 1 (pages 16-31) failed:"), "got: {}", r.markdown);
        assert!(r.markdown.starts_with("before\n"));
        assert!(r.markdown.trim_end().ends_with("after"));
        assert_eq!(r.first_error.as_deref().map(|s| s.contains("timed out")), Some(true));
    }

    #[test]
    fn skipped_chunks_contribute_nothing() {
        let r = merge(
            vec![ok_chunk(0, "content"), skipped_chunk(window(1), None)],
            100,
        );
        assert_eq!(r.status, AggregateStatus::Success);
        assert_eq!(r.markdown, "content\n");
        assert_eq!(r.stats.skipped_chunks, 1);
    }

    #[test]
    fn all_failed_is_failed_with_empty_content_rule() {
        let r = merge(
            vec![failed_chunk(
                window(0),
                ChunkError::BackendFailure {
                    chunk: 0,
                    retries: 3,
                    detail: "corrupt".into(),
                },
                5,
                3,
            )],
            100,
        );
        assert_eq!(r.status, AggregateStatus::Failed);
        assert_eq!(r.stats.failed_chunks, 1);
        assert_eq!(r.stats.total_retries, 3);
    }

    #[test]
    fn retry_counts_above_a_byte_survive() {
        let chunk = success_chunk(
            window(0),
            BackendOutput {
                markdown: "text".to_string(),
                pages_converted: 16,
                reached_end: false,
                warnings: Vec::new(),
            },
            10,
            300,
        );
        assert_eq!(chunk.retries, 300);
        let r = merge(vec![chunk], 100);
        assert_eq!(r.stats.total_retries, 300);
    }

    #[test]
    fn stats_sum_durations_and_retries() {
        let mut a = ok_chunk(0, "a");
        a.duration_ms = 40;
        a.retries = 1;
        let mut b = ok_chunk(1, "b");
        b.duration_ms = 60;
        let r = merge(vec![a, b], 70);
        assert_eq!(r.stats.backend_duration_ms, 100);
        assert_eq!(r.stats.total_duration_ms, 70);
        assert_eq!(r.stats.total_retries, 1);
        assert_eq!(r.stats.succeeded_chunks, 2);
    }
}
