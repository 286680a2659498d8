//! Progress-callback trait for per-chunk conversion events.
//!
//! Inject an `Arc<dyn ConversionProgressCallback>` via
//! [`crate::config::OrchestratorConfigBuilder::progress_callback`] to
//! receive events as chunks move through admission, backend calls and
//! retries. Callbacks are the least-invasive integration point: forward
//! them to a channel, a job record, or a terminal progress bar without the
//! library knowing how the host communicates.
//!
//! All methods have default no-op implementations; implementations must be
//! `Send + Sync` because chunks complete concurrently.

/// Called by the orchestrator as it processes each chunk.
///
/// With concurrency > 1, `on_chunk_*` may be called from different tasks
/// at once and out of plan order; protect shared mutable state.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once after planning, before any chunk is dispatched.
    /// `total_chunks` is 0 for open-ended plans whose length is unknown.
    fn on_plan_ready(&self, total_chunks: usize) {
        let _ = total_chunks;
    }

    /// Called when a chunk is admitted and its backend call begins.
    fn on_chunk_start(&self, seq: usize) {
        let _ = seq;
    }

    /// Called when a chunk converts successfully.
    fn on_chunk_complete(&self, seq: usize, markdown_len: usize) {
        let _ = (seq, markdown_len);
    }

    /// Called when a chunk fails after its retry budget is exhausted.
    fn on_chunk_error(&self, seq: usize, error: &str) {
        let _ = (seq, error);
    }

    /// Called once after all chunks have settled.
    fn on_complete(&self, total_chunks: usize, succeeded: usize) {
        let _ = (total_chunks, succeeded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        completed: AtomicUsize,
    }

    impl ConversionProgressCallback for Counting {
        fn on_chunk_complete(&self, _seq: usize, _len: usize) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn defaults_are_noops_and_overrides_fire() {
        let cb = Arc::new(Counting {
            completed: AtomicUsize::new(0),
        });
        let dynamic: Arc<dyn ConversionProgressCallback> = cb.clone();
        dynamic.on_plan_ready(3);
        dynamic.on_chunk_start(0);
        dynamic.on_chunk_complete(0, 128);
        dynamic.on_complete(3, 3);
        assert_eq!(cb.completed.load(Ordering::SeqCst), 1);
    }
}
