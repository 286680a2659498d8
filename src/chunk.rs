//! Chunk planning: split a requested page range into bounded windows.
//!
//! Heavy backends behave best on bounded inputs — a 900-page PDF fed to a
//! layout model in one call has unpredictable latency and peak memory. The
//! planner divides the requested range into fixed-size windows, each a unit
//! of work with its own admission slot, retry budget and result entry.
//!
//! ## Invariants
//!
//! Windows are non-overlapping, monotonically increasing, and their union
//! equals the requested range. A zero-length range (`start == end`) still
//! yields exactly one window so the orchestrator always has at least one
//! unit of work to report status for.
//!
//! ## Unknown document length
//!
//! When the requested range has no end (`end = None`) the true page count is
//! unknown until a backend processes a window and reports end-of-document.
//! The plan is then *open-ended*: windows are generated speculatively via
//! [`ChunkPlan::window_at`] and the orchestrator truncates the plan once a
//! window reports that it reached the end. This is the only place where
//! plan length is determined reactively rather than up front.

use crate::request::PageRange;
use serde::{Deserialize, Serialize};

/// One bounded sub-range of pages, with a sequence index for re-assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkWindow {
    /// Position in the plan; merge order is ascending `seq`.
    pub seq: usize,
    /// First page of the window (0-indexed).
    pub start: u32,
    /// Last page of the window, inclusive. `None` only for the single
    /// window of a non-paginated input ("the whole input").
    pub end: Option<u32>,
}

impl ChunkWindow {
    /// Number of pages this window covers, when bounded.
    pub fn page_count(&self) -> Option<u32> {
        self.end.map(|e| e - self.start + 1)
    }
}

/// An ordered sequence of windows covering the requested page range.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    requested: PageRange,
    window_size: u32,
    windows: Vec<ChunkWindow>,
    open_ended: bool,
}

impl ChunkPlan {
    /// Build the plan for a request.
    ///
    /// * Non-paginated input → a single window covering the whole input.
    /// * Paginated with a known end → fixed windows of `window_size` pages,
    ///   the last one capped at the requested end.
    /// * Paginated with unknown end → an open-ended plan; the orchestrator
    ///   pulls speculative windows from [`ChunkPlan::window_at`].
    pub fn plan(requested: PageRange, window_size: u32, paginated: bool) -> Self {
        let window_size = window_size.max(1);

        if !paginated {
            return Self {
                requested,
                window_size,
                windows: vec![ChunkWindow {
                    seq: 0,
                    start: requested.start,
                    end: None,
                }],
                open_ended: false,
            };
        }

        match requested.end {
            Some(end) => {
                let mut windows = Vec::new();
                let mut start = requested.start;
                loop {
                    let win_end = end.min(start.saturating_add(window_size - 1));
                    windows.push(ChunkWindow {
                        seq: windows.len(),
                        start,
                        end: Some(win_end),
                    });
                    if win_end >= end {
                        break;
                    }
                    start = win_end + 1;
                }
                Self {
                    requested,
                    window_size,
                    windows,
                    open_ended: false,
                }
            }
            None => Self {
                requested,
                window_size,
                windows: Vec::new(),
                open_ended: true,
            },
        }
    }

    /// The windows of a bounded plan, in dispatch (= merge) order.
    ///
    /// Empty for open-ended plans; use [`ChunkPlan::window_at`] instead.
    pub fn windows(&self) -> &[ChunkWindow] {
        &self.windows
    }

    /// The `seq`-th speculative window of an open-ended plan.
    ///
    /// Every speculative window is a full `window_size` pages; the backend
    /// reports how many pages actually existed and whether it reached the
    /// document end, at which point the plan is truncated.
    pub fn window_at(&self, seq: usize) -> ChunkWindow {
        let start = self.requested.start + (seq as u32) * self.window_size;
        ChunkWindow {
            seq,
            start,
            end: Some(start + self.window_size - 1),
        }
    }

    /// Whether the plan length is known up front.
    pub fn is_open_ended(&self) -> bool {
        self.open_ended
    }

    /// Number of windows in a bounded plan (0 for open-ended).
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn requested(&self) -> PageRange {
        self.requested
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert non-overlap, monotone order, and exact union over the range.
    fn assert_covers(plan: &ChunkPlan, start: u32, end: u32) {
        let windows = plan.windows();
        assert!(!windows.is_empty());
        assert_eq!(windows[0].start, start);
        assert_eq!(windows.last().unwrap().end, Some(end));
        for (i, w) in windows.iter().enumerate() {
            assert_eq!(w.seq, i);
            let e = w.end.expect("bounded plan window must have an end");
            assert!(w.start <= e, "window {i} inverted: {w:?}");
            if i > 0 {
                let prev_end = windows[i - 1].end.unwrap();
                assert_eq!(w.start, prev_end + 1, "gap or overlap at window {i}");
            }
        }
    }

    #[test]
    fn exact_multiple_of_window_size() {
        let plan = ChunkPlan::plan(PageRange::bounded(0, 31), 16, true);
        assert_eq!(plan.len(), 2);
        assert_covers(&plan, 0, 31);
        assert_eq!(plan.windows()[0].page_count(), Some(16));
        assert_eq!(plan.windows()[1].page_count(), Some(16));
    }

    #[test]
    fn last_window_is_capped() {
        let plan = ChunkPlan::plan(PageRange::bounded(0, 20), 16, true);
        assert_eq!(plan.len(), 2);
        assert_covers(&plan, 0, 20);
        assert_eq!(plan.windows()[1], ChunkWindow { seq: 1, start: 16, end: Some(20) });
    }

    #[test]
    fn nonzero_start() {
        let plan = ChunkPlan::plan(PageRange::bounded(100, 149), 20, true);
        assert_eq!(plan.len(), 3);
        assert_covers(&plan, 100, 149);
    }

    #[test]
    fn zero_length_range_yields_one_chunk() {
        let plan = ChunkPlan::plan(PageRange::bounded(5, 5), 16, true);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.windows()[0], ChunkWindow { seq: 0, start: 5, end: Some(5) });
    }

    #[test]
    fn non_paginated_is_single_whole_input_window() {
        let plan = ChunkPlan::plan(PageRange::all(), 16, false);
        assert!(!plan.is_open_ended());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.windows()[0].end, None);
    }

    #[test]
    fn open_ended_plan_generates_speculative_windows() {
        let plan = ChunkPlan::plan(PageRange::from_page(10), 16, true);
        assert!(plan.is_open_ended());
        assert!(plan.is_empty());
        assert_eq!(plan.window_at(0), ChunkWindow { seq: 0, start: 10, end: Some(25) });
        assert_eq!(plan.window_at(1), ChunkWindow { seq: 1, start: 26, end: Some(41) });
        assert_eq!(plan.window_at(2).start, 42);
    }

    #[test]
    fn speculative_windows_are_contiguous() {
        let plan = ChunkPlan::plan(PageRange::all(), 7, true);
        for seq in 1..50 {
            let prev = plan.window_at(seq - 1);
            let cur = plan.window_at(seq);
            assert_eq!(cur.start, prev.end.unwrap() + 1);
        }
    }

    #[test]
    fn window_size_floor_is_one() {
        let plan = ChunkPlan::plan(PageRange::bounded(0, 2), 0, true);
        assert_eq!(plan.len(), 3);
        assert_covers(&plan, 0, 2);
    }

    #[test]
    fn union_property_over_many_shapes() {
        for start in [0u32, 1, 7, 100] {
            for len in [1u32, 2, 15, 16, 17, 160] {
                for ws in [1u32, 4, 16, 64] {
                    let end = start + len - 1;
                    let plan = ChunkPlan::plan(PageRange::bounded(start, end), ws, true);
                    assert_covers(&plan, start, end);
                    let covered: u32 = plan
                        .windows()
                        .iter()
                        .map(|w| w.page_count().unwrap())
                        .sum();
                    assert_eq!(covered, len, "start={start} len={len} ws={ws}");
                }
            }
        }
    }
}
