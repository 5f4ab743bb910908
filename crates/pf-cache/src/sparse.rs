//! Sparse population tracking for one cache region.
//!
//! A tracker maintains the sorted, disjoint set of byte ranges already
//! populated within `[0, length)`. Callers claim the missing sub-ranges of a
//! write range as [`Gap`]s; concurrent requests for overlapping ranges attach
//! as waiters to the existing claim instead of writing the same bytes twice.
//! Waiters are progress-aware: a waiter needing `[10, 50)` of a `[0, 100)`
//! gap fires as soon as the populator reports progress past 50.

use crate::listener::{CompletionGroup, OnceListener};
use parking_lot::Mutex;
use pf_error::CacheError;
use pf_types::ByteRange;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Tracks which byte ranges of a region are populated.
#[derive(Debug)]
pub struct SparseFileTracker {
    length: u64,
    state: Arc<Mutex<TrackerState>>,
}

#[derive(Debug, Default)]
struct TrackerState {
    ranges: BTreeMap<u64, RangeState>,
}

#[derive(Debug)]
enum RangeState {
    Done { end: u64 },
    Pending(PendingRange),
}

impl RangeState {
    fn end(&self) -> u64 {
        match self {
            Self::Done { end } => *end,
            Self::Pending(pending) => pending.end,
        }
    }
}

#[derive(Debug)]
struct PendingRange {
    end: u64,
    /// Absolute offset up to which the claiming populator has written.
    progress: u64,
    waiters: Vec<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    until: u64,
    listener: OnceListener<()>,
}

impl SparseFileTracker {
    #[must_use]
    pub fn new(length: u64) -> Self {
        Self {
            length,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    /// Logical length in bytes covered by this tracker.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Claims the unpopulated sub-ranges of `write` for this caller and fires
    /// `listener` once `read` is fully populated.
    ///
    /// Returned gaps belong exclusively to this caller; other callers
    /// requesting overlapping ranges receive no gap for the overlap and are
    /// attached to the existing claim. A failed claim propagates to every
    /// attached waiter.
    pub fn wait_for_range(
        &self,
        write: ByteRange,
        read: ByteRange,
        listener: OnceListener<()>,
    ) -> Vec<Gap> {
        debug_assert!(write.contains_range(read), "read {read} outside write {write}");
        self.claim(write, Some((read, listener)))
    }

    /// Claims the unpopulated sub-ranges of `write` without registering a
    /// completion waiter.
    pub fn claim_missing(&self, write: ByteRange) -> Vec<Gap> {
        self.claim(write, None)
    }

    fn claim(&self, write: ByteRange, read: Option<(ByteRange, OnceListener<()>)>) -> Vec<Gap> {
        debug_assert!(write.end() <= self.length, "write {write} beyond {}", self.length);
        let mut gaps = Vec::new();
        let mut state = self.state.lock();

        // Existing entries overlapping the write range, oldest first.
        let lower = state
            .ranges
            .range(..=write.start())
            .next_back()
            .map_or(write.start(), |(&start, _)| start);
        let overlapping: Vec<(u64, u64)> = state
            .ranges
            .range(lower..write.end())
            .filter(|(_, range)| range.end() > write.start())
            .map(|(&start, range)| (start, range.end()))
            .collect();

        let mut cursor = write.start();
        for (start, end) in overlapping {
            if start > cursor {
                gaps.push(self.new_gap(&mut state, cursor, start));
            }
            cursor = cursor.max(end);
            if cursor >= write.end() {
                break;
            }
        }
        if cursor < write.end() {
            gaps.push(self.new_gap(&mut state, cursor, write.end()));
        }

        match read {
            None => {}
            Some((read, listener)) if read.is_empty() => {
                drop(state);
                listener.on_response(());
            }
            Some((read, listener)) => {
                // Pending claims still blocking the read range.
                let blocking: Vec<(u64, u64)> = state
                    .ranges
                    .range(..read.end())
                    .filter_map(|(&start, range)| match range {
                        RangeState::Pending(pending) if pending.end > read.start() => {
                            let until = pending.end.min(read.end());
                            (pending.progress < until).then_some((start, until))
                        }
                        _ => None,
                    })
                    .collect();
                if blocking.is_empty() {
                    drop(state);
                    listener.on_response(());
                    return gaps;
                }
                let children = CompletionGroup::split(blocking.len(), (), listener);
                for ((start, until), child) in blocking.into_iter().zip(children) {
                    if let Some(RangeState::Pending(pending)) = state.ranges.get_mut(&start) {
                        pending.waiters.push(Waiter {
                            until,
                            listener: child,
                        });
                    }
                }
            }
        }
        gaps
    }

    fn new_gap(&self, state: &mut TrackerState, start: u64, end: u64) -> Gap {
        state.ranges.insert(
            start,
            RangeState::Pending(PendingRange {
                end,
                progress: start,
                waiters: Vec::new(),
            }),
        );
        trace!(target: "pf::tracker", event = "gap_claimed", start, end);
        Gap {
            state: Arc::clone(&self.state),
            start,
            end,
            finished: false,
        }
    }

    /// True when every byte of `range` is populated.
    #[must_use]
    pub fn is_range_complete(&self, range: ByteRange) -> bool {
        if range.is_empty() {
            return true;
        }
        let state = self.state.lock();
        let mut cursor = range.start();
        for (&start, entry) in state.ranges.range(..range.end()) {
            let end = match entry {
                RangeState::Done { end } => *end,
                RangeState::Pending(_) => continue,
            };
            if end <= cursor {
                continue;
            }
            if start > cursor {
                return false;
            }
            cursor = end;
            if cursor >= range.end() {
                return true;
            }
        }
        false
    }
}

/// Exclusive claim on one unpopulated sub-range.
///
/// The owner reports progress while filling and finishes the claim with
/// [`Gap::on_completion`] or [`Gap::on_failure`]. Dropping an unfinished gap
/// releases the claim and fails its waiters, leaving the range retryable.
#[derive(Debug)]
pub struct Gap {
    state: Arc<Mutex<TrackerState>>,
    start: u64,
    end: u64,
    finished: bool,
}

impl Gap {
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Advances the populated frontier to the absolute offset `position`,
    /// waking waiters whose ranges are now covered.
    pub fn on_progress(&self, position: u64) {
        let woken = {
            let mut state = self.state.lock();
            let Some(RangeState::Pending(pending)) = state.ranges.get_mut(&self.start) else {
                return;
            };
            pending.progress = pending.progress.max(position.min(pending.end));
            let progress = pending.progress;
            let mut woken = Vec::new();
            let mut index = 0;
            while index < pending.waiters.len() {
                if pending.waiters[index].until <= progress {
                    woken.push(pending.waiters.swap_remove(index).listener);
                } else {
                    index += 1;
                }
            }
            woken
        };
        for listener in woken {
            listener.on_response(());
        }
    }

    /// Marks the claim fully populated, merging it into the completed set.
    pub fn on_completion(mut self) {
        self.finished = true;
        let woken = {
            let mut state = self.state.lock();
            let waiters = match state.ranges.remove(&self.start) {
                Some(RangeState::Pending(pending)) => pending.waiters,
                other => {
                    debug_assert!(false, "completed gap [{}, {}) not pending", self.start, self.end);
                    if let Some(entry) = other {
                        state.ranges.insert(self.start, entry);
                    }
                    Vec::new()
                }
            };
            let mut done_start = self.start;
            let mut done_end = self.end;
            let merge_prev = state
                .ranges
                .range(..done_start)
                .next_back()
                .and_then(|(&start, entry)| match entry {
                    RangeState::Done { end } if *end == done_start => Some(start),
                    _ => None,
                });
            if let Some(start) = merge_prev {
                state.ranges.remove(&start);
                done_start = start;
            }
            if matches!(state.ranges.get(&done_end), Some(RangeState::Done { .. })) {
                if let Some(RangeState::Done { end }) = state.ranges.remove(&done_end) {
                    done_end = end;
                }
            }
            state.ranges.insert(done_start, RangeState::Done { end: done_end });
            trace!(
                target: "pf::tracker",
                event = "gap_completed",
                start = self.start,
                end = self.end
            );
            waiters
        };
        for waiter in woken {
            waiter.listener.on_response(());
        }
    }

    /// Releases the claim after a failed fill. Every attached waiter receives
    /// the failure; the range stays absent so a later caller can retry.
    pub fn on_failure(mut self, error: CacheError) {
        self.finished = true;
        self.release(error);
    }

    fn release(&self, error: CacheError) {
        let waiters = {
            let mut state = self.state.lock();
            match state.ranges.remove(&self.start) {
                Some(RangeState::Pending(pending)) => pending.waiters,
                other => {
                    if let Some(entry) = other {
                        state.ranges.insert(self.start, entry);
                    }
                    Vec::new()
                }
            }
        };
        trace!(
            target: "pf::tracker",
            event = "gap_failed",
            start = self.start,
            end = self.end,
            error = %error
        );
        for waiter in waiters {
            waiter.listener.on_failure(error.clone());
        }
    }
}

impl Drop for Gap {
    fn drop(&mut self) {
        if !self.finished {
            self.release(CacheError::PopulateFailed(
                "gap abandoned before completion".to_owned(),
            ));
        }
    }
}
