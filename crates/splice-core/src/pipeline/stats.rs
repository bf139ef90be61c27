//! Pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated from any thread
#[derive(Debug, Default)]
pub struct Stats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    frames_consumed: AtomicU64,
    stacks_created: AtomicU64,
    stacks_destroyed: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames pushed into the pipeline
    pub frames_in: u64,
    /// Frames handed to the sink
    pub frames_out: u64,
    /// Frames a handler kept
    pub frames_consumed: u64,
    /// Interception stacks created
    pub stacks_created: u64,
    /// Interception stacks torn down
    pub stacks_destroyed: u64,
}

impl StatsSnapshot {
    /// Stacks currently alive
    pub fn live_stacks(&self) -> u64 {
        self.stacks_created.saturating_sub(self.stacks_destroyed)
    }
}

impl Stats {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_consumed(&self) {
        self.frames_consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a created stack
    pub fn stack_created(&self) {
        self.stacks_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a destroyed stack
    pub fn stack_destroyed(&self) {
        self.stacks_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_consumed: self.frames_consumed.load(Ordering::Relaxed),
            stacks_created: self.stacks_created.load(Ordering::Relaxed),
            stacks_destroyed: self.stacks_destroyed.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero
    pub fn reset(&self) {
        for counter in [
            &self.frames_in,
            &self.frames_out,
            &self.frames_consumed,
            &self.stacks_created,
            &self.stacks_destroyed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
