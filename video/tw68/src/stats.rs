// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Capture queue counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-queue statistics
#[derive(Default)]
pub struct QueueStats {
    pub frames_completed: AtomicU64,
    pub frames_failed: AtomicU64,
    pub bytes_captured: AtomicU64,
    /// Buffers appended to a running chain by tail rewrite
    pub chained: AtomicU64,
    /// Engine (re)starts from an idle or recovered state
    pub starts: AtomicU64,
    pub timeouts: AtomicU64,
    pub faults: AtomicU64,
    /// Completions that found the engine parked on the stopper
    pub stopper_hits: AtomicU64,
}

impl QueueStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            chained: self.chained.load(Ordering::Relaxed),
            starts: self.starts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            stopper_hits: self.stopper_hits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub frames_completed: u64,
    pub frames_failed: u64,
    pub bytes_captured: u64,
    pub chained: u64,
    pub starts: u64,
    pub timeouts: u64,
    pub faults: u64,
    pub stopper_hits: u64,
}
