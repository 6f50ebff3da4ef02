//! # Operating-Mode Accounting
//!
//! Tracks how long this node has spent in each operating mode and how many
//! times it entered each one. The node starts in [`OperatingMode::Connecting`]
//! and moves between modes as networking and consensus code signal changes.
//!
//! Durations are whole seconds, matching the report wire format.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// The five operating modes a node reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Not yet connected to enough peers.
    Connecting,
    /// Connected but not tracking the network.
    Connected,
    /// Tracking validated ledgers without validating.
    Monitoring,
    /// Fully synced and validating.
    Validating,
    /// Shutting down.
    Shutting,
}

impl OperatingMode {
    /// All modes in report-slot order.
    pub const ALL: [OperatingMode; 5] = [
        OperatingMode::Connecting,
        OperatingMode::Connected,
        OperatingMode::Monitoring,
        OperatingMode::Validating,
        OperatingMode::Shutting,
    ];

    /// Report slot of this mode.
    pub fn index(self) -> usize {
        match self {
            Self::Connecting => 0,
            Self::Connected => 1,
            Self::Monitoring => 2,
            Self::Validating => 3,
            Self::Shutting => 4,
        }
    }
}

/// Cumulative counters for one mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeCounters {
    pub transitions: u32,
    pub duration: Duration,
}

/// A consistent copy of the accounting state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingSnapshot {
    pub current: OperatingMode,
    pub counters: [ModeCounters; 5],
}

impl AccountingSnapshot {
    /// Counters for `mode`.
    pub fn counters(&self, mode: OperatingMode) -> ModeCounters {
        self.counters[mode.index()]
    }

    /// Per-mode difference `self - baseline`, saturating at zero.
    pub fn delta_since(&self, baseline: &AccountingSnapshot) -> [ModeCounters; 5] {
        let mut out = [ModeCounters::default(); 5];
        for (i, slot) in out.iter_mut().enumerate() {
            slot.transitions = self.counters[i]
                .transitions
                .saturating_sub(baseline.counters[i].transitions);
            slot.duration = self.counters[i]
                .duration
                .saturating_sub(baseline.counters[i].duration);
        }
        out
    }
}

#[derive(Debug)]
struct AccountingInner {
    current: OperatingMode,
    counters: [ModeCounters; 5],
    since: Instant,
}

/// Thread-safe status accounting.
///
/// Mode changes can come from several threads at once, so everything sits
/// behind one short-held mutex. Snapshots copy out under the lock and
/// never mutate stored state.
#[derive(Debug)]
pub struct StatusAccounting {
    inner: Mutex<AccountingInner>,
}

impl Default for StatusAccounting {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusAccounting {
    /// Starts in `Connecting`, which counts as the first transition.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Like [`new`](Self::new) with an explicit start instant.
    pub fn starting_at(now: Instant) -> Self {
        let mut counters = [ModeCounters::default(); 5];
        counters[OperatingMode::Connecting.index()].transitions = 1;
        Self {
            inner: Mutex::new(AccountingInner {
                current: OperatingMode::Connecting,
                counters,
                since: now,
            }),
        }
    }

    /// Current mode.
    pub fn current(&self) -> OperatingMode {
        self.inner.lock().current
    }

    /// Switches to `new`. No-op when already there.
    pub fn mode(&self, new: OperatingMode) {
        self.mode_at(new, Instant::now());
    }

    /// [`mode`](Self::mode) with an explicit clock reading.
    pub fn mode_at(&self, new: OperatingMode, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.current == new {
            return;
        }
        let elapsed = now.saturating_duration_since(inner.since);
        let outgoing = inner.current.index();
        inner.counters[outgoing].duration += elapsed;
        inner.counters[new.index()].transitions += 1;
        trace!(from = ?inner.current, to = ?new, elapsed_ms = elapsed.as_millis() as u64, "mode transition");
        inner.current = new;
        inner.since = now;
    }

    /// Copy of the counters with the active mode's time extended to now.
    pub fn snapshot(&self) -> AccountingSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// [`snapshot`](Self::snapshot) with an explicit clock reading.
    pub fn snapshot_at(&self, now: Instant) -> AccountingSnapshot {
        let (current, mut counters, since) = {
            let inner = self.inner.lock();
            (inner.current, inner.counters, inner.since)
        };
        counters[current.index()].duration += now.saturating_duration_since(since);
        AccountingSnapshot { current, counters }
    }
}
