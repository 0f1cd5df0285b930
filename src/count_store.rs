//! Per-window, per-position perch counts.
//!
//! The counts come from the hardware and are cumulative, so recording is a
//! write of the latest value, not an increment. A write never lowers the
//! stored value; this keeps an event that finished late from overwriting a
//! newer count that was recorded first.

use crate::schedule::WindowId;
use crate::stimulus::Position;

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    sync::Mutex,
};

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotReason {
    /// The regular timer.
    Periodic,
    /// The wall clock rolled over to a new day.
    Midnight,
    /// The run was stopped.
    Final,
    /// Asked for by the operator.
    Manual,
}

impl fmt::Display for SnapshotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotReason::Periodic => "periodic",
            SnapshotReason::Midnight => "midnight",
            SnapshotReason::Final => "final",
            SnapshotReason::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// A frozen copy of the counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSnapshot {
    /// Local time the snapshot was taken, `%Y-%m-%d %H:%M:%S`.
    pub taken_at: String,
    #[allow(missing_docs)]
    pub reason: SnapshotReason,
    /// Window -> position -> count. Positions that never saw an event are
    /// left out.
    pub windows: BTreeMap<WindowId, BTreeMap<Position, u32>>,
}

impl CountSnapshot {
    /// The count for one window and position, 0 if nothing was recorded.
    pub fn get(&self, window: WindowId, position: Position) -> u32 {
        self.windows
            .get(&window)
            .and_then(|w| w.get(&position))
            .copied()
            .unwrap_or(0)
    }

    /// Per-position run totals. The hardware count for a position keeps
    /// climbing across window switches, so the highest count filed under
    /// any window is the total.
    pub fn totals(&self) -> BTreeMap<Position, u32> {
        let mut totals = BTreeMap::new();
        for (position, &count) in self.windows.values().flatten() {
            totals
                .entry(*position)
                .and_modify(|c: &mut u32| *c = (*c).max(count))
                .or_insert(count);
        }
        totals
    }
}

#[derive(Debug, Default)]
struct Tally {
    windows: BTreeMap<WindowId, BTreeMap<Position, u32>>,
    history: Vec<CountSnapshot>,
}

/// The thread-safe tally. Written by the position workers and by the
/// snapshot timer, nothing else.
#[derive(Debug, Default)]
pub struct CountStore {
    tally: Mutex<Tally>,
}

impl CountStore {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the hardware's count for `position` under `window`.
    pub fn record(&self, window: WindowId, position: Position, count: u32) {
        let mut tally = self.tally.lock().unwrap();
        tally
            .windows
            .entry(window)
            .or_default()
            .entry(position)
            .and_modify(|c| *c = (*c).max(count))
            .or_insert(count);
    }

    /// The current counts, without adding to the history.
    pub fn snapshot(&self) -> CountSnapshot {
        self.freeze(SnapshotReason::Manual)
    }

    /// Take a snapshot and keep it in the history. Only the latest
    /// periodic snapshot is kept; every other reason is kept for the run.
    pub fn take_snapshot(&self, reason: SnapshotReason) -> CountSnapshot {
        let snapshot = self.freeze(reason);
        let mut tally = self.tally.lock().unwrap();
        if reason == SnapshotReason::Periodic {
            tally.history.retain(|s| s.reason != SnapshotReason::Periodic);
        }
        tally.history.push(snapshot.clone());
        snapshot
    }

    /// Every snapshot kept so far, oldest first.
    pub fn history(&self) -> Vec<CountSnapshot> {
        self.tally.lock().unwrap().history.clone()
    }

    /// Per-position run totals, see [CountSnapshot::totals].
    pub fn totals(&self) -> BTreeMap<Position, u32> {
        self.snapshot().totals()
    }

    /// Drop all counts and the snapshot history.
    pub fn clear(&self) {
        let mut tally = self.tally.lock().unwrap();
        tally.windows.clear();
        tally.history.clear();
    }

    fn freeze(&self, reason: SnapshotReason) -> CountSnapshot {
        let windows = self.tally.lock().unwrap().windows.clone();
        CountSnapshot {
            taken_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            reason,
            windows,
        }
    }
}
