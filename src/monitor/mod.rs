// src/monitor/mod.rs
//
// Read side for display observers. The control loop publishes immutable
// snapshots; readers clone an `Arc` and never touch live loop state.

use std::sync::{Arc, Mutex, TryLockError};

use crate::output::laser::ActuatorState;
use crate::processing::binner::{BinMatrix, BinnerDiagnostics};
use crate::processing::control_loop::PipelineStats;
use crate::processing::decoders::Decision;
use crate::processing::triggers::LatchState;

#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    /// Session time the snapshot was taken at, in acquisition ticks.
    pub tick: u64,
    pub bins: BinMatrix,
    pub actuator: ActuatorState,
    pub latch: LatchState,
    pub decision: Decision,
    pub stats: PipelineStats,
    pub diagnostics: BinnerDiagnostics,
}

/// Latest published snapshot, shared between the loop and any number of readers.
#[derive(Clone, Default)]
pub struct SessionMonitor {
    latest: Arc<Mutex<Option<Arc<MonitorSnapshot>>>>,
}

impl SessionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in a new snapshot. Returns `false` without waiting if a reader
    /// currently holds the lock; the next publish will catch up.
    pub fn publish(&self, snapshot: MonitorSnapshot) -> bool {
        match self.latest.try_lock() {
            Ok(mut slot) => {
                *slot = Some(Arc::new(snapshot));
                true
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                *poisoned.into_inner() = Some(Arc::new(snapshot));
                true
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }

    pub fn latest(&self) -> Option<Arc<MonitorSnapshot>> {
        match self.latest.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
