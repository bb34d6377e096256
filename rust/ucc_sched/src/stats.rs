// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Serialisable statistics snapshots.
//!
//! Everything here is a copy taken under the relevant locks and is purely
//! diagnostic. Scheduling decisions never read these values.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::types::{CqId, CuId, CuState, DevId, Priority, SeState, Step, StreamId, TsId};

/// Per-entity timing and submission counters. Durations include the phase
/// in progress at the time of the snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    pub state: SeState,
    pub priority: Priority,
    pub step: Step,
    pub on_cu: bool,
    pub cu: Option<CuId>,
    /// Time spent queued but not running.
    pub wait_ns: u64,
    /// Time spent running with a preemption request pending.
    pub preempt_wait_ns: u64,
    pub run_ns: u64,
    pub nr_kernels: u64,
    pub nr_submits: u64,
    pub nr_timeouts: u64,
    pub nr_preempted: u64,
    pub nr_blocks: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub id: StreamId,
    pub dev: DevId,
    pub ts: TsId,
    pub cq: CqId,
    /// Commands in the ring not yet taken by the device.
    pub pending: u32,
    /// Commands on the device not yet completed.
    pub inflight: u64,
    pub nr_completed: u64,
    pub se: EntityStats,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuStats {
    pub cu: CuId,
    pub dev: DevId,
    pub ts: TsId,
    pub state: CuState,
    pub nr_running: usize,
    pub curr: Option<StreamId>,
    /// Queued entities, most urgent tier first.
    pub queued: Vec<StreamId>,
    pub nr_switches: u64,
    pub nr_preemptions: u64,
    pub nr_submits: u64,
    pub nr_kernels: u64,
    pub nr_timeouts: u64,
    pub nr_blocks: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedSnapshot {
    pub cus: Vec<CuStats>,
    pub streams: Vec<StreamStats>,
}

impl SchedSnapshot {
    /// Compute units each queued stream was found on. A consistent snapshot
    /// lists every stream at most once.
    pub fn placements(&self) -> BTreeMap<StreamId, Vec<CuId>> {
        let mut placements: BTreeMap<StreamId, Vec<CuId>> = BTreeMap::new();
        for cu in &self.cus {
            for id in &cu.queued {
                placements.entry(*id).or_default().push(cu.cu);
            }
        }
        placements
    }

    pub fn nr_running(&self) -> usize {
        self.cus.iter().map(|cu| cu.nr_running).sum()
    }

    pub fn nr_kernels(&self) -> u64 {
        self.cus.iter().map(|cu| cu.nr_kernels).sum()
    }

    pub fn nr_completed(&self) -> u64 {
        self.streams.iter().map(|s| s.nr_completed).sum()
    }
}
