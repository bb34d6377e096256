// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype identifiers and the small scheduling enums.
//!
//! Identifiers are newtypes so a device id can never be handed where a
//! compute unit id is expected. `StreamId` additionally carries the slot
//! generation so a handle to a freed stream cannot reach its successor.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Number of priority tiers in every run queue.
pub const PRIO_LEVELS: usize = 2;

/// Compute unit (XCU) identifier, an index into the append-only CU table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CuId(pub u32);

/// Accelerator device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevId(pub u32);

/// Task-stream context identifier within a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TsId(pub u32);

/// Completion queue identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CqId(pub u32);

/// Generational handle to a virtual stream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for CuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xcu{}", self.0)
    }
}

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

impl fmt::Display for TsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts{}", self.0)
    }
}

impl fmt::Display for CqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cq{}", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vs{}.{}", self.index, self.generation)
    }
}

/// Scheduling tier. The discriminant is the run queue index, so a lower
/// value means a more urgent entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High = 0,
    Low = 1,
}

impl Priority {
    pub const ALL: [Priority; PRIO_LEVELS] = [Priority::High, Priority::Low];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether `self` should preempt an entity running at `running`.
    pub fn preempts(self, running: Priority) -> bool {
        self.index() < running.index()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "HIGH"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Quantum hint: number of submitted commands a running entity is granted
/// before a pending preemption is honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Slow = 1,
    Fast = 10,
}

impl Step {
    pub fn quantum(self) -> u64 {
        self as u64
    }
}

/// Scheduling entity lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeState {
    Prepare,
    Ready,
    Running,
    Block,
    Dead,
}

/// Pending scheduler directive on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeFlag {
    None,
    Preempt,
    Balance,
}

/// Compute unit state, stored as a `u8` in the unit itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CuState {
    Inactive = 0,
    Idle = 1,
    Busy = 2,
    Submit = 3,
}

impl CuState {
    pub(crate) fn from_u8(v: u8) -> CuState {
        match v {
            1 => CuState::Idle,
            2 => CuState::Busy,
            3 => CuState::Submit,
            _ => CuState::Inactive,
        }
    }
}

impl fmt::Display for CuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CuState::Inactive => write!(f, "INACTIVE"),
            CuState::Idle => write!(f, "IDLE"),
            CuState::Busy => write!(f, "BUSY"),
            CuState::Submit => write!(f, "SUBMIT"),
        }
    }
}
