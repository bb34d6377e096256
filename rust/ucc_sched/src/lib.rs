// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Priority multi-queue scheduler for accelerator compute units
//!
//! Clients submit device commands through virtual streams ("vstreams"), each
//! a command ring owning one scheduling entity. The scheduler multiplexes
//! those streams onto a bounded set of compute units ("XCUs"), each driven by
//! a dedicated worker thread that picks the most urgent ready entity and
//! hands its pending commands to the device backend.
//!
//! ## Scheduling policy
//!
//! Every compute unit keeps one FIFO per priority tier. A HIGH entity that
//! becomes ready while a LOW one is running flags it for preemption; the flag
//! is honoured once the running entity has submitted at least its `step`
//! worth of commands since it was last scheduled in. Entities whose ring
//! runs dry are blocked and leave the run queue until the client kicks them
//! again.
//!
//! ## Back-pressure
//!
//! A worker stops submitting for a stream once that stream has a high-water
//! mark of commands outstanding on the device, and waits (bounded) for the
//! device to signal completions through a [`Completer`].

pub mod completion;
pub mod config;
pub mod entity;
pub mod error;
pub mod group;
pub mod id_alloc;
mod runqueue;
pub mod sched;
pub mod sim;
pub mod stats;
pub mod types;
pub mod vstream;
pub mod xcu;

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

pub use completion::Completer;
pub use completion::Completion;
pub use config::SchedConfig;
pub use error::Result;
pub use error::UccError;
pub use group::RunContext;
pub use group::XpuOps;
pub use sched::UccScheduler;
pub use sim::SimDevice;
pub use stats::CuStats;
pub use stats::EntityStats;
pub use stats::SchedSnapshot;
pub use stats::StreamStats;
pub use types::*;
pub use vstream::StreamParams;
pub use vstream::VStream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Lock helpers that recover the guard of a poisoned lock.

pub(crate) fn lock_unpoisoned<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read_unpoisoned<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_unpoisoned<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
