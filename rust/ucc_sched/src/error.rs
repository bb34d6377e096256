// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt;
use std::io;

use crate::types::{CqId, DevId, StreamId, TsId};

pub type Result<T> = std::result::Result<T, UccError>;

/// Errors surfaced synchronously to callers of the scheduler.
///
/// Failures inside a worker loop (device submission errors, completion
/// timeouts) never show up here; they are absorbed into statistics.
#[derive(Debug)]
pub enum UccError {
    /// The compute unit table cannot hold the requested units.
    CuTableFull { requested: usize, available: usize },
    /// Every vstream slot is in use.
    StreamTableFull,
    /// An id allocator ran out of ids.
    IdExhausted,
    /// No compute unit was registered for the device/task-stream pair.
    NoComputeUnit { dev: DevId, ts: TsId },
    /// The device was never registered.
    UnknownDevice(DevId),
    /// The device is already registered.
    DeviceExists(DevId),
    /// A group with that id is already attached to the parent.
    GroupExists { parent: u32, id: u32 },
    /// The group handle does not name a node of the tree.
    UnknownGroup(usize),
    /// The stream handle is stale or was never allocated.
    UnknownStream(StreamId),
    /// The completion queue does not exist.
    UnknownCq(CqId),
    /// The stream is being torn down.
    StreamDead(StreamId),
    /// A kicked tail lies outside the ring.
    TailOutOfRange { tail: u32, depth: u32 },
    /// A kick would overwrite commands the device has not consumed yet.
    RingOverflow { pending: u32, depth: u32 },
    /// The consumer pointer was advanced past the producer.
    HeadOverrun { requested: u32, pending: u32 },
    /// A configuration value is unusable.
    InvalidConfig(String),
    /// The worker thread for a compute unit could not be started.
    Spawn(io::Error),
}

impl fmt::Display for UccError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UccError::CuTableFull {
                requested,
                available,
            } => write!(
                f,
                "compute unit table full: requested {requested}, {available} slots left"
            ),
            UccError::StreamTableFull => write!(f, "vstream table full"),
            UccError::IdExhausted => write!(f, "id space exhausted"),
            UccError::NoComputeUnit { dev, ts } => {
                write!(f, "no compute unit available for {dev}/{ts}")
            }
            UccError::UnknownDevice(dev) => write!(f, "unknown device {dev}"),
            UccError::DeviceExists(dev) => write!(f, "device {dev} already registered"),
            UccError::GroupExists { parent, id } => {
                write!(f, "group {id} already attached to group {parent}")
            }
            UccError::UnknownGroup(idx) => write!(f, "unknown group #{idx}"),
            UccError::UnknownStream(id) => write!(f, "unknown vstream {id}"),
            UccError::UnknownCq(id) => write!(f, "unknown completion queue {id}"),
            UccError::StreamDead(id) => write!(f, "vstream {id} is being freed"),
            UccError::TailOutOfRange { tail, depth } => {
                write!(f, "tail {tail} out of range for ring depth {depth}")
            }
            UccError::RingOverflow { pending, depth } => write!(
                f,
                "ring overflow: {pending} commands pending exceeds depth {depth}"
            ),
            UccError::HeadOverrun { requested, pending } => write!(
                f,
                "cannot advance head by {requested}, only {pending} commands pending"
            ),
            UccError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            UccError::Spawn(e) => write!(f, "failed to spawn xcu worker: {e}"),
        }
    }
}

impl std::error::Error for UccError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UccError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for UccError {
    fn from(e: io::Error) -> Self {
        UccError::Spawn(e)
    }
}
