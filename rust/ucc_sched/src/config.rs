// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::{Result, UccError};

/// Capacity of the compute unit table.
pub const DEFAULT_MAX_COMPUTE_UNITS: usize = 100;

/// Capacity of the vstream arena.
pub const DEFAULT_MAX_STREAMS: usize = 512;

/// Unacknowledged commands a stream may have on the device before its
/// worker stops and waits for a completion.
pub const DEFAULT_SQ_HIGH_WATER: u64 = 20;

/// Scheduler-wide tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    pub max_compute_units: usize,
    pub max_streams: usize,
    pub max_cqs: usize,
    /// Upper bound on a worker's wait for device completion.
    #[serde(with = "duration_us")]
    pub completion_timeout: Duration,
    pub sq_high_water: u64,
    /// Upper bound on each wait slice while `free` joins the worker.
    #[serde(with = "duration_us")]
    pub free_poll_interval: Duration,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            max_compute_units: DEFAULT_MAX_COMPUTE_UNITS,
            max_streams: DEFAULT_MAX_STREAMS,
            max_cqs: DEFAULT_MAX_STREAMS,
            completion_timeout: Duration::from_millis(10),
            sq_high_water: DEFAULT_SQ_HIGH_WATER,
            free_poll_interval: Duration::from_millis(1),
        }
    }
}

impl SchedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_compute_units == 0 {
            return Err(UccError::InvalidConfig(
                "max_compute_units must be non-zero".into(),
            ));
        }
        if self.max_streams == 0 || self.max_streams > u32::MAX as usize {
            return Err(UccError::InvalidConfig(format!(
                "max_streams must be in 1..={}",
                u32::MAX
            )));
        }
        if self.max_cqs == 0 || self.max_cqs > u32::MAX as usize {
            return Err(UccError::InvalidConfig(format!(
                "max_cqs must be in 1..={}",
                u32::MAX
            )));
        }
        if self.completion_timeout.is_zero() {
            return Err(UccError::InvalidConfig(
                "completion_timeout must be non-zero".into(),
            ));
        }
        if self.free_poll_interval.is_zero() {
            return Err(UccError::InvalidConfig(
                "free_poll_interval must be non-zero".into(),
            ));
        }
        if self.sq_high_water == 0 {
            return Err(UccError::InvalidConfig(
                "sq_high_water must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

mod duration_us {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}
