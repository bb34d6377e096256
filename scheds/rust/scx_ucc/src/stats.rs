// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use ucc_sched::Priority;
use ucc_sched::SchedSnapshot;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub nr_cus: u64,
    pub nr_busy_cus: u64,
    pub nr_streams: u64,
    pub nr_running: u64,
    pub nr_kernels: u64,
    pub nr_completed: u64,
    pub nr_switches: u64,
    pub nr_preemptions: u64,
    pub nr_timeouts: u64,
    pub nr_blocks: u64,
    /// Accumulated queueing time of live HIGH and LOW streams.
    pub high_wait_us: u64,
    pub low_wait_us: u64,
}

impl Metrics {
    pub fn from_snapshot(snap: &SchedSnapshot) -> Self {
        let mut m = Self {
            nr_cus: snap.cus.len() as u64,
            nr_busy_cus: snap.cus.iter().filter(|c| c.curr.is_some()).count() as u64,
            nr_streams: snap.streams.len() as u64,
            nr_running: snap.nr_running() as u64,
            nr_kernels: snap.nr_kernels(),
            nr_completed: snap.nr_completed(),
            ..Default::default()
        };
        for cu in &snap.cus {
            m.nr_switches += cu.nr_switches;
            m.nr_preemptions += cu.nr_preemptions;
            m.nr_timeouts += cu.nr_timeouts;
            m.nr_blocks += cu.nr_blocks;
        }
        for s in &snap.streams {
            let wait_us = s.se.wait_ns / 1000;
            match s.se.priority {
                Priority::High => m.high_wait_us += wait_us,
                Priority::Low => m.low_wait_us += wait_us,
            }
        }
        m
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[{}] xcu -> busy: {:>2}/{:<2} q: {:<3} | vs: {:<3} | kernels -> sub: {:<7} done: {:<7} | sw: {:<5} pre: {:<5} to: {:<5} blk: {:<5} | wait_us -> hi: {:<8} lo: {:<8}",
            crate::SCHEDULER_NAME,
            self.nr_busy_cus,
            self.nr_cus,
            self.nr_running,
            self.nr_streams,
            self.nr_kernels,
            self.nr_completed,
            self.nr_switches,
            self.nr_preemptions,
            self.nr_timeouts,
            self.nr_blocks,
            self.high_wait_us,
            self.low_wait_us,
        )?;
        Ok(())
    }

    /// Per-interval view: counters become deltas, gauges stay as they are.
    pub fn delta(&self, rhs: &Self) -> Self {
        Self {
            nr_kernels: self.nr_kernels.saturating_sub(rhs.nr_kernels),
            nr_completed: self.nr_completed.saturating_sub(rhs.nr_completed),
            nr_switches: self.nr_switches.saturating_sub(rhs.nr_switches),
            nr_preemptions: self.nr_preemptions.saturating_sub(rhs.nr_preemptions),
            nr_timeouts: self.nr_timeouts.saturating_sub(rhs.nr_timeouts),
            nr_blocks: self.nr_blocks.saturating_sub(rhs.nr_blocks),
            ..self.clone()
        }
    }
}
