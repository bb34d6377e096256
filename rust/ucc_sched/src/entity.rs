// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduling entity embedded in every vstream.
//!
//! An entity carries two locks. `lock` is the entity lock: client paths
//! (wake-up, teardown) and the worker's block path take it to make
//! "check state, then enqueue/dequeue" atomic, and it is always acquired
//! before the owning CU lock. `inner` is a leaf lock guarding the fields the
//! worker touches while it already holds the CU lock; nothing else is ever
//! acquired while `inner` is held.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use crate::stats::EntityStats;
use crate::types::{CuId, Priority, SeFlag, SeState, Step};
use crate::lock_unpoisoned;

#[derive(Debug, Default, Clone)]
pub(crate) struct SeStats {
    wait_start: Option<Instant>,
    preempt_start: Option<Instant>,
    run_start: Option<Instant>,
    pub wait: Duration,
    pub preempt_wait: Duration,
    pub run: Duration,
    pub nr_kernels: u64,
    pub nr_submits: u64,
    pub nr_timeouts: u64,
    pub nr_preempted: u64,
    pub nr_blocks: u64,
}

impl SeStats {
    fn start_wait(&mut self, now: Instant) {
        self.wait_start.get_or_insert(now);
    }

    fn end_wait(&mut self, now: Instant) {
        if let Some(start) = self.wait_start.take() {
            self.wait += now.saturating_duration_since(start);
        }
    }

    fn start_preempt(&mut self, now: Instant) {
        self.preempt_start.get_or_insert(now);
    }

    fn end_preempt(&mut self, now: Instant) {
        if let Some(start) = self.preempt_start.take() {
            self.preempt_wait += now.saturating_duration_since(start);
        }
    }

    fn start_run(&mut self, now: Instant) {
        self.run_start.get_or_insert(now);
    }

    fn end_run(&mut self, now: Instant) {
        if let Some(start) = self.run_start.take() {
            self.run += now.saturating_duration_since(start);
        }
    }
}

#[derive(Debug)]
pub(crate) struct SeInner {
    pub on_cu: bool,
    pub state: SeState,
    pub flag: SeFlag,
    pub priority: Priority,
    pub step: Step,
    /// Compute unit chosen on the first wake-up, kept for the entity's life.
    pub cu: Option<CuId>,
    pub stats: SeStats,
}

impl SeInner {
    /// Linked into a run queue.
    pub fn mark_enqueued(&mut self, now: Instant) {
        self.on_cu = true;
        if matches!(self.state, SeState::Prepare | SeState::Block) {
            self.state = SeState::Ready;
        }
        self.stats.start_wait(now);
    }

    /// Unlinked from its run queue. `was_curr` tells whether it was the
    /// unit's running entity at that moment.
    pub fn mark_dequeued(&mut self, now: Instant, was_curr: bool) {
        self.on_cu = false;
        if was_curr {
            self.stats.end_run(now);
        } else {
            self.stats.end_wait(now);
        }
        self.stats.end_preempt(now);
        self.flag = SeFlag::None;
    }

    /// Selected as the unit's running entity.
    pub fn mark_running(&mut self, now: Instant) {
        self.stats.end_wait(now);
        self.stats.start_run(now);
        self.state = SeState::Running;
    }

    /// Lost the unit to another entity but stays queued.
    pub fn mark_switched_out(&mut self, now: Instant, preempted: bool) {
        self.stats.end_run(now);
        self.stats.end_preempt(now);
        if preempted {
            self.stats.nr_preempted += 1;
        }
        if self.state == SeState::Running {
            self.state = SeState::Ready;
        }
        self.stats.start_wait(now);
    }

    pub fn flag_preempt(&mut self, now: Instant) {
        self.flag = SeFlag::Preempt;
        self.stats.start_preempt(now);
    }

    pub fn account_submit(&mut self, nr_kernels: u64) {
        self.stats.nr_submits += 1;
        self.stats.nr_kernels += nr_kernels;
    }

    pub fn account_timeout(&mut self) {
        self.stats.nr_timeouts += 1;
    }

    pub fn account_block(&mut self) {
        self.stats.nr_blocks += 1;
    }

    fn snapshot(&self, now: Instant) -> EntityStats {
        // Fold in the phases still in progress so readers see live totals.
        let open = |start: Option<Instant>| {
            start.map_or(Duration::ZERO, |s| now.saturating_duration_since(s))
        };
        EntityStats {
            state: self.state,
            priority: self.priority,
            step: self.step,
            on_cu: self.on_cu,
            cu: self.cu,
            wait_ns: (self.stats.wait + open(self.stats.wait_start)).as_nanos() as u64,
            preempt_wait_ns: (self.stats.preempt_wait + open(self.stats.preempt_start)).as_nanos()
                as u64,
            run_ns: (self.stats.run + open(self.stats.run_start)).as_nanos() as u64,
            nr_kernels: self.stats.nr_kernels,
            nr_submits: self.stats.nr_submits,
            nr_timeouts: self.stats.nr_timeouts,
            nr_preempted: self.stats.nr_preempted,
            nr_blocks: self.stats.nr_blocks,
        }
    }
}

#[derive(Debug)]
pub struct SchedEntity {
    lock: Mutex<()>,
    inner: Mutex<SeInner>,
}

impl SchedEntity {
    pub(crate) fn new(priority: Priority, step: Step) -> Self {
        Self {
            lock: Mutex::new(()),
            inner: Mutex::new(SeInner {
                on_cu: false,
                state: SeState::Prepare,
                flag: SeFlag::None,
                priority,
                step,
                cu: None,
                stats: SeStats::default(),
            }),
        }
    }

    /// Entity lock; see the module docs for the ordering rule.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        lock_unpoisoned(&self.lock)
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, SeInner> {
        lock_unpoisoned(&self.inner)
    }

    pub fn state(&self) -> SeState {
        self.inner().state
    }

    pub fn flag(&self) -> SeFlag {
        self.inner().flag
    }

    pub fn priority(&self) -> Priority {
        self.inner().priority
    }

    pub fn step(&self) -> Step {
        self.inner().step
    }

    pub fn on_cu(&self) -> bool {
        self.inner().on_cu
    }

    pub fn cu(&self) -> Option<CuId> {
        self.inner().cu
    }

    pub fn stats(&self) -> EntityStats {
        self.inner().snapshot(Instant::now())
    }
}
