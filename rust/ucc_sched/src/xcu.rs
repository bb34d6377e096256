// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Compute units and their worker loop.
//!
//! Each [`Xcu`] owns a run queue guarded by its own lock and a dedicated
//! thread that repeatedly picks the most urgent entity and submits its
//! pending commands to the device. The worker sleeps on one of two
//! channels: the idle channel while the run queue is empty, and the running
//! channel (bounded by the completion timeout) while it waits for the device
//! to retire work.
//!
//! Lock order: entity lock, then the CU lock, then leaf locks (entity
//! `inner`, the group tree, the running channel, the submitting slot).

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::warn;
use metrics::counter;
use metrics::Counter;

use crate::completion::{Completer, CqTable, WakeSignal};
use crate::error::Result;
use crate::group::{GroupRef, RunContext, XpuGroups, XpuOps};
use crate::lock_unpoisoned;
use crate::runqueue::RunQueue;
use crate::stats::CuStats;
use crate::types::{CuId, CuState, DevId, Priority, SeFlag, SeState, StreamId, TsId};
use crate::vstream::VStream;

/// What an enqueue asks of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Preempt {
    None,
    /// Nothing is running; wake the idle wait.
    WakeIdle,
    /// The running entity was flagged; wake the running wait.
    WakeRunning,
}

#[derive(Debug, Default)]
struct XcuInner {
    rq: RunQueue,
    curr: Option<Arc<VStream>>,
    /// Commands submitted by `curr` since it was last scheduled in. A round
    /// in which the device took nothing counts as one.
    submitted_since_resched: u64,
}

#[derive(Debug, Default)]
struct XcuCounters {
    switches: AtomicU64,
    preemptions: AtomicU64,
    submits: AtomicU64,
    kernels: AtomicU64,
    timeouts: AtomicU64,
    blocks: AtomicU64,
}

struct Metrics {
    kernels_submitted: Counter,
    preemptions: Counter,
    completion_timeouts: Counter,
    blocks: Counter,
    context_switches: Counter,
}

impl Metrics {
    fn new(cu: CuId) -> Self {
        let cu = cu.0.to_string();
        Self {
            kernels_submitted: counter!("ucc_kernels_submitted_total", "cu" => cu.clone()),
            preemptions: counter!("ucc_preemptions_total", "cu" => cu.clone()),
            completion_timeouts: counter!("ucc_completion_timeouts_total", "cu" => cu.clone()),
            blocks: counter!("ucc_blocks_total", "cu" => cu.clone()),
            context_switches: counter!("ucc_context_switches_total", "cu" => cu),
        }
    }
}

pub struct Xcu {
    id: CuId,
    dev: DevId,
    ts: TsId,
    group: GroupRef,
    groups: Arc<XpuGroups>,
    ops: Arc<dyn XpuOps>,
    ctx: RunContext,
    completion_timeout: Duration,
    state: AtomicU8,
    inner: Mutex<XcuInner>,
    idle_cv: Condvar,
    /// Mirror of `rt_nr_running`, written under the CU lock, read lock-free
    /// by CU selection.
    nr_running: AtomicUsize,
    wake: Arc<WakeSignal>,
    /// Entity the worker is submitting for, if any. Teardown waits on
    /// `sched_cv` until its entity is no longer here.
    submitting: Mutex<Option<StreamId>>,
    sched_cv: Condvar,
    counters: XcuCounters,
    metrics: Metrics,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Xcu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xcu")
            .field("id", &self.id)
            .field("dev", &self.dev)
            .field("ts", &self.ts)
            .field("state", &self.state())
            .field("nr_running", &self.nr_running())
            .finish()
    }
}

impl Xcu {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: CuId,
        dev: DevId,
        ts: TsId,
        group: GroupRef,
        groups: Arc<XpuGroups>,
        ops: Arc<dyn XpuOps>,
        cqs: Arc<CqTable>,
        completion_timeout: Duration,
    ) -> Arc<Self> {
        let wake = Arc::new(WakeSignal::default());
        let completer = Completer::new(cqs, wake.clone());
        Arc::new(Self {
            id,
            dev,
            ts,
            group,
            groups,
            ops,
            ctx: RunContext::new(id, dev, ts, completer),
            completion_timeout,
            state: AtomicU8::new(CuState::Inactive as u8),
            inner: Mutex::new(XcuInner::default()),
            idle_cv: Condvar::new(),
            nr_running: AtomicUsize::new(0),
            wake,
            submitting: Mutex::new(None),
            sched_cv: Condvar::new(),
            counters: XcuCounters::default(),
            metrics: Metrics::new(id),
            worker: Mutex::new(None),
        })
    }

    /// Move INACTIVE -> IDLE and spawn the worker.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        self.state.store(CuState::Idle as u8, Ordering::Release);
        let xcu = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("ucc-{}", self.id))
            .spawn(move || xcu.worker_loop());
        match spawned {
            Ok(handle) => {
                *lock_unpoisoned(&self.worker) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.store(CuState::Inactive as u8, Ordering::Release);
                Err(e.into())
            }
        }
    }

    pub fn id(&self) -> CuId {
        self.id
    }

    pub fn dev(&self) -> DevId {
        self.dev
    }

    pub fn ts(&self) -> TsId {
        self.ts
    }

    pub fn state(&self) -> CuState {
        CuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() != CuState::Inactive
    }

    pub fn nr_running(&self) -> usize {
        self.nr_running.load(Ordering::Acquire)
    }

    pub(crate) fn serves(&self, dev: DevId, ts: TsId) -> bool {
        self.dev == dev && self.ts == ts && self.is_active()
    }

    pub(crate) fn ops(&self) -> &Arc<dyn XpuOps> {
        &self.ops
    }

    /// Transition state unless the unit was already shut down.
    fn set_state(&self, state: CuState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != CuState::Inactive as u8).then_some(state as u8)
            });
    }

    fn lock(&self) -> MutexGuard<'_, XcuInner> {
        lock_unpoisoned(&self.inner)
    }

    fn sync_nr_running(&self, inner: &XcuInner) {
        self.nr_running
            .store(inner.rq.nr_running(), Ordering::Release);
    }

    /// Link `stream` at the tail of its tier and nudge the worker. The
    /// caller holds the entity lock.
    pub(crate) fn enqueue(&self, stream: &Arc<VStream>) {
        let now = Instant::now();
        let mut inner = self.lock();
        let prio = {
            let mut se = stream.se().inner();
            if se.on_cu {
                return;
            }
            se.mark_enqueued(now);
            se.cu = Some(self.id);
            se.priority
        };
        inner.rq.enqueue_tail(stream.clone(), prio);
        self.sync_nr_running(&inner);

        let action = self.check_preempt(&inner, stream.id(), prio, now);
        self.kick_worker(action);
    }

    fn check_preempt(
        &self,
        inner: &XcuInner,
        id: StreamId,
        prio: Priority,
        now: Instant,
    ) -> Preempt {
        let Some(curr) = &inner.curr else {
            return Preempt::WakeIdle;
        };
        if curr.id() == id {
            return Preempt::None;
        }
        let mut curr_se = curr.se().inner();
        if prio.preempts(curr_se.priority) {
            if curr_se.flag != SeFlag::Preempt {
                debug!("{}: {} requests preemption of {}", self.id, id, curr.id());
            }
            curr_se.flag_preempt(now);
            Preempt::WakeRunning
        } else {
            Preempt::None
        }
    }

    fn kick_worker(&self, action: Preempt) {
        match action {
            Preempt::WakeIdle => self.idle_cv.notify_all(),
            Preempt::WakeRunning => self.wake.notify(),
            Preempt::None => {}
        }
    }

    /// Unlink `stream` from the run queue. Returns false if it was not
    /// queued, in which case nothing changes.
    pub(crate) fn dequeue(&self, stream: &VStream) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut se = stream.se().inner();
        if !se.on_cu {
            return false;
        }
        inner.rq.remove(stream.id(), se.priority);
        let was_curr = inner
            .curr
            .as_ref()
            .map_or(false, |curr| curr.id() == stream.id());
        if was_curr {
            inner.curr = None;
        }
        se.mark_dequeued(now, was_curr);
        drop(se);
        self.sync_nr_running(&inner);
        true
    }

    /// Change the tier of `stream`. A queued entity moves to the tail of the
    /// new tier and the preemption check runs again. The caller holds the
    /// entity lock.
    pub(crate) fn set_priority(&self, stream: &Arc<VStream>, prio: Priority) {
        let now = Instant::now();
        let mut inner = self.lock();
        let (on_cu, old) = {
            let mut se = stream.se().inner();
            let old = se.priority;
            se.priority = prio;
            (se.on_cu, old)
        };
        if !on_cu || old == prio {
            return;
        }
        inner.rq.remove(stream.id(), old);
        inner.rq.enqueue_tail(stream.clone(), prio);

        let is_curr = inner
            .curr
            .as_ref()
            .map_or(false, |curr| curr.id() == stream.id());
        let action = if is_curr {
            // Demoted below something already waiting.
            let waiting = inner
                .rq
                .peek_highest()
                .map(|head| head.se().priority())
                .filter(|head_prio| head_prio.preempts(prio));
            if waiting.is_some() {
                stream.se().inner().flag_preempt(now);
                Preempt::WakeRunning
            } else {
                Preempt::None
            }
        } else {
            self.check_preempt(&inner, stream.id(), prio, now)
        };
        self.kick_worker(action);
    }

    fn set_submitting(&self, id: Option<StreamId>) {
        *lock_unpoisoned(&self.submitting) = id;
        if id.is_none() {
            self.sched_cv.notify_all();
        }
    }

    fn worker_finished(&self) -> bool {
        lock_unpoisoned(&self.worker)
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Block until the worker is no longer submitting for `id`, re-checking
    /// at least every `poll`.
    pub(crate) fn wait_unscheduled(&self, id: StreamId, poll: Duration) {
        let mut submitting = lock_unpoisoned(&self.submitting);
        while *submitting == Some(id) {
            if self.worker_finished() {
                warn!("{}: worker gone while {} was submitting", self.id, id);
                return;
            }
            submitting = self
                .sched_cv
                .wait_timeout(submitting, poll)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Wake the running channel, e.g. after the entity it waits for left.
    pub(crate) fn wake_running(&self) {
        self.wake.notify();
    }

    fn worker_loop(self: Arc<Self>) {
        info!("{}: worker started for {}/{}", self.id, self.dev, self.ts);
        while self.is_active() {
            if let Some(curr) = self.schedule() {
                self.submit(&curr);
            }
        }
        self.groups.set_used(self.group, false);
        info!("{}: worker stopped", self.id);
    }

    /// One pass of the scheduling decision. Returns the entity to submit
    /// for, or `None` after an idle wait.
    fn schedule(&self) -> Option<Arc<VStream>> {
        let mut inner = self.lock();
        let now = Instant::now();
        let mut preempt = false;

        if let Some(prev) = inner.curr.clone() {
            let mut se = prev.se().inner();
            if se.flag != SeFlag::Preempt
                || inner.submitted_since_resched < se.step.quantum()
            {
                drop(se);
                self.set_submitting(Some(prev.id()));
                return Some(prev);
            }
            se.flag = SeFlag::None;
            let prio = se.priority;
            drop(se);
            inner.rq.requeue_tail(prev.id(), prio);
            preempt = true;
        }

        let Some(next) = inner.rq.peek_highest().cloned() else {
            self.set_state(CuState::Idle);
            self.groups.set_used(self.group, false);
            while inner.rq.is_empty() && self.is_active() {
                inner = self
                    .idle_cv
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
            return None;
        };

        let prev_id = inner.curr.as_ref().map(|c| c.id());
        if prev_id != Some(next.id()) {
            if let Some(prev) = &inner.curr {
                prev.se().inner().mark_switched_out(now, preempt);
                if preempt {
                    debug!("{}: {} preempted by {}", self.id, prev.id(), next.id());
                    self.counters.preemptions.fetch_add(1, Ordering::Relaxed);
                    self.metrics.preemptions.increment(1);
                }
            }
            next.se().inner().mark_running(now);
            inner.submitted_since_resched = 0;
            self.counters.switches.fetch_add(1, Ordering::Relaxed);
            self.metrics.context_switches.increment(1);
            debug!("{}: switch {:?} -> {}", self.id, prev_id, next.id());
        }
        inner.curr = Some(next.clone());
        self.set_state(CuState::Busy);
        self.groups.set_used(self.group, true);
        self.set_submitting(Some(next.id()));
        Some(next)
    }

    fn submit(&self, curr: &Arc<VStream>) {
        self.set_state(CuState::Submit);
        let ret = self.ops.run(&self.ctx, curr);
        self.set_state(CuState::Busy);

        if ret < 0 {
            self.set_submitting(None);
            debug!("{}: run for {} failed: {}", self.id, curr.id(), ret);
            self.block(curr, true);
            return;
        }
        if ret == 0 {
            self.set_submitting(None);
            if !curr.have_kernel() {
                self.block(curr, false);
                return;
            }
            self.charge_round(curr, 1);
            if curr.se().flag() == SeFlag::Preempt {
                return;
            }
            if self.wake.wait_timeout(self.completion_timeout) {
                debug!("{}: device busy for {}", self.id, curr.id());
            }
            return;
        }

        let n = ret as u64;
        curr.note_submitted(n);
        self.charge_round(curr, n);
        curr.se().inner().account_submit(n);
        self.counters.submits.fetch_add(1, Ordering::Relaxed);
        self.counters.kernels.fetch_add(n, Ordering::Relaxed);
        self.metrics.kernels_submitted.increment(n);
        self.set_submitting(None);

        if curr.inflight() >= curr.sq_high_water() {
            self.wait_completion(curr);
        }
    }

    /// Count `n` toward the quantum of `curr` if it still holds the unit.
    fn charge_round(&self, curr: &VStream, n: u64) {
        let mut inner = self.lock();
        if inner.curr.as_ref().map_or(false, |c| c.id() == curr.id()) {
            inner.submitted_since_resched += n;
        }
    }

    /// Bounded wait for `curr`'s outstanding work to drop below its
    /// high-water mark.
    fn wait_completion(&self, curr: &VStream) {
        let timed_out = self.wake.wait_while(self.completion_timeout, || {
            if !self.is_active() || curr.inflight() < curr.sq_high_water() {
                return false;
            }
            let se = curr.se().inner();
            se.on_cu && se.flag != SeFlag::Preempt
        });
        if timed_out {
            curr.se().inner().account_timeout();
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            self.metrics.completion_timeouts.increment(1);
            debug!(
                "{}: completion wait for {} timed out ({} in flight)",
                self.id,
                curr.id(),
                curr.inflight()
            );
        }
    }

    /// Park the entity until the client kicks it again: the ring ran dry,
    /// or the device rejected the submission (`failed`).
    fn block(&self, curr: &VStream, failed: bool) {
        let _guard = curr.se().lock();
        {
            let se = curr.se().inner();
            if se.state == SeState::Dead || !se.on_cu {
                return;
            }
        }
        // A kick that raced with the last run is visible under the entity
        // lock, and its wake-up found the entity still queued.
        if !failed && curr.have_kernel() {
            return;
        }
        self.dequeue(curr);
        {
            let mut se = curr.se().inner();
            se.state = SeState::Block;
            se.account_block();
        }
        self.counters.blocks.fetch_add(1, Ordering::Relaxed);
        self.metrics.blocks.increment(1);
        if failed {
            debug!("{}: {} blocked after a failed submission", self.id, curr.id());
        } else {
            debug!("{}: {} blocked", self.id, curr.id());
        }
    }

    /// Mark the unit INACTIVE and wake every wait channel. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.state
            .store(CuState::Inactive as u8, Ordering::Release);
        {
            let _inner = self.lock();
            self.idle_cv.notify_all();
        }
        self.wake.notify();
        {
            let _submitting = lock_unpoisoned(&self.submitting);
            self.sched_cv.notify_all();
        }
    }

    pub(crate) fn join(&self) {
        let handle = lock_unpoisoned(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{}: worker panicked", self.id);
            }
        }
    }

    pub fn stats(&self) -> CuStats {
        let inner = self.lock();
        CuStats {
            cu: self.id,
            dev: self.dev,
            ts: self.ts,
            state: self.state(),
            nr_running: inner.rq.nr_running(),
            curr: inner.curr.as_ref().map(|c| c.id()),
            queued: inner.rq.ids(),
            nr_switches: self.counters.switches.load(Ordering::Relaxed),
            nr_preemptions: self.counters.preemptions.load(Ordering::Relaxed),
            nr_submits: self.counters.submits.load(Ordering::Relaxed),
            nr_kernels: self.counters.kernels.load(Ordering::Relaxed),
            nr_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            nr_blocks: self.counters.blocks.load(Ordering::Relaxed),
        }
    }
}
