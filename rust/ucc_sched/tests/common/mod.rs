// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use simplelog::{Config, LevelFilter, TestLogger};
use ucc_sched::{
    DevId, Priority, RunContext, SchedConfig, StreamId, StreamParams, TsId, UccScheduler, VStream,
    XpuOps,
};

/// Install the test logger. Later calls in the same process are ignored.
pub fn setup_test() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
}

/// Poll `cond` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

pub const LONG: Duration = Duration::from_secs(10);

/// How many pending commands a `TestDevice` takes per run.
#[derive(Clone, Copy, Debug)]
pub enum Consume {
    /// Take nothing and report zero.
    Nothing,
    Batch(u32),
    All,
    /// Report zero for streams of this priority, take everything otherwise.
    Refuse(Priority),
    /// Reject every submission with an error code.
    Fail,
}

/// Error code `Consume::Fail` reports.
pub const EIO: i32 = -5;

/// Closable barrier that `run` passes through before taking commands.
#[derive(Debug, Default)]
pub struct Gate {
    closed: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.cv.notify_all();
    }

    fn pass(&self) {
        let closed = self.closed.lock().unwrap();
        let _open = self.cv.wait_while(closed, |closed| *closed).unwrap();
    }
}

/// Backend recording every `run` call, completing submissions on the spot.
#[derive(Debug)]
pub struct TestDevice {
    consume: Consume,
    pub gate: Gate,
    runs: Mutex<Vec<StreamId>>,
    finished: Mutex<Vec<StreamId>>,
}

impl TestDevice {
    pub fn new(consume: Consume) -> Arc<Self> {
        Arc::new(Self {
            consume,
            gate: Gate::default(),
            runs: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        })
    }

    /// Stream ids in the order `run` was entered.
    pub fn runs(&self) -> Vec<StreamId> {
        self.runs.lock().unwrap().clone()
    }

    pub fn nr_runs(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn runs_of(&self, id: StreamId) -> usize {
        self.runs().iter().filter(|r| **r == id).count()
    }

    pub fn finished(&self) -> Vec<StreamId> {
        self.finished.lock().unwrap().clone()
    }
}

impl XpuOps for TestDevice {
    fn run(&self, ctx: &RunContext, stream: &Arc<VStream>) -> i32 {
        self.runs.lock().unwrap().push(stream.id());
        self.gate.pass();
        let pending = stream.pending();
        let n = match self.consume {
            Consume::Nothing => 0,
            Consume::Batch(batch) => pending.min(batch),
            Consume::All => pending,
            Consume::Refuse(prio) if stream.se().priority() == prio => 0,
            Consume::Refuse(_) => pending,
            Consume::Fail => return EIO,
        };
        if n == 0 {
            return 0;
        }
        if stream.update_head(n).is_err() {
            return -1;
        }
        ctx.completer().complete(stream, n);
        n as i32
    }

    fn finish(&self, stream: &VStream) {
        self.finished.lock().unwrap().push(stream.id());
    }
}

/// Scheduler with one device (`dev0`) and `nr_cus` units on `ts0`.
pub fn sched_with(device: Arc<TestDevice>, nr_cus: usize, config: SchedConfig) -> UccScheduler {
    let sched = UccScheduler::new(config).unwrap();
    sched.register_device(DevId(0), device).unwrap();
    sched
        .register_compute_units(DevId(0), TsId(0), nr_cus)
        .unwrap();
    sched
}

pub fn sched(device: Arc<TestDevice>, nr_cus: usize) -> UccScheduler {
    sched_with(device, nr_cus, SchedConfig::default())
}

pub fn params() -> StreamParams {
    StreamParams::new(DevId(0), TsId(0))
}
