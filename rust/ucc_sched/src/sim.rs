// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Software device backend.
//!
//! `SimDevice` takes up to `batch` commands per `run`, "executes" them on its
//! own thread after a fixed latency and reports them through the unit's
//! completer. Jobs retire in submission order.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::trace;
use log::warn;

use crate::completion::Completer;
use crate::error::Result;
use crate::group::{RunContext, XpuOps};
use crate::lock_unpoisoned;
use crate::vstream::VStream;

struct Job {
    due: Instant,
    stream: Arc<VStream>,
    completer: Completer,
    nr_kernels: u32,
}

#[derive(Debug, Default)]
struct SimCounters {
    runs: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug)]
pub struct SimDevice {
    batch: u32,
    latency: Duration,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<SimCounters>,
}

impl SimDevice {
    pub fn new(batch: u32, latency: Duration) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel::<Job>();
        let counters = Arc::new(SimCounters::default());
        let handle = {
            let counters = counters.clone();
            thread::Builder::new()
                .name("ucc-simdev".into())
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let now = Instant::now();
                        if job.due > now {
                            thread::sleep(job.due - now);
                        }
                        job.completer.complete(&job.stream, job.nr_kernels);
                        counters
                            .completed
                            .fetch_add(job.nr_kernels as u64, Ordering::Relaxed);
                        trace!("simdev: retired {} from {}", job.nr_kernels, job.stream.id());
                    }
                    debug!("simdev: stopped");
                })?
        };
        Ok(Arc::new(Self {
            batch: batch.max(1),
            latency,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            counters,
        }))
    }

    pub fn nr_runs(&self) -> u64 {
        self.counters.runs.load(Ordering::Relaxed)
    }

    pub fn nr_submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    pub fn nr_completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Retire everything queued and stop the device thread.
    pub fn stop(&self) {
        lock_unpoisoned(&self.tx).take();
        let handle = lock_unpoisoned(&self.handle).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("simdev: device thread panicked");
            }
        }
    }
}

impl XpuOps for SimDevice {
    fn run(&self, ctx: &RunContext, stream: &Arc<VStream>) -> i32 {
        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        let n = stream.pending().min(self.batch);
        if n == 0 {
            return 0;
        }
        let tx = lock_unpoisoned(&self.tx);
        let Some(tx) = tx.as_ref() else {
            return -1;
        };
        if stream.update_head(n).is_err() {
            return -1;
        }
        let job = Job {
            due: Instant::now() + self.latency,
            stream: stream.clone(),
            completer: ctx.completer().clone(),
            nr_kernels: n,
        };
        self.counters
            .submitted
            .fetch_add(n as u64, Ordering::Relaxed);
        if tx.send(job).is_err() {
            self.counters
                .submitted
                .fetch_sub(n as u64, Ordering::Relaxed);
            return -1;
        }
        n as i32
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
