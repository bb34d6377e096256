// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Synthetic clients: each owns one vstream, keeps its ring topped up in
//! bursts and drains its completion queue.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use ucc_sched::{DevId, Priority, Step, StreamId, StreamParams, TsId, UccScheduler};

#[derive(Clone, Debug)]
pub struct ClientSpec {
    pub dev: DevId,
    pub ts: TsId,
    pub priority: Priority,
    pub step: Step,
    pub depth: u32,
    pub burst: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ClientReport {
    pub queued: u64,
    pub completed: u64,
}

struct Client {
    sched: Arc<UccScheduler>,
    spec: ClientSpec,
    id: StreamId,
    tail: u32,
    report: ClientReport,
}

impl Client {
    fn new(sched: Arc<UccScheduler>, spec: ClientSpec) -> Result<Self> {
        let id = sched
            .alloc(
                StreamParams::new(spec.dev, spec.ts)
                    .priority(spec.priority)
                    .step(spec.step)
                    .depth(spec.depth),
            )
            .with_context(|| format!("failed to allocate vstream on {}/{}", spec.dev, spec.ts))?;
        Ok(Self {
            sched,
            spec,
            id,
            tail: 0,
            report: ClientReport::default(),
        })
    }

    fn run(mut self, shutdown: &AtomicBool) -> Result<ClientReport> {
        let stream = self.sched.stream(self.id)?;
        let depth = stream.ring().depth();
        let cq = stream.cq();
        drop(stream);

        while !shutdown.load(Ordering::Relaxed) {
            let credit = self.sched.stream(self.id)?.ring().credit();
            let n = credit.min(self.spec.burst);
            if n > 0 {
                self.tail = (self.tail + n) % depth;
                self.sched.kick(self.id, self.tail)?;
                self.report.queued += n as u64;
            }
            for completion in self.sched.wait(cq, Duration::from_millis(100))? {
                self.report.completed += completion.nr_kernels as u64;
            }
        }

        self.sched.free(self.id)?;
        debug!(
            "client {} ({}): queued {} completed {}",
            self.id, self.spec.priority, self.report.queued, self.report.completed
        );
        Ok(self.report)
    }
}

pub fn spawn_clients(
    sched: &Arc<UccScheduler>,
    specs: Vec<ClientSpec>,
    shutdown: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<Result<ClientReport>>>> {
    let mut handles = Vec::with_capacity(specs.len());
    for (i, spec) in specs.into_iter().enumerate() {
        let client = Client::new(sched.clone(), spec)?;
        let shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name(format!("ucc-client{i}"))
            .spawn(move || client.run(&shutdown))
            .context("failed to spawn client thread")?;
        handles.push(handle);
    }
    Ok(handles)
}
