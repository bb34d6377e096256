// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler core: registration, CU selection and the client operations.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use log::debug;
use log::info;
use log::warn;

use crate::completion::{Completion, CqTable};
use crate::config::SchedConfig;
use crate::error::{Result, UccError};
use crate::group::{GroupKind, GroupRef, XpuGroups, XpuOps};
use crate::stats::{CuStats, EntityStats, SchedSnapshot, StreamStats};
use crate::types::{CqId, CuId, DevId, Priority, SeState, Step, StreamId, TsId};
use crate::vstream::{StreamParams, StreamTable, VStream};
use crate::xcu::Xcu;
use crate::{read_unpoisoned, write_unpoisoned};

/// Multiplexes virtual streams onto registered compute units.
///
/// Share it between client threads behind an `Arc`. Dropping it stops and
/// joins every worker.
#[derive(Debug)]
pub struct UccScheduler {
    config: SchedConfig,
    /// Append-only; a `CuId` is an index into it.
    xcus: RwLock<Vec<Arc<Xcu>>>,
    streams: StreamTable,
    groups: Arc<XpuGroups>,
    cqs: Arc<CqTable>,
}

impl UccScheduler {
    pub fn new(config: SchedConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            xcus: RwLock::new(Vec::with_capacity(config.max_compute_units)),
            streams: StreamTable::new(config.max_streams),
            groups: Arc::new(XpuGroups::new()),
            cqs: Arc::new(CqTable::new(config.max_cqs)),
            config,
        })
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn groups(&self) -> &XpuGroups {
        &self.groups
    }

    fn device_group(&self, dev: DevId) -> Option<GroupRef> {
        self.groups.find(self.groups.root(), dev.0)
    }

    fn device_ops(&self, dev: DevId) -> Option<Arc<dyn XpuOps>> {
        self.device_group(dev).and_then(|g| self.groups.ops(g))
    }

    /// Attach a device with the backend its compute units submit through.
    pub fn register_device(&self, dev: DevId, ops: Arc<dyn XpuOps>) -> Result<()> {
        let group = self
            .groups
            .alloc_and_attach(self.groups.root(), GroupKind::Device, dev.0)
            .map_err(|e| match e {
                UccError::GroupExists { .. } => UccError::DeviceExists(dev),
                e => e,
            })?;
        self.groups.set_ops(group, ops);
        info!("registered {dev}");
        Ok(())
    }

    /// Allocate `count` compute units bound to `(dev, ts)` and start their
    /// workers. Fails without side effects if the table cannot hold them.
    pub fn register_compute_units(&self, dev: DevId, ts: TsId, count: usize) -> Result<Vec<CuId>> {
        let dev_group = self.device_group(dev).ok_or(UccError::UnknownDevice(dev))?;
        let ops = self
            .groups
            .ops(dev_group)
            .ok_or(UccError::UnknownDevice(dev))?;

        let mut xcus = write_unpoisoned(&self.xcus);
        let available = self.config.max_compute_units - xcus.len();
        if count > available {
            warn!("cannot register {count} compute units for {dev}/{ts}: {available} slots left");
            return Err(UccError::CuTableFull {
                requested: count,
                available,
            });
        }

        let ts_group = match self.groups.find(dev_group, ts.0) {
            Some(group) => group,
            None => self
                .groups
                .alloc_and_attach(dev_group, GroupKind::TaskQueue, ts.0)?,
        };

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = CuId(xcus.len() as u32);
            let group = self
                .groups
                .alloc_and_attach(ts_group, GroupKind::ComputeUnit, id.0)?;
            let xcu = Xcu::new(
                id,
                dev,
                ts,
                group,
                self.groups.clone(),
                ops.clone(),
                self.cqs.clone(),
                self.config.completion_timeout,
            );
            xcu.start()?;
            xcus.push(xcu);
            ids.push(id);
        }
        info!("registered {count} compute units for {dev}/{ts}: {ids:?}");
        Ok(ids)
    }

    pub fn xcu(&self, cu: CuId) -> Option<Arc<Xcu>> {
        read_unpoisoned(&self.xcus).get(cu.0 as usize).cloned()
    }

    pub fn nr_compute_units(&self) -> usize {
        read_unpoisoned(&self.xcus).len()
    }

    /// Least loaded active unit serving `(dev, ts)`; the lowest id wins ties.
    fn pick_cu(&self, dev: DevId, ts: TsId) -> Result<Arc<Xcu>> {
        read_unpoisoned(&self.xcus)
            .iter()
            .filter(|xcu| xcu.serves(dev, ts))
            .min_by_key(|xcu| xcu.nr_running())
            .cloned()
            .ok_or_else(|| {
                warn!("no compute unit serves {dev}/{ts}");
                UccError::NoComputeUnit { dev, ts }
            })
    }

    pub fn select_cu(&self, dev: DevId, ts: TsId) -> Result<CuId> {
        self.pick_cu(dev, ts).map(|xcu| xcu.id())
    }

    /// Create a vstream and its scheduling entity. The entity is placed on a
    /// compute unit at its first wake-up.
    pub fn alloc(&self, params: StreamParams) -> Result<StreamId> {
        if !read_unpoisoned(&self.xcus)
            .iter()
            .any(|xcu| xcu.serves(params.dev, params.ts))
        {
            warn!("alloc: no compute unit serves {}/{}", params.dev, params.ts);
            return Err(UccError::NoComputeUnit {
                dev: params.dev,
                ts: params.ts,
            });
        }

        let (cq, owns_cq) = match params.cq {
            Some(cq) if self.cqs.contains(cq) => (cq, false),
            Some(cq) => return Err(UccError::UnknownCq(cq)),
            None => (self.cqs.create()?, true),
        };
        let high_water = params
            .sq_high_water
            .unwrap_or(self.config.sq_high_water)
            .max(1);

        match self
            .streams
            .insert(|id| VStream::new(id, &params, cq, owns_cq, high_water))
        {
            Ok(stream) => {
                debug!(
                    "alloc {} on {}/{} prio={} step={:?} cq={}",
                    stream.id(),
                    params.dev,
                    params.ts,
                    params.priority,
                    params.step,
                    cq
                );
                Ok(stream.id())
            }
            Err(e) => {
                if owns_cq {
                    self.cqs.destroy(cq);
                }
                warn!("alloc on {}/{} failed: {e}", params.dev, params.ts);
                Err(e)
            }
        }
    }

    pub fn stream(&self, id: StreamId) -> Result<Arc<VStream>> {
        self.streams.get(id)
    }

    pub fn nr_streams(&self) -> usize {
        self.streams.len()
    }

    /// Tear a stream down. Blocks until its worker is no longer submitting
    /// for it; the handle is stale as soon as this is called.
    pub fn free(&self, id: StreamId) -> Result<()> {
        let stream = self.streams.remove(id)?;
        let xcu = {
            let _guard = stream.se().lock();
            let cu = {
                let mut se = stream.se().inner();
                se.state = SeState::Dead;
                se.cu
            };
            let xcu = cu.and_then(|cu| self.xcu(cu));
            if let Some(xcu) = &xcu {
                xcu.dequeue(&stream);
            }
            xcu
        };

        let ops = match &xcu {
            Some(xcu) => {
                xcu.wake_running();
                xcu.wait_unscheduled(id, self.config.free_poll_interval);
                Some(xcu.ops().clone())
            }
            None => self.device_ops(stream.dev()),
        };
        if let Some(ops) = ops {
            ops.finish(&stream);
        }
        if stream.owns_cq() {
            self.cqs.destroy(stream.cq());
        }
        debug!("freed {id}");
        Ok(())
    }

    /// The client queued commands up to `tail`.
    pub fn kick(&self, id: StreamId, tail: u32) -> Result<()> {
        let stream = self.streams.get(id)?;
        stream.set_tail(tail)?;
        self.enqueue_stream(&stream)
    }

    /// Make the stream runnable. A no-op if it is already queued.
    pub fn wake_up(&self, id: StreamId) -> Result<()> {
        let stream = self.streams.get(id)?;
        self.enqueue_stream(&stream)
    }

    fn enqueue_stream(&self, stream: &Arc<VStream>) -> Result<()> {
        let _guard = stream.se().lock();
        let (on_cu, state, cached) = {
            let se = stream.se().inner();
            (se.on_cu, se.state, se.cu)
        };
        if state == SeState::Dead {
            return Err(UccError::StreamDead(stream.id()));
        }
        if on_cu {
            return Ok(());
        }
        let xcu = match cached.and_then(|cu| self.xcu(cu)) {
            Some(xcu) => xcu,
            None => {
                let xcu = self.pick_cu(stream.dev(), stream.ts())?;
                debug!("{} placed on {}", stream.id(), xcu.id());
                xcu
            }
        };
        xcu.enqueue(stream);
        Ok(())
    }

    /// Take the stream off its run queue until the next wake-up. Calling it
    /// on a stream that is not queued changes nothing.
    pub fn dequeue(&self, id: StreamId) -> Result<()> {
        let stream = self.streams.get(id)?;
        let _guard = stream.se().lock();
        if let Some(xcu) = stream.se().cu().and_then(|cu| self.xcu(cu)) {
            xcu.dequeue(&stream);
        }
        Ok(())
    }

    /// Drain completions posted to `cq`, blocking up to `timeout` while it
    /// is empty. Returns an empty vector on timeout.
    pub fn wait(&self, cq: CqId, timeout: Duration) -> Result<Vec<Completion>> {
        self.cqs.wait(cq, timeout)
    }

    /// A completion queue streams can share through `StreamParams::cq`.
    pub fn create_cq(&self) -> Result<CqId> {
        self.cqs.create()
    }

    pub fn destroy_cq(&self, cq: CqId) -> Result<()> {
        if self.cqs.destroy(cq) {
            Ok(())
        } else {
            Err(UccError::UnknownCq(cq))
        }
    }

    pub fn set_priority(&self, id: StreamId, priority: Priority) -> Result<()> {
        let stream = self.streams.get(id)?;
        let _guard = stream.se().lock();
        match stream.se().cu().and_then(|cu| self.xcu(cu)) {
            Some(xcu) => xcu.set_priority(&stream, priority),
            None => stream.se().inner().priority = priority,
        }
        Ok(())
    }

    pub fn set_step(&self, id: StreamId, step: Step) -> Result<()> {
        let stream = self.streams.get(id)?;
        stream.se().inner().step = step;
        Ok(())
    }

    pub fn stream_stats(&self, id: StreamId) -> Result<EntityStats> {
        Ok(self.streams.get(id)?.se().stats())
    }

    pub fn cu_stats(&self, cu: CuId) -> Option<CuStats> {
        self.xcu(cu).map(|xcu| xcu.stats())
    }

    pub fn snapshot(&self) -> SchedSnapshot {
        let cus = read_unpoisoned(&self.xcus)
            .iter()
            .map(|xcu| xcu.stats())
            .collect();
        let streams = self
            .streams
            .streams()
            .iter()
            .map(|s| StreamStats {
                id: s.id(),
                dev: s.dev(),
                ts: s.ts(),
                cq: s.cq(),
                pending: s.pending(),
                inflight: s.inflight(),
                nr_completed: s.nr_completed(),
                se: s.se().stats(),
            })
            .collect();
        SchedSnapshot { cus, streams }
    }

    /// Stop every worker and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        let xcus = read_unpoisoned(&self.xcus).clone();
        for xcu in &xcus {
            xcu.shutdown();
        }
        for xcu in &xcus {
            xcu.join();
        }
    }
}

impl Drop for UccScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
