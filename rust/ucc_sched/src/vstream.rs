// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Virtual streams: the client-facing command rings and their arena.
//!
//! The scheduler never looks at ring contents. It only reads the producer
//! and consumer counters to learn whether a stream still has work, and the
//! device backend advances the consumer counter as it takes commands.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use crate::entity::SchedEntity;
use crate::error::{Result, UccError};
use crate::id_alloc::IdAllocator;
use crate::types::{CqId, DevId, Priority, Step, StreamId, TsId};
use crate::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

/// Producer/consumer counters of a command ring with `depth` slots.
///
/// One slot is kept empty so a full ring can be told apart from an empty
/// one, so at most `depth - 1` commands are pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    depth: u32,
    head: u32,
    tail: u32,
}

impl Ring {
    pub fn new(depth: u32) -> Self {
        Self {
            depth: depth.max(2),
            head: 0,
            tail: 0,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Slots from `from` forward to `to`, wrapping at `depth`.
    fn distance(&self, from: u32, to: u32) -> u32 {
        let depth = self.depth as u64;
        ((to as u64 + depth - from as u64) % depth) as u32
    }

    /// Commands written by the client but not yet taken by the device.
    pub fn pending(&self) -> u32 {
        self.distance(self.head, self.tail)
    }

    /// Free slots the client may still fill.
    pub fn credit(&self) -> u32 {
        self.depth - 1 - self.pending()
    }

    /// Move the producer pointer to `tail`.
    pub fn set_tail(&mut self, tail: u32) -> Result<()> {
        if tail >= self.depth {
            return Err(UccError::TailOutOfRange {
                tail,
                depth: self.depth,
            });
        }
        let advance = self.distance(self.tail, tail);
        if advance > self.credit() {
            return Err(UccError::RingOverflow {
                pending: self.pending().saturating_add(advance),
                depth: self.depth,
            });
        }
        self.tail = tail;
        Ok(())
    }

    /// Move the consumer pointer forward by `n` slots.
    pub fn advance_head(&mut self, n: u32) -> Result<()> {
        let pending = self.pending();
        if n > pending {
            return Err(UccError::HeadOverrun {
                requested: n,
                pending,
            });
        }
        self.head = ((self.head as u64 + n as u64) % self.depth as u64) as u32;
        Ok(())
    }
}

/// Client parameters for a new vstream.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub dev: DevId,
    pub ts: TsId,
    pub priority: Priority,
    pub step: Step,
    pub depth: u32,
    /// Share an existing completion queue instead of creating one.
    pub cq: Option<CqId>,
    /// Per-stream override of the unacknowledged-command high-water mark.
    pub sq_high_water: Option<u64>,
}

impl StreamParams {
    pub fn new(dev: DevId, ts: TsId) -> Self {
        Self {
            dev,
            ts,
            priority: Priority::Low,
            step: Step::Slow,
            depth: 1024,
            cq: None,
            sq_high_water: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.step = step;
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn cq(mut self, cq: CqId) -> Self {
        self.cq = Some(cq);
        self
    }

    pub fn sq_high_water(mut self, high_water: u64) -> Self {
        self.sq_high_water = Some(high_water);
        self
    }
}

/// A virtual stream and the scheduling entity it owns.
#[derive(Debug)]
pub struct VStream {
    id: StreamId,
    dev: DevId,
    ts: TsId,
    cq: CqId,
    owns_cq: bool,
    sq_high_water: u64,
    se: SchedEntity,
    ring: Mutex<Ring>,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl VStream {
    pub(crate) fn new(
        id: StreamId,
        params: &StreamParams,
        cq: CqId,
        owns_cq: bool,
        sq_high_water: u64,
    ) -> Self {
        Self {
            id,
            dev: params.dev,
            ts: params.ts,
            cq,
            owns_cq,
            sq_high_water,
            se: SchedEntity::new(params.priority, params.step),
            ring: Mutex::new(Ring::new(params.depth)),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn dev(&self) -> DevId {
        self.dev
    }

    pub fn ts(&self) -> TsId {
        self.ts
    }

    pub fn cq(&self) -> CqId {
        self.cq
    }

    pub(crate) fn owns_cq(&self) -> bool {
        self.owns_cq
    }

    pub fn se(&self) -> &SchedEntity {
        &self.se
    }

    pub fn ring(&self) -> Ring {
        *lock_unpoisoned(&self.ring)
    }

    /// Whether the ring still holds commands the device has not taken.
    pub fn have_kernel(&self) -> bool {
        lock_unpoisoned(&self.ring).pending() > 0
    }

    pub fn pending(&self) -> u32 {
        lock_unpoisoned(&self.ring).pending()
    }

    /// Consume `n` commands from the ring on behalf of the device.
    pub fn update_head(&self, n: u32) -> Result<()> {
        lock_unpoisoned(&self.ring).advance_head(n)
    }

    pub(crate) fn set_tail(&self, tail: u32) -> Result<()> {
        lock_unpoisoned(&self.ring).set_tail(tail)
    }

    pub fn sq_high_water(&self) -> u64 {
        self.sq_high_water
    }

    /// Commands handed to the device that it has not completed yet.
    pub fn inflight(&self) -> u64 {
        let completed = self.completed.load(Ordering::Acquire);
        self.submitted
            .load(Ordering::Acquire)
            .saturating_sub(completed)
    }

    pub(crate) fn note_submitted(&self, n: u64) {
        self.submitted.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn note_completed(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::AcqRel);
    }

    pub fn nr_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    stream: Option<Arc<VStream>>,
}

/// Arena of live vstreams addressed by generational handles.
#[derive(Debug)]
pub(crate) struct StreamTable {
    slots: RwLock<Vec<Slot>>,
    ids: Mutex<IdAllocator>,
}

impl StreamTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            ids: Mutex::new(IdAllocator::new(capacity)),
        }
    }

    pub fn insert(&self, build: impl FnOnce(StreamId) -> VStream) -> Result<Arc<VStream>> {
        let index = lock_unpoisoned(&self.ids)
            .alloc()
            .map_err(|_| UccError::StreamTableFull)?;

        let mut slots = write_unpoisoned(&self.slots);
        let idx = index as usize;
        if slots.len() <= idx {
            slots.resize_with(idx + 1, Slot::default);
        }
        let id = StreamId {
            index,
            generation: slots[idx].generation,
        };
        let stream = Arc::new(build(id));
        slots[idx].stream = Some(stream.clone());
        Ok(stream)
    }

    pub fn get(&self, id: StreamId) -> Result<Arc<VStream>> {
        let slots = read_unpoisoned(&self.slots);
        slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.stream.clone())
            .ok_or(UccError::UnknownStream(id))
    }

    /// Detach the stream from its slot; the handle goes stale immediately.
    pub fn remove(&self, id: StreamId) -> Result<Arc<VStream>> {
        let mut slots = write_unpoisoned(&self.slots);
        let slot = slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.stream.is_some())
            .ok_or(UccError::UnknownStream(id))?;
        let stream = slot.stream.take().ok_or(UccError::UnknownStream(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        lock_unpoisoned(&self.ids).free(id.index);
        Ok(stream)
    }

    pub fn streams(&self) -> Vec<Arc<VStream>> {
        read_unpoisoned(&self.slots)
            .iter()
            .filter_map(|slot| slot.stream.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.ids).nr_allocated()
    }
}
