// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Bitmap-indexed two-tier FIFO run queue of a compute unit.

use std::collections::VecDeque;
use std::sync::Arc;

use static_assertions::const_assert;

use crate::types::{Priority, StreamId, PRIO_LEVELS};
use crate::vstream::VStream;

const_assert!(PRIO_LEVELS <= u8::BITS as usize);

/// One FIFO per tier. Bit `p` of `bitmap` is set iff `queues[p]` is
/// non-empty, so the most urgent tier is the lowest set bit.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    queues: [VecDeque<Arc<VStream>>; PRIO_LEVELS],
    bitmap: u8,
    nr_running: usize,
}

impl RunQueue {
    pub fn enqueue_tail(&mut self, stream: Arc<VStream>, prio: Priority) {
        let p = prio.index();
        self.queues[p].push_back(stream);
        self.bitmap |= 1 << p;
        self.nr_running += 1;
    }

    /// Unlink `id` from tier `prio`. Returns false if it was not there.
    pub fn remove(&mut self, id: StreamId, prio: Priority) -> bool {
        let p = prio.index();
        let Some(pos) = self.queues[p].iter().position(|s| s.id() == id) else {
            return false;
        };
        self.queues[p].remove(pos);
        if self.queues[p].is_empty() {
            self.bitmap &= !(1 << p);
        }
        self.nr_running -= 1;
        true
    }

    /// Move `id` to the tail of tier `prio`.
    pub fn requeue_tail(&mut self, id: StreamId, prio: Priority) -> bool {
        let p = prio.index();
        let Some(pos) = self.queues[p].iter().position(|s| s.id() == id) else {
            return false;
        };
        if let Some(stream) = self.queues[p].remove(pos) {
            self.queues[p].push_back(stream);
        }
        true
    }

    fn first_tier(&self) -> Option<usize> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as usize)
        }
    }

    /// Head of the most urgent non-empty tier.
    pub fn peek_highest(&self) -> Option<&Arc<VStream>> {
        self.first_tier().and_then(|p| self.queues[p].front())
    }

    pub fn nr_running(&self) -> usize {
        self.nr_running
    }

    pub fn is_empty(&self) -> bool {
        self.nr_running == 0
    }

    #[cfg(test)]
    pub fn tier_len(&self, prio: Priority) -> usize {
        self.queues[prio.index()].len()
    }

    /// Queued stream ids, most urgent tier first, FIFO within a tier.
    pub fn ids(&self) -> Vec<StreamId> {
        self.queues
            .iter()
            .flat_map(|q| q.iter().map(|s| s.id()))
            .collect()
    }
}
