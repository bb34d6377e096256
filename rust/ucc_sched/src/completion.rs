// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Completion signalling between the device and the scheduler.
//!
//! The device reports finished commands through a [`Completer`]. That does
//! three things: credits the stream's in-flight counter, posts an entry to
//! the stream's completion queue for the client, and wakes the compute
//! unit's running-wait channel so its worker can re-evaluate.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use metrics::counter;
use serde::Deserialize;
use serde::Serialize;

use crate::error::{Result, UccError};
use crate::id_alloc::IdAllocator;
use crate::types::{CqId, StreamId};
use crate::vstream::VStream;
use crate::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

/// Wake-up channel with a sticky flag, so a notification sent before the
/// waiter blocks is not lost.
#[derive(Debug, Default)]
pub(crate) struct WakeSignal {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl WakeSignal {
    pub fn notify(&self) {
        *lock_unpoisoned(&self.woken) = true;
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub fn is_woken(&self) -> bool {
        *lock_unpoisoned(&self.woken)
    }

    /// Wait for the next notification, consuming it. Returns true if the
    /// timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock_unpoisoned(&self.woken);
        let (mut guard, res) = self
            .cv
            .wait_timeout_while(guard, timeout, |woken| !*woken)
            .unwrap_or_else(|e| e.into_inner());
        *guard = false;
        res.timed_out()
    }

    /// Block while `blocked()` holds, re-checking on every notification, for
    /// at most `timeout`. Returns true if the timeout elapsed first.
    pub fn wait_while(&self, timeout: Duration, mut blocked: impl FnMut() -> bool) -> bool {
        let guard = lock_unpoisoned(&self.woken);
        let (mut guard, res) = self
            .cv
            .wait_timeout_while(guard, timeout, |woken| {
                *woken = false;
                blocked()
            })
            .unwrap_or_else(|e| e.into_inner());
        *guard = false;
        res.timed_out()
    }
}

/// One finished batch of commands as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub stream: StreamId,
    pub nr_kernels: u32,
}

#[derive(Debug, Default)]
pub(crate) struct CompletionQueue {
    entries: Mutex<VecDeque<Completion>>,
    cv: Condvar,
}

impl CompletionQueue {
    fn post(&self, completion: Completion) {
        lock_unpoisoned(&self.entries).push_back(completion);
        self.cv.notify_all();
    }

    /// Drain everything queued, blocking up to `timeout` while empty.
    fn wait(&self, timeout: Duration) -> Vec<Completion> {
        let deadline = Instant::now() + timeout;
        let mut entries = lock_unpoisoned(&self.entries);
        while entries.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            entries = self
                .cv
                .wait_timeout(entries, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        entries.drain(..).collect()
    }
}

/// Completion queues addressed by `CqId`, distinct from the run queues.
#[derive(Debug)]
pub(crate) struct CqTable {
    queues: RwLock<HashMap<CqId, Arc<CompletionQueue>>>,
    ids: Mutex<IdAllocator>,
}

impl CqTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            ids: Mutex::new(IdAllocator::new(capacity)),
        }
    }

    pub fn create(&self) -> Result<CqId> {
        let id = CqId(lock_unpoisoned(&self.ids).alloc()?);
        write_unpoisoned(&self.queues).insert(id, Arc::new(CompletionQueue::default()));
        Ok(id)
    }

    pub fn destroy(&self, id: CqId) -> bool {
        let removed = write_unpoisoned(&self.queues).remove(&id);
        if let Some(cq) = &removed {
            // Release anyone still blocked on it.
            cq.cv.notify_all();
            lock_unpoisoned(&self.ids).free(id.0);
        }
        removed.is_some()
    }

    pub fn contains(&self, id: CqId) -> bool {
        read_unpoisoned(&self.queues).contains_key(&id)
    }

    fn get(&self, id: CqId) -> Result<Arc<CompletionQueue>> {
        read_unpoisoned(&self.queues)
            .get(&id)
            .cloned()
            .ok_or(UccError::UnknownCq(id))
    }

    pub fn post(&self, id: CqId, completion: Completion) {
        if let Ok(cq) = self.get(id) {
            cq.post(completion);
        }
    }

    pub fn wait(&self, id: CqId, timeout: Duration) -> Result<Vec<Completion>> {
        Ok(self.get(id)?.wait(timeout))
    }
}

/// Handle a device backend uses to report finished commands.
#[derive(Debug, Clone)]
pub struct Completer {
    cqs: Arc<CqTable>,
    signal: Arc<WakeSignal>,
}

impl Completer {
    pub(crate) fn new(cqs: Arc<CqTable>, signal: Arc<WakeSignal>) -> Self {
        Self { cqs, signal }
    }

    pub fn complete(&self, stream: &VStream, nr_kernels: u32) {
        if nr_kernels == 0 {
            return;
        }
        stream.note_completed(nr_kernels as u64);
        self.cqs.post(
            stream.cq(),
            Completion {
                stream: stream.id(),
                nr_kernels,
            },
        );
        counter!("ucc_kernels_completed_total").increment(nr_kernels as u64);
        self.signal.notify();
    }
}
