// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use bitvec::prelude::*;

use crate::error::{Result, UccError};

/// Fixed-capacity id allocator backed by a bitmap.
///
/// Always hands out the lowest free id.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    used: BitVec,
}

impl IdAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            used: bitvec![0; capacity],
        }
    }

    pub fn alloc(&mut self) -> Result<u32> {
        let id = self.used.first_zero().ok_or(UccError::IdExhausted)?;
        self.used.set(id, true);
        Ok(id as u32)
    }

    /// Release `id`. Returns false if it was not allocated.
    pub fn free(&mut self, id: u32) -> bool {
        let idx = id as usize;
        if idx >= self.used.len() || !self.used[idx] {
            return false;
        }
        self.used.set(idx, false);
        true
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        self.used.get(id as usize).map_or(false, |bit| *bit)
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    pub fn nr_allocated(&self) -> usize {
        self.used.count_ones()
    }
}
