// SPDX-License-Identifier: MPL-2.0

use alloc::{collections::BTreeMap, vec::Vec};
use core::ops::Range;

use spin::Mutex;

use crate::{CacheFlush, Paddr, SysmmuIo};

/// Records every flushed range.
#[derive(Default)]
pub struct RecordingFlush {
    ranges: Mutex<Vec<Range<Paddr>>>,
}

impl RecordingFlush {
    pub fn take(&self) -> Vec<Range<Paddr>> {
        core::mem::take(&mut *self.ranges.lock())
    }
}

impl CacheFlush for RecordingFlush {
    fn flush_range(&self, range: Range<Paddr>) {
        self.ranges.lock().push(range);
    }
}

/// Registers backed by a map, which log every write.
#[derive(Default)]
pub struct FakeRegs {
    values: Mutex<BTreeMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
}

impl FakeRegs {
    pub fn set(&self, offset: usize, value: u32) {
        self.values.lock().insert(offset, value);
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.values.lock().get(&offset).copied().unwrap_or(0)
    }

    pub fn take_writes(&self) -> Vec<(usize, u32)> {
        core::mem::take(&mut *self.writes.lock())
    }

    /// Returns the values written to `offset`, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(reg, _)| *reg == offset)
            .map(|&(_, value)| value)
            .collect()
    }
}

impl SysmmuIo for FakeRegs {
    fn read(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.writes.lock().push((offset, value));
        self.set(offset, value);
    }
}
