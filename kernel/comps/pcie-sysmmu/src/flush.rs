// SPDX-License-Identifier: MPL-2.0

use core::ops::Range;

use crate::Paddr;

/// Makes CPU writes to page table memory visible to the SysMMU table walker.
///
/// The domain calls it after every table write. A child table is always
/// flushed before the parent entry that points to it.
pub trait CacheFlush: Send + Sync {
    /// Cleans the data cache lines covering `range`.
    fn flush_range(&self, range: Range<Paddr>);
}

/// The flush of a table walker that snoops the CPU caches.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoherentFlush;

impl CacheFlush for CoherentFlush {
    fn flush_range(&self, _range: Range<Paddr>) {
        // The walker is cache coherent, and does not require synchronization.
    }
}
