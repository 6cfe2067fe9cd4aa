// SPDX-License-Identifier: MPL-2.0

//! Level-2 tables and their reference counting.
//!
//! A level-2 table block holds the [`NUM_LV2ENTRIES`] hardware entries
//! followed by one duplicate-mapping count per entry. The block is shared
//! with the fault path, which reads it without the table lock, so every word
//! is atomic.
//!
//! The number of free slots of a table is kept by the domain next to the
//! table handle. A small page costs one slot, a large page costs
//! [`SPAGES_PER_LPAGE`] slots, and each duplicate of a small page costs one
//! more slot without touching the hardware entry. The table is empty exactly
//! when all [`NUM_LV2ENTRIES`] slots are free again.

use core::{
    ops::Range,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    pte::Lv2Entry, Error, Paddr, Result, LPAGE_SIZE, NUM_LV2ENTRIES, SPAGES_PER_LPAGE,
};

/// The memory of one level-2 table.
#[repr(C, align(2048))]
pub struct Lv2Block {
    entries: [AtomicU32; NUM_LV2ENTRIES],
    dup_counts: [AtomicU32; NUM_LV2ENTRIES],
}

const _: () = assert!(size_of::<Lv2Block>() == crate::LV2TABLE_REFCNT_SZ);

impl Lv2Block {
    pub(crate) const fn new() -> Self {
        Self {
            entries: [const { AtomicU32::new(0) }; NUM_LV2ENTRIES],
            dup_counts: [const { AtomicU32::new(0) }; NUM_LV2ENTRIES],
        }
    }

    pub(crate) fn zero(&self) {
        for word in self.entries.iter().chain(self.dup_counts.iter()) {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Reads the raw hardware entry at `idx`.
    pub(crate) fn raw_entry(&self, idx: usize) -> u32 {
        self.entries[idx].load(Ordering::Relaxed)
    }
}

/// The free-slot count of a table that has nothing mapped.
pub(crate) const ALL_FREE: i32 = NUM_LV2ENTRIES as i32;

/// What happened to a small page entry on removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SmallRemoval {
    /// A duplicate was dropped; the entry still maps the page.
    Duplicate,
    /// The entry was cleared and must be flushed.
    Cleared,
}

/// A mutable view of a level-2 table and its free-slot count.
///
/// The view must only be created while holding the table lock. Methods that
/// change hardware entries return the entry indices to flush.
pub(crate) struct Lv2Table<'a> {
    block: &'a Lv2Block,
    free_slots: &'a mut i32,
}

impl<'a> Lv2Table<'a> {
    pub(crate) fn new(block: &'a Lv2Block, free_slots: &'a mut i32) -> Self {
        Self { block, free_slots }
    }

    pub(crate) fn entry(&self, idx: usize) -> Lv2Entry {
        Lv2Entry::decode(self.block.raw_entry(idx))
    }

    pub(crate) fn dup_count(&self, idx: usize) -> u32 {
        self.block.dup_counts[idx].load(Ordering::Relaxed)
    }

    pub(crate) fn free_slots(&self) -> i32 {
        *self.free_slots
    }

    pub(crate) fn is_empty(&self) -> bool {
        *self.free_slots == ALL_FREE
    }

    /// Installs a small page into the empty slot `idx`.
    pub(crate) fn install_fresh(
        &mut self,
        idx: usize,
        paddr: Paddr,
        shareable: bool,
    ) -> Range<usize> {
        debug_assert!(self.entry(idx).is_fault());
        self.write(idx, Lv2Entry::Small { paddr, shareable });
        *self.free_slots -= 1;
        idx..idx + 1
    }

    /// Records one more mapping of the small page already at `idx`.
    pub(crate) fn install_duplicate(&mut self, idx: usize) {
        self.block.dup_counts[idx].fetch_add(1, Ordering::Relaxed);
        *self.free_slots -= 1;
    }

    /// Installs a large page into the 16 slots starting at `idx`.
    ///
    /// If any of the slots is in use, the slots written so far are cleared
    /// again and the table is left as it was.
    pub(crate) fn install_large(
        &mut self,
        idx: usize,
        paddr: Paddr,
        shareable: bool,
    ) -> Result<Range<usize>> {
        debug_assert_eq!(idx % SPAGES_PER_LPAGE, 0);
        let run = idx..idx + SPAGES_PER_LPAGE;
        let entry = Lv2Entry::Large { paddr, shareable };

        for i in run.clone() {
            if !self.entry(i).is_fault() {
                for written in idx..i {
                    self.write(written, Lv2Entry::Fault);
                }
                return Err(Error::AddressInUse);
            }
            self.write(i, entry);
        }

        *self.free_slots -= SPAGES_PER_LPAGE as i32;
        Ok(run)
    }

    /// Drops one mapping of the small page at `idx`.
    ///
    /// The entry is only cleared once no duplicate is left.
    pub(crate) fn remove_one(&mut self, idx: usize) -> SmallRemoval {
        debug_assert!(matches!(self.entry(idx), Lv2Entry::Small { .. }));
        *self.free_slots += 1;

        let dups = &self.block.dup_counts[idx];
        if dups.load(Ordering::Relaxed) != 0 {
            dups.fetch_sub(1, Ordering::Relaxed);
            return SmallRemoval::Duplicate;
        }

        self.write(idx, Lv2Entry::Fault);
        SmallRemoval::Cleared
    }

    /// Clears the large page that covers `idx`.
    pub(crate) fn remove_large(&mut self, idx: usize) -> Range<usize> {
        let start = idx & !(SPAGES_PER_LPAGE - 1);
        let run = start..start + SPAGES_PER_LPAGE;
        for i in run.clone() {
            self.write(i, Lv2Entry::Fault);
        }
        *self.free_slots += SPAGES_PER_LPAGE as i32;
        run
    }

    fn write(&self, idx: usize, entry: Lv2Entry) {
        self.block.entries[idx].store(entry.encode(), Ordering::Relaxed);
    }
}

/// The byte range of the level-2 entries `entries` of the table at `table`.
pub(crate) fn entry_paddr_range(table: Paddr, entries: Range<usize>) -> Range<Paddr> {
    let word = size_of::<u32>() as Paddr;
    table + entries.start as Paddr * word..table + entries.end as Paddr * word
}

const _: () = assert!(LPAGE_SIZE / crate::SPAGE_SIZE == SPAGES_PER_LPAGE);
