// SPDX-License-Identifier: MPL-2.0

//! The translation tables of one SysMMU.
//!
//! All mutations go through a [`DomainGuard`], which holds the table lock.
//! The fault handler reads the tables through [`Domain::lv1_raw`] and
//! [`Domain::lv2_raw`] without taking that lock: it runs in interrupt
//! context and must not spin on a lock held by a thread it interrupted. The
//! tables are made of atomic words so these reads are well defined, but they
//! may observe a map or unmap that is in progress.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use log::{debug, error, trace, warn};
use spin::{Mutex, MutexGuard};

use crate::{
    flush::CacheFlush,
    lv2_alloc::{Lv2Allocator, TableHandle},
    lv2_table::{entry_paddr_range, Lv2Block, Lv2Table, SmallRemoval, ALL_FREE},
    pgsize::PGSIZE_BITMAP,
    pte::{lv1_index, lv2_index, Lv1Entry, Lv2Entry},
    sysmmu::IommuProt,
    Error, Iova, Paddr, Result, LPAGE_SIZE, LV1TABLE_ALIGN, LV2TABLE_SIZE, NUM_LV1ENTRIES,
    SECT_SIZE, SPAGE_SIZE,
};

/// The outcome of unmapping one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unmapped {
    /// The given number of mapped bytes were removed.
    Freed(usize),
    /// Nothing was mapped in the given number of bytes.
    Skipped(usize),
}

impl Unmapped {
    /// The number of bytes that the cursor advances by.
    pub fn consumed(&self) -> usize {
        match *self {
            Unmapped::Freed(len) | Unmapped::Skipped(len) => len,
        }
    }
}

/// The level-2 tables installed in a domain.
struct Lv2Book {
    tables: BTreeMap<usize, InstalledTable>,
}

struct InstalledTable {
    handle: TableHandle,
    /// The number of free slots. Duplicate mappings push it below zero.
    free: i32,
}

/// The page tables of one SysMMU channel.
pub struct Domain {
    pgtable: Box<[AtomicU32]>,
    pgtable_paddr: Paddr,
    /// The level-2 table behind each level-1 slot, for the unlocked reads of
    /// the fault path. Published before the level-1 entry is written.
    children: Box<[AtomicPtr<Lv2Block>]>,
    pgtablelock: Mutex<Lv2Book>,
    allocator: Arc<Lv2Allocator>,
    flush: Arc<dyn CacheFlush>,
    pgsize_bitmap: usize,
}

impl Domain {
    /// Creates an empty domain whose level-1 table lives at `pgtable_paddr`.
    pub fn new(
        pgtable_paddr: Paddr,
        allocator: Arc<Lv2Allocator>,
        flush: Arc<dyn CacheFlush>,
    ) -> Result<Self> {
        if pgtable_paddr % LV1TABLE_ALIGN != 0 {
            error!(
                "Level-1 table {:#x} is not aligned to {:#x}",
                pgtable_paddr, LV1TABLE_ALIGN
            );
            return Err(Error::InvalidConfig);
        }

        let pgtable: Box<[AtomicU32]> = (0..NUM_LV1ENTRIES).map(|_| AtomicU32::new(0)).collect();
        let children = (0..NUM_LV1ENTRIES)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        let domain = Self {
            pgtable,
            pgtable_paddr,
            children,
            pgtablelock: Mutex::new(Lv2Book {
                tables: BTreeMap::new(),
            }),
            allocator,
            flush,
            pgsize_bitmap: PGSIZE_BITMAP,
        };
        domain.flush_lv1(0..NUM_LV1ENTRIES);
        Ok(domain)
    }

    /// The physical address of the level-1 table.
    pub fn pgtable_paddr(&self) -> Paddr {
        self.pgtable_paddr
    }

    pub fn pgsize_bitmap(&self) -> usize {
        self.pgsize_bitmap
    }

    pub fn allocator(&self) -> &Arc<Lv2Allocator> {
        &self.allocator
    }

    /// Acquires the table lock.
    pub fn lock(&self) -> DomainGuard<'_> {
        DomainGuard {
            domain: self,
            book: self.pgtablelock.lock(),
        }
    }

    /// Reads the raw level-1 entry that translates `iova`.
    ///
    /// This does not take the table lock and may race with a mapping
    /// change. An IOVA beyond the 36-bit space reads as a fault entry.
    pub fn lv1_raw(&self, iova: Iova) -> u32 {
        self.pgtable
            .get(lv1_index(iova))
            .map_or(0, |entry| entry.load(Ordering::Acquire))
    }

    /// Reads the raw level-2 entry that translates `iova`, if a level-2
    /// table is installed for it.
    ///
    /// This does not take the table lock and may race with a mapping
    /// change.
    pub fn lv2_raw(&self, iova: Iova) -> Option<u32> {
        let block = self.children.get(lv1_index(iova))?.load(Ordering::Acquire);
        let block = NonNull::new(block)?;
        // SAFETY: Level-2 blocks stay allocated as long as the allocator,
        // which `self` keeps alive. The block may have been recycled, but
        // reading its atomics is still sound.
        let block = unsafe { block.as_ref() };
        Some(block.raw_entry(lv2_index(iova)))
    }

    /// Translates `iova` into a physical address.
    pub fn iova_to_phys(&self, iova: Iova) -> Option<Paddr> {
        let _guard = self.pgtablelock.lock();
        match Lv1Entry::decode(self.lv1_raw(iova)) {
            Lv1Entry::Fault => None,
            Lv1Entry::Section { paddr, .. } => Some(paddr + (iova & (SECT_SIZE as u64 - 1))),
            Lv1Entry::Page { .. } => match Lv2Entry::decode(self.lv2_raw(iova)?) {
                Lv2Entry::Fault => None,
                Lv2Entry::Large { paddr, .. } => Some(paddr + (iova & (LPAGE_SIZE as u64 - 1))),
                Lv2Entry::Small { paddr, .. } => Some(paddr + (iova & (SPAGE_SIZE as u64 - 1))),
            },
        }
    }

    /// Returns the free-slot count of the level-2 table that covers `iova`.
    pub fn free_slots(&self, iova: Iova) -> Option<i32> {
        let book = self.pgtablelock.lock();
        book.tables.get(&lv1_index(iova)).map(|table| table.free)
    }

    /// Returns the number of installed level-2 tables.
    pub fn num_lv2_tables(&self) -> usize {
        self.pgtablelock.lock().tables.len()
    }

    /// Returns every level-2 table to the allocator and clears the level-1
    /// entries that pointed to them.
    ///
    /// Mappings inside those tables are dropped; sections stay.
    pub fn release_all_tables(&self) -> usize {
        let mut book = self.pgtablelock.lock();
        let tables = core::mem::take(&mut book.tables);
        let released = tables.len();
        for (idx, table) in tables {
            self.write_lv1(idx, Lv1Entry::Fault);
            self.flush_lv1(idx..idx + 1);
            self.children[idx].store(ptr::null_mut(), Ordering::Release);
            drop(table.handle);
        }
        if released != 0 {
            debug!("Released {} level-2 tables", released);
        }
        released
    }

    fn lv1(&self, idx: usize) -> Lv1Entry {
        Lv1Entry::decode(self.pgtable[idx].load(Ordering::Relaxed))
    }

    fn write_lv1(&self, idx: usize, entry: Lv1Entry) {
        self.pgtable[idx].store(entry.encode(), Ordering::Release);
    }

    fn flush_lv1(&self, entries: core::ops::Range<usize>) {
        self.flush
            .flush_range(entry_paddr_range(self.pgtable_paddr, entries));
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.release_all_tables();
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("pgtable_paddr", &self.pgtable_paddr)
            .field("pgsize_bitmap", &self.pgsize_bitmap)
            .finish_non_exhaustive()
    }
}

/// The table lock of a [`Domain`], with the chunk operations it protects.
pub struct DomainGuard<'a> {
    domain: &'a Domain,
    book: MutexGuard<'a, Lv2Book>,
}

impl DomainGuard<'_> {
    /// Maps one page of `size` bytes.
    ///
    /// `size` is a page size of the domain, and `iova` and `paddr` are
    /// aligned to it. On failure no entry of the page is left behind.
    pub fn map_chunk(
        &mut self,
        iova: Iova,
        paddr: Paddr,
        size: usize,
        prot: IommuProt,
    ) -> Result<()> {
        let shareable = prot.contains(IommuProt::CACHE);
        let result = match size {
            SECT_SIZE => self.set_section(iova, paddr, shareable),
            SPAGE_SIZE | LPAGE_SIZE => self.set_page(iova, paddr, size, shareable),
            _ => {
                error!("Unsupported page size {:#x}", size);
                Err(Error::InvalidAddress)
            }
        };

        if let Err(err) = result {
            error!("Failed({:?}) to map {:#x} bytes @ {:#x}", err, size, iova);
        }
        result
    }

    /// Unmaps the page that translates `iova`, which may take at most `size`
    /// bytes.
    ///
    /// A level-2 table is returned to the allocator once its last mapping is
    /// gone.
    pub fn unmap_chunk(&mut self, iova: Iova, size: usize) -> Result<Unmapped> {
        let idx = lv1_index(iova);
        match self.domain.lv1(idx) {
            Lv1Entry::Section { .. } => {
                if size < SECT_SIZE {
                    return Err(size_mismatch(iova, size, SECT_SIZE));
                }
                self.domain.write_lv1(idx, Lv1Entry::Fault);
                self.domain.flush_lv1(idx..idx + 1);
                Ok(Unmapped::Freed(SECT_SIZE))
            }
            Lv1Entry::Fault => Ok(Unmapped::Skipped(size.min(SECT_SIZE))),
            Lv1Entry::Page { .. } => self.unmap_page(iova, size),
        }
    }

    fn set_section(&mut self, iova: Iova, paddr: Paddr, shareable: bool) -> Result<()> {
        let idx = lv1_index(iova);
        match self.domain.lv1(idx) {
            Lv1Entry::Fault => {}
            Lv1Entry::Section { .. } => {
                warn!("Trying mapping on 1MiB@{:#x} that is mapped", iova);
                return Err(Error::AddressInUse);
            }
            Lv1Entry::Page { .. } => {
                // An empty level-2 table is not reclaimed to make room.
                let free = self.book.tables.get(&idx).map(|table| table.free);
                warn!(
                    "Trying mapping on 1MiB@{:#x} that has a level-2 table ({:?} free)",
                    iova, free
                );
                return Err(Error::AddressInUse);
            }
        }

        self.domain
            .write_lv1(idx, Lv1Entry::Section { paddr, shareable });
        self.domain.flush_lv1(idx..idx + 1);
        trace!("Mapped section {:#x} -> {:#x}", iova, paddr);
        Ok(())
    }

    fn set_page(&mut self, iova: Iova, paddr: Paddr, size: usize, shareable: bool) -> Result<()> {
        let idx = self.ensure_lv2_table(iova)?;
        let domain = self.domain;
        let installed = self.installed(idx)?;
        let table_paddr = installed.handle.paddr();
        let mut table = Lv2Table::new(installed.handle.block(), &mut installed.free);
        let l2 = lv2_index(iova);

        if size == LPAGE_SIZE {
            let run = table.install_large(l2, paddr, shareable).inspect_err(|_| {
                warn!("Trying mapping a 64KiB page on {:#x} that is mapped", iova);
            })?;
            domain.flush.flush_range(entry_paddr_range(table_paddr, run));
            trace!("Mapped large page {:#x} -> {:#x}", iova, paddr);
            return Ok(());
        }

        match table.entry(l2) {
            Lv2Entry::Fault => {
                let run = table.install_fresh(l2, paddr, shareable);
                domain.flush.flush_range(entry_paddr_range(table_paddr, run));
                trace!("Mapped small page {:#x} -> {:#x}", iova, paddr);
            }
            Lv2Entry::Small { paddr: mapped, .. } => {
                if mapped != paddr {
                    warn!(
                        "Duplicated map of {:#x} to {:#x}, already mapped to {:#x}",
                        iova, paddr, mapped
                    );
                }
                table.install_duplicate(l2);
                debug!(
                    "Duplicated map of {:#x}, {} mappings",
                    iova,
                    table.dup_count(l2) + 1
                );
            }
            Lv2Entry::Large { .. } => {
                warn!("Trying mapping a 4KiB page on {:#x} mapped with 64KiB page", iova);
                return Err(Error::AddressInUse);
            }
        }
        Ok(())
    }

    /// Makes sure that a level-2 table is installed for `iova` and returns
    /// its level-1 index.
    fn ensure_lv2_table(&mut self, iova: Iova) -> Result<usize> {
        let idx = lv1_index(iova);
        match self.domain.lv1(idx) {
            Lv1Entry::Page { .. } => return Ok(idx),
            Lv1Entry::Section { .. } => {
                warn!("Trying mapping on {:#x} mapped with 1MiB page", iova);
                return Err(Error::AddressInUse);
            }
            Lv1Entry::Fault => {}
        }

        let handle = self.domain.allocator.alloc()?;
        let table = handle.paddr();

        // The walker must see the empty table before the entry pointing to it.
        self.domain
            .flush
            .flush_range(table..table + LV2TABLE_SIZE as Paddr);
        self.domain.children[idx].store(handle.block_ptr(), Ordering::Release);
        self.domain.write_lv1(idx, Lv1Entry::Page { table });
        self.domain.flush_lv1(idx..idx + 1);

        self.book.tables.insert(
            idx,
            InstalledTable {
                handle,
                free: ALL_FREE,
            },
        );
        debug!("Installed level-2 table {:#x} for 1MiB@{:#x}", table, iova);
        Ok(idx)
    }

    fn unmap_page(&mut self, iova: Iova, size: usize) -> Result<Unmapped> {
        let idx = lv1_index(iova);
        let domain = self.domain;
        let installed = self.installed(idx)?;
        let table_paddr = installed.handle.paddr();
        let mut table = Lv2Table::new(installed.handle.block(), &mut installed.free);
        let l2 = lv2_index(iova);

        let unmapped = match table.entry(l2) {
            Lv2Entry::Fault => return Ok(Unmapped::Skipped(SPAGE_SIZE)),
            Lv2Entry::Small { .. } => {
                if table.remove_one(l2) == SmallRemoval::Cleared {
                    domain
                        .flush
                        .flush_range(entry_paddr_range(table_paddr, l2..l2 + 1));
                }
                SPAGE_SIZE
            }
            Lv2Entry::Large { .. } => {
                if size < LPAGE_SIZE {
                    return Err(size_mismatch(iova, size, LPAGE_SIZE));
                }
                let run = table.remove_large(l2);
                domain.flush.flush_range(entry_paddr_range(table_paddr, run));
                LPAGE_SIZE
            }
        };

        if table.is_empty() {
            self.reclaim(idx);
        }
        Ok(Unmapped::Freed(unmapped))
    }

    fn reclaim(&mut self, idx: usize) {
        self.domain.write_lv1(idx, Lv1Entry::Fault);
        self.domain.flush_lv1(idx..idx + 1);
        self.domain.children[idx].store(ptr::null_mut(), Ordering::Release);
        if let Some(table) = self.book.tables.remove(&idx) {
            debug!(
                "Reclaimed level-2 table {:#x} of 1MiB@{:#x}",
                table.handle.paddr(),
                (idx as u64) << crate::SECT_ORDER
            );
        }
    }

    fn installed(&mut self, idx: usize) -> Result<&mut InstalledTable> {
        self.book.tables.get_mut(&idx).ok_or_else(|| {
            error!("Level-1 entry {} has no level-2 table", idx);
            Error::InvalidAddress
        })
    }
}

fn size_mismatch(iova: Iova, size: usize, pgsize: usize) -> Error {
    error!(
        "Failed: size({:#x})@{:#x} is smaller than page size {:#x}",
        size, iova, pgsize
    );
    Error::SizeMismatch
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        lv2_alloc::{Lv2AllocConfig, Tier, TierConfig},
        test_util::RecordingFlush,
    };

    const PGTABLE: Paddr = 0x9c00_0000;
    const RW: IommuProt = IommuProt::READ.union(IommuProt::WRITE);

    fn new_domain() -> (Domain, Arc<RecordingFlush>) {
        let flush = Arc::new(RecordingFlush::default());
        let allocator = Lv2Allocator::new(Lv2AllocConfig::default()).unwrap();
        let domain = Domain::new(PGTABLE, allocator, flush.clone()).unwrap();
        flush.take();
        (domain, flush)
    }

    #[test]
    fn small_page_installs_a_table() {
        let (domain, flush) = new_domain();
        domain
            .lock()
            .map_chunk(0x1000_0000, 0x8000_0000, SPAGE_SIZE, RW)
            .unwrap();

        let table = match Lv1Entry::decode(domain.lv1_raw(0x1000_0000)) {
            Lv1Entry::Page { table } => table,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(domain.iova_to_phys(0x1000_0123), Some(0x8000_0123));
        assert_eq!(domain.free_slots(0x1000_0000), Some(ALL_FREE - 1));

        let lv1_entry = PGTABLE + 0x100 * 4;
        assert_eq!(
            flush.take(),
            alloc::vec![
                table..table + LV2TABLE_SIZE as Paddr,
                lv1_entry..lv1_entry + 4,
                table..table + 4,
            ]
        );
    }

    #[test]
    fn shareable_bit_follows_cache_prot() {
        let (domain, _) = new_domain();
        let mut guard = domain.lock();
        guard
            .map_chunk(0x1000_0000, 0x8000_0000, SPAGE_SIZE, IommuProt::CACHE)
            .unwrap();
        guard
            .map_chunk(0x2000_0000, 0x8010_0000, SECT_SIZE, RW)
            .unwrap();
        drop(guard);

        assert!(matches!(
            Lv2Entry::decode(domain.lv2_raw(0x1000_0000).unwrap()),
            Lv2Entry::Small { shareable: true, .. }
        ));
        assert!(matches!(
            Lv1Entry::decode(domain.lv1_raw(0x2000_0000)),
            Lv1Entry::Section { shareable: false, .. }
        ));
    }

    #[test]
    fn section_conflicts() {
        let (domain, _) = new_domain();
        let mut guard = domain.lock();
        guard
            .map_chunk(0x2000_0000, 0x8000_0000, SECT_SIZE, RW)
            .unwrap();
        assert_eq!(
            guard.map_chunk(0x2000_0000, 0x8010_0000, SECT_SIZE, RW),
            Err(Error::AddressInUse)
        );
        assert_eq!(
            guard.map_chunk(0x2001_0000, 0x8010_0000, SPAGE_SIZE, RW),
            Err(Error::AddressInUse)
        );

        guard
            .map_chunk(0x3000_0000, 0x8000_0000, SPAGE_SIZE, RW)
            .unwrap();
        assert_eq!(
            guard.map_chunk(0x3000_0000, 0x8000_0000, SECT_SIZE, RW),
            Err(Error::AddressInUse)
        );
    }

    #[test]
    fn unmap_section() {
        let (domain, _) = new_domain();
        let mut guard = domain.lock();
        guard
            .map_chunk(0x2000_0000, 0x8000_0000, SECT_SIZE, RW)
            .unwrap();
        assert_eq!(
            guard.unmap_chunk(0x2000_0000, SPAGE_SIZE),
            Err(Error::SizeMismatch)
        );
        assert_eq!(
            guard.unmap_chunk(0x2000_0000, SECT_SIZE),
            Ok(Unmapped::Freed(SECT_SIZE))
        );
        assert_eq!(
            guard.unmap_chunk(0x2000_0000, 4 * SECT_SIZE),
            Ok(Unmapped::Skipped(SECT_SIZE))
        );
        assert_eq!(
            guard.unmap_chunk(0x2000_0000, SPAGE_SIZE),
            Ok(Unmapped::Skipped(SPAGE_SIZE))
        );
    }

    #[test]
    fn duplicates_and_reclamation() {
        let (domain, _) = new_domain();
        let iova = 0x1000_0000;
        let mut guard = domain.lock();
        guard.map_chunk(iova, 0x8000_0000, SPAGE_SIZE, RW).unwrap();
        guard.map_chunk(iova, 0x8000_0000, SPAGE_SIZE, RW).unwrap();
        drop(guard);
        assert_eq!(domain.free_slots(iova), Some(ALL_FREE - 2));

        let mut guard = domain.lock();
        assert_eq!(
            guard.unmap_chunk(iova, SPAGE_SIZE),
            Ok(Unmapped::Freed(SPAGE_SIZE))
        );
        drop(guard);
        assert_eq!(domain.iova_to_phys(iova), Some(0x8000_0000));
        assert_eq!(domain.num_lv2_tables(), 1);

        let mut guard = domain.lock();
        assert_eq!(
            guard.unmap_chunk(iova, SPAGE_SIZE),
            Ok(Unmapped::Freed(SPAGE_SIZE))
        );
        drop(guard);
        assert_eq!(domain.lv1_raw(iova), 0);
        assert_eq!(domain.lv2_raw(iova), None);
        assert_eq!(domain.free_slots(iova), None);
        assert_eq!(domain.allocator().stats().total(), 0);
    }

    #[test]
    fn large_pages() {
        let (domain, flush) = new_domain();
        let mut guard = domain.lock();
        guard
            .map_chunk(0x1001_0000, 0x8001_0000, LPAGE_SIZE, RW)
            .unwrap();
        assert_eq!(
            guard.map_chunk(0x1001_f000, 0x8000_0000, SPAGE_SIZE, RW),
            Err(Error::AddressInUse)
        );
        assert_eq!(
            guard.unmap_chunk(0x1001_0000, SPAGE_SIZE),
            Err(Error::SizeMismatch)
        );
        drop(guard);
        assert_eq!(domain.iova_to_phys(0x1001_abcd), Some(0x8001_abcd));

        flush.take();
        let mut guard = domain.lock();
        assert_eq!(
            guard.unmap_chunk(0x1001_0000, LPAGE_SIZE),
            Ok(Unmapped::Freed(LPAGE_SIZE))
        );
        drop(guard);
        assert_eq!(domain.allocator().stats().total(), 0);

        // The run is flushed once, then the level-1 entry.
        let flushed = flush.take();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].end - flushed[0].start, 16 * 4);
        assert_eq!(flushed[1], PGTABLE + 0x100 * 4..PGTABLE + 0x100 * 4 + 4);
    }

    #[test]
    fn out_of_tables() {
        let flush = Arc::new(RecordingFlush::default());
        let allocator = Lv2Allocator::new(Lv2AllocConfig {
            pool: TierConfig {
                base: 0x9000_0000,
                capacity: 1,
            },
            cache: TierConfig {
                base: 0x9100_0000,
                capacity: 0,
            },
            overflow: TierConfig {
                base: 0x9200_0000,
                capacity: 0,
            },
        })
        .unwrap();
        let domain = Domain::new(PGTABLE, allocator.clone(), flush).unwrap();
        let mut guard = domain.lock();
        guard
            .map_chunk(0x1000_0000, 0x8000_0000, SPAGE_SIZE, RW)
            .unwrap();
        assert_eq!(
            guard.map_chunk(0x1010_0000, 0x8000_0000, SPAGE_SIZE, RW),
            Err(Error::OutOfMemory)
        );
        drop(guard);
        assert_eq!(domain.lv1_raw(0x1010_0000), 0);
        assert_eq!(allocator.stats().of(Tier::Pool), 1);
    }

    #[test]
    fn release_all() {
        let (domain, _) = new_domain();
        let mut guard = domain.lock();
        for i in 0..3u64 {
            guard
                .map_chunk(0x1000_0000 + i * SECT_SIZE as u64, 0x8000_0000, SPAGE_SIZE, RW)
                .unwrap();
        }
        guard
            .map_chunk(0x2000_0000, 0x8000_0000, SECT_SIZE, RW)
            .unwrap();
        drop(guard);

        let allocator = domain.allocator().clone();
        assert_eq!(allocator.stats().total(), 3);
        assert_eq!(domain.release_all_tables(), 3);
        assert_eq!(allocator.stats().total(), 0);
        assert_eq!(domain.iova_to_phys(0x1000_0000), None);
        assert_eq!(domain.iova_to_phys(0x2000_0000), Some(0x8000_0000));

        domain
            .lock()
            .map_chunk(0x1000_0000, 0x8000_0000, SPAGE_SIZE, RW)
            .unwrap();
        drop(domain);
        assert_eq!(allocator.stats().total(), 0);
    }

    #[test]
    fn reads_beyond_the_iova_space() {
        let (domain, _) = new_domain();
        domain
            .lock()
            .map_chunk(0xf_fff0_0000, 0x8000_0000, SPAGE_SIZE, RW)
            .unwrap();
        assert_ne!(domain.lv1_raw(0xf_fff0_0000), 0);
        assert_eq!(domain.lv1_raw(1 << 36), 0);
        assert_eq!(domain.lv2_raw(1 << 40), None);
        assert_eq!(domain.iova_to_phys(1 << 40), None);
    }

    #[test]
    fn unaligned_level1_table() {
        let allocator = Lv2Allocator::new(Lv2AllocConfig::default()).unwrap();
        let flush = Arc::new(RecordingFlush::default());
        assert_eq!(
            Domain::new(PGTABLE + 0x1000, allocator, flush).unwrap_err(),
            Error::InvalidConfig
        );
    }
}
