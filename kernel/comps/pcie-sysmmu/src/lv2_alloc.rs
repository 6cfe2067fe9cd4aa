// SPDX-License-Identifier: MPL-2.0

//! The allocator of level-2 tables.
//!
//! Level-2 tables come from three tiers, tried in order:
//!
//! 1. [`Tier::Pool`], a reserved region whose tables are set up once when
//!    the allocator is created;
//! 2. [`Tier::Cache`], whose tables are taken from the heap the first time
//!    they are needed, and may therefore fail;
//! 3. [`Tier::Overflow`], a small reserved side array of last-resort tables.
//!
//! Every tier owns a fixed window of physical addresses, so that the address
//! of a table never changes once it is handed out. A [`TableHandle`]
//! remembers its tier and returns the table there when dropped.
//!
//! The memory of a table is kept by its tier until the allocator itself is
//! dropped. The fault path reads level-2 tables without the table lock and
//! may therefore touch a table that was just freed, which must stay valid.

use alloc::{alloc::Layout, sync::Arc, vec::Vec};
use core::{fmt, ptr::NonNull};

use id_alloc::IdAlloc;
use log::{debug, error, warn};
use spin::Mutex;

use crate::{lv2_table::Lv2Block, Error, Paddr, Result, ADDRESS_WIDTH, LV2TABLE_REFCNT_SZ};

/// The default number of tables in the overflow tier.
pub const MAX_EXT_BUFF_NUM: usize = 64;

const DEFAULT_POOL_TABLES: usize = 128;
const DEFAULT_CACHE_TABLES: usize = 4096;

/// The origin of a level-2 table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Pool,
    Cache,
    Overflow,
}

impl Tier {
    const ALL: [Tier; 3] = [Tier::Pool, Tier::Cache, Tier::Overflow];
}

/// The physical window of one tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierConfig {
    /// The physical address of the first table.
    pub base: Paddr,
    /// The number of tables. Zero disables the tier.
    pub capacity: usize,
}

impl TierConfig {
    fn end(&self) -> Option<Paddr> {
        let len = (self.capacity as u64).checked_mul(LV2TABLE_REFCNT_SZ as u64)?;
        self.base.checked_add(len)
    }
}

/// The layout of the three tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lv2AllocConfig {
    pub pool: TierConfig,
    pub cache: TierConfig,
    pub overflow: TierConfig,
}

impl Default for Lv2AllocConfig {
    fn default() -> Self {
        Self {
            pool: TierConfig {
                base: 0x9800_0000,
                capacity: DEFAULT_POOL_TABLES,
            },
            cache: TierConfig {
                base: 0x9810_0000,
                capacity: DEFAULT_CACHE_TABLES,
            },
            overflow: TierConfig {
                base: 0x9900_0000,
                capacity: MAX_EXT_BUFF_NUM,
            },
        }
    }
}

impl Lv2AllocConfig {
    fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Pool => &self.pool,
            Tier::Cache => &self.cache,
            Tier::Overflow => &self.overflow,
        }
    }

    fn validate(&self) -> Result<()> {
        let limit: Paddr = 1 << ADDRESS_WIDTH;
        let mut windows = Vec::with_capacity(Tier::ALL.len());

        for tier in Tier::ALL {
            let config = self.tier(tier);
            if config.capacity == 0 {
                continue;
            }
            if config.base % LV2TABLE_REFCNT_SZ as Paddr != 0 {
                error!("{:?} tier base {:#x} is not aligned", tier, config.base);
                return Err(Error::InvalidConfig);
            }
            match config.end() {
                Some(end) if end <= limit => windows.push((config.base, end)),
                _ => {
                    error!("{:?} tier exceeds the physical address space", tier);
                    return Err(Error::InvalidConfig);
                }
            }
        }

        windows.sort_unstable();
        if windows.windows(2).any(|pair| pair[0].1 > pair[1].0) {
            error!("Level-2 table tiers overlap");
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

/// The numbers of level-2 tables in use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Lv2AllocStats {
    pub pool: usize,
    pub cache: usize,
    pub overflow: usize,
}

impl Lv2AllocStats {
    pub fn total(&self) -> usize {
        self.pool + self.cache + self.overflow
    }

    pub fn of(&self, tier: Tier) -> usize {
        match tier {
            Tier::Pool => self.pool,
            Tier::Cache => self.cache,
            Tier::Overflow => self.overflow,
        }
    }
}

/// The allocator of level-2 tables, shared by all SysMMU channels.
pub struct Lv2Allocator {
    pool: Arena,
    cache: Arena,
    overflow: Arena,
}

impl Lv2Allocator {
    /// Creates an allocator and reserves the pool and overflow tables.
    pub fn new(config: Lv2AllocConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let allocator = Self {
            pool: Arena::new(Tier::Pool, config.pool, true)?,
            cache: Arena::new(Tier::Cache, config.cache, false)?,
            overflow: Arena::new(Tier::Overflow, config.overflow, true)?,
        };
        Ok(Arc::new(allocator))
    }

    /// Allocates a zeroed level-2 table from the first tier that has one.
    pub fn alloc(self: &Arc<Self>) -> Result<TableHandle> {
        for tier in Tier::ALL {
            if let Some((index, block)) = self.arena(tier).alloc() {
                let paddr = self.arena(tier).paddr_of(index);
                debug!("Allocated level-2 table {:#x} from {:?}", paddr, tier);
                return Ok(TableHandle {
                    tier,
                    index,
                    paddr,
                    block,
                    owner: self.clone(),
                });
            }
            match tier {
                Tier::Pool => debug!("Level-2 table pool is full, try the cache"),
                Tier::Cache => warn!("Level-2 table cache is exhausted, use an overflow buffer"),
                Tier::Overflow => {}
            }
        }

        error!("Overflow buffers for level-2 tables are full");
        Err(Error::OutOfMemory)
    }

    /// Returns a table to its tier.
    pub fn free(&self, handle: TableHandle) {
        debug_assert!(core::ptr::eq(self, Arc::as_ptr(&handle.owner)));
        drop(handle);
    }

    pub fn stats(&self) -> Lv2AllocStats {
        Lv2AllocStats {
            pool: self.pool.in_use(),
            cache: self.cache.in_use(),
            overflow: self.overflow.in_use(),
        }
    }

    fn arena(&self, tier: Tier) -> &Arena {
        match tier {
            Tier::Pool => &self.pool,
            Tier::Cache => &self.cache,
            Tier::Overflow => &self.overflow,
        }
    }
}

impl fmt::Debug for Lv2Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lv2Allocator")
            .field("stats", &self.stats())
            .finish()
    }
}

/// A level-2 table leased from a [`Lv2Allocator`].
///
/// Dropping the handle returns the table to the tier it came from.
pub struct TableHandle {
    tier: Tier,
    index: usize,
    paddr: Paddr,
    block: NonNull<Lv2Block>,
    owner: Arc<Lv2Allocator>,
}

// SAFETY: The handle has exclusive use of its block until it is dropped, and
// the block only consists of atomics.
unsafe impl Send for TableHandle {}
// SAFETY: Shared access to the block goes through atomics.
unsafe impl Sync for TableHandle {}

impl TableHandle {
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// The physical address of the table.
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    pub(crate) fn block(&self) -> &Lv2Block {
        // SAFETY: The block is owned by the arena of `owner`, which outlives
        // `self`.
        unsafe { self.block.as_ref() }
    }

    pub(crate) fn block_ptr(&self) -> *mut Lv2Block {
        self.block.as_ptr()
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        debug!("Freed level-2 table {:#x} to {:?}", self.paddr, self.tier);
        self.owner.arena(self.tier).free(self.index);
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandle")
            .field("tier", &self.tier)
            .field("paddr", &self.paddr)
            .finish()
    }
}

/// The tables of one tier.
struct Arena {
    tier: Tier,
    base: Paddr,
    capacity: usize,
    inner: Mutex<ArenaInner>,
}

struct ArenaInner {
    ids: IdAlloc,
    /// The memory of table `i`, once it has been allocated.
    blocks: Vec<NonNull<Lv2Block>>,
    in_use: usize,
}

// SAFETY: The blocks are owned by the arena and only consist of atomics.
unsafe impl Send for ArenaInner {}

impl Arena {
    fn new(tier: Tier, config: TierConfig, reserve: bool) -> Result<Self> {
        let mut inner = ArenaInner {
            ids: IdAlloc::with_capacity(config.capacity),
            blocks: Vec::with_capacity(if reserve { config.capacity } else { 0 }),
            in_use: 0,
        };
        if reserve {
            for _ in 0..config.capacity {
                let Some(block) = alloc_block() else {
                    error!("Failed to reserve {:?} level-2 tables", tier);
                    return Err(Error::OutOfMemory);
                };
                inner.blocks.push(block);
            }
        }

        Ok(Self {
            tier,
            base: config.base,
            capacity: config.capacity,
            inner: Mutex::new(inner),
        })
    }

    fn alloc(&self) -> Option<(usize, NonNull<Lv2Block>)> {
        let mut inner = self.inner.lock();
        let index = inner.ids.alloc()?;

        let block = match inner.blocks.get(index) {
            Some(&block) => block,
            None => {
                // Only the cache grows; its ids are handed out lowest first.
                debug_assert_eq!(index, inner.blocks.len());
                let Some(block) = alloc_block() else {
                    inner.ids.free(index);
                    return None;
                };
                inner.blocks.push(block);
                block
            }
        };
        inner.in_use += 1;
        drop(inner);

        // SAFETY: The block is valid and was just leased exclusively.
        unsafe { block.as_ref() }.zero();
        Some((index, block))
    }

    fn free(&self, index: usize) {
        let mut inner = self.inner.lock();
        if !inner.ids.is_allocated(index) {
            error!("{:?} level-2 table {} is freed twice", self.tier, index);
            return;
        }
        inner.ids.free(index);
        inner.in_use -= 1;
    }

    fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    fn paddr_of(&self, index: usize) -> Paddr {
        debug_assert!(index < self.capacity);
        self.base + (index * LV2TABLE_REFCNT_SZ) as Paddr
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for block in inner.blocks.drain(..) {
            // SAFETY: The block was allocated by `alloc_block` and no handle
            // is left, since every handle keeps the allocator alive.
            unsafe { alloc::alloc::dealloc(block.as_ptr().cast(), Layout::new::<Lv2Block>()) };
        }
    }
}

fn alloc_block() -> Option<NonNull<Lv2Block>> {
    // SAFETY: The layout has a non-zero size. All-zero bytes are a valid
    // `Lv2Block`, as it only consists of atomic integers.
    let ptr = unsafe { alloc::alloc::alloc_zeroed(Layout::new::<Lv2Block>()) };
    NonNull::new(ptr.cast())
}

#[cfg(test)]
mod test {
    use alloc::vec;

    use super::*;

    fn tiny(pool: usize, cache: usize, overflow: usize) -> Arc<Lv2Allocator> {
        Lv2Allocator::new(Lv2AllocConfig {
            pool: TierConfig {
                base: 0x9000_0000,
                capacity: pool,
            },
            cache: TierConfig {
                base: 0x9100_0000,
                capacity: cache,
            },
            overflow: TierConfig {
                base: 0x9200_0000,
                capacity: overflow,
            },
        })
        .unwrap()
    }

    #[test]
    fn tiers_are_tried_in_order() {
        let allocator = tiny(2, 1, 1);
        let handles: Vec<_> = (0..4).map(|_| allocator.alloc().unwrap()).collect();
        let tiers: Vec<_> = handles.iter().map(TableHandle::tier).collect();
        assert_eq!(tiers, vec![Tier::Pool, Tier::Pool, Tier::Cache, Tier::Overflow]);

        assert_eq!(handles[0].paddr(), 0x9000_0000);
        assert_eq!(handles[1].paddr(), 0x9000_0800);
        assert_eq!(handles[2].paddr(), 0x9100_0000);
        assert_eq!(handles[3].paddr(), 0x9200_0000);

        assert_eq!(allocator.alloc().unwrap_err(), Error::OutOfMemory);
        assert_eq!(allocator.stats().total(), 4);
    }

    #[test]
    fn free_returns_to_the_right_tier() {
        let allocator = tiny(1, 1, 1);
        let pool = allocator.alloc().unwrap();
        let cache = allocator.alloc().unwrap();
        let overflow = allocator.alloc().unwrap();

        allocator.free(overflow);
        assert_eq!(
            allocator.stats(),
            Lv2AllocStats {
                pool: 1,
                cache: 1,
                overflow: 0
            }
        );
        assert_eq!(allocator.alloc().map(|h| h.tier()), Ok(Tier::Overflow));

        drop(cache);
        let again = allocator.alloc().unwrap();
        assert_eq!(again.tier(), Tier::Cache);
        assert_eq!(again.paddr(), 0x9100_0000);

        drop(pool);
        assert_eq!(allocator.stats().pool, 0);
    }

    #[test]
    fn tables_are_zeroed_on_reuse() {
        let allocator = tiny(1, 0, 0);
        let handle = allocator.alloc().unwrap();
        let mut free = crate::lv2_table::ALL_FREE;
        crate::lv2_table::Lv2Table::new(handle.block(), &mut free)
            .install_fresh(9, 0x8000_0000, true);
        assert_ne!(handle.block().raw_entry(9), 0);
        drop(handle);

        let handle = allocator.alloc().unwrap();
        assert_eq!(handle.block().raw_entry(9), 0);
    }

    #[test]
    fn empty_tiers_are_skipped() {
        let allocator = tiny(0, 0, 1);
        assert_eq!(allocator.alloc().map(|h| h.tier()), Ok(Tier::Overflow));
    }

    #[test]
    fn invalid_layouts() {
        let mut config = Lv2AllocConfig::default();
        config.cache.base = config.pool.base + 0x800;
        assert_eq!(Lv2Allocator::new(config).unwrap_err(), Error::InvalidConfig);

        let mut config = Lv2AllocConfig::default();
        config.pool.base += 0x400;
        assert_eq!(Lv2Allocator::new(config).unwrap_err(), Error::InvalidConfig);

        let mut config = Lv2AllocConfig::default();
        config.overflow.base = (1 << ADDRESS_WIDTH) - 0x800;
        config.overflow.capacity = 2;
        assert_eq!(Lv2Allocator::new(config).unwrap_err(), Error::InvalidConfig);

        assert!(Lv2Allocator::new(Lv2AllocConfig::default()).is_ok());
    }
}
