// SPDX-License-Identifier: MPL-2.0

//! The page-table manager of the Exynos PCIe System MMU (SysMMU).
//!
//! The SysMMU translates the I/O virtual addresses (IOVAs) issued by a PCIe
//! root complex into physical addresses by walking a two-level table:
//!
//! - the level-1 table has one 32-bit entry per 1 MiB of the 36-bit IOVA
//!   space, which is either empty, a 1 MiB section, or a pointer to a
//!   level-2 table;
//! - a level-2 table has one 32-bit entry per 4 KiB of the 1 MiB window,
//!   which is either empty, a 4 KiB small page, or one of the 16 copies of a
//!   64 KiB large page.
//!
//! [`PcieSysmmu`] is the driver of one channel. It owns a [`Domain`], which
//! holds the tables, and programs the SysMMU registers through a
//! [`SysmmuIo`] implementation. Level-2 tables come from a [`Lv2Allocator`]
//! that is shared by all channels.
//!
//! ```ignore
//! let allocator = Lv2Allocator::new(Lv2AllocConfig::default())?;
//! let regions = Arc::new(DramRegions::from_memblocks(&[(0x8000_0000, 0x8000_0000)])?);
//! let sysmmu = PcieSysmmu::new(config, SysmmuDeps {
//!     regs,
//!     flush: Arc::new(CoherentFlush),
//!     allocator,
//!     regions,
//!     pgtable_paddr,
//! })?;
//! sysmmu.enable();
//! sysmmu.map(0x1000_0000, 0x8000_0000, 0x1000, IommuProt::READ | IommuProt::WRITE)?;
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod config;
mod domain;
mod error;
mod fault;
mod flush;
#[cfg(feature = "history_log")]
mod history;
mod lv2_alloc;
mod lv2_table;
mod manager;
mod pgsize;
pub mod pte;
mod region;
pub mod regs;
mod sysmmu;
#[cfg(test)]
mod test_util;
mod tlb;

pub use config::{PinnedRegion, SysmmuConfig, MAX_QOS_VALUE};
pub use domain::{Domain, DomainGuard, Unmapped};
pub use error::{Error, Result};
pub use fault::{diagnose, FaultEvent, FaultKind, FaultVerdict, IrqOutcome};
pub use flush::{CacheFlush, CoherentFlush};
#[cfg(feature = "history_log")]
pub use history::{HistoryLog, HistoryRecord, MAX_HISTORY_BUFF};
pub use lv2_alloc::{
    Lv2AllocConfig, Lv2AllocStats, Lv2Allocator, TableHandle, Tier, TierConfig,
    MAX_EXT_BUFF_NUM,
};
pub use manager::SysmmuManager;
pub use pgsize::{choose_pagesize, PGSIZE_BITMAP};
pub use region::{DramRegion, DramRegions, NUM_DRAM_REGION};
pub use regs::{MmioRegs, SysmmuIo};
pub use sysmmu::{IommuProt, PcieSysmmu, SysmmuDeps, SysmmuStats, MAX_RC_NUM};
pub use tlb::TlbDump;

/// A physical address.
pub type Paddr = u64;

/// An I/O virtual address, as issued by the PCIe device.
pub type Iova = u64;

/// The width of both the physical and the I/O virtual address spaces.
pub const ADDRESS_WIDTH: u32 = 36;

/// The order of a 1 MiB section.
pub const SECT_ORDER: u32 = 20;
/// The order of a 64 KiB large page.
pub const LPAGE_ORDER: u32 = 16;
/// The order of a 4 KiB small page.
pub const SPAGE_ORDER: u32 = 12;

pub const SECT_SIZE: usize = 1 << SECT_ORDER;
pub const LPAGE_SIZE: usize = 1 << LPAGE_ORDER;
pub const SPAGE_SIZE: usize = 1 << SPAGE_ORDER;

/// The number of level-1 entries, covering the whole 36-bit IOVA space.
pub const NUM_LV1ENTRIES: usize = 1 << (ADDRESS_WIDTH - SECT_ORDER);
/// The number of level-2 entries in one level-2 table.
pub const NUM_LV2ENTRIES: usize = SECT_SIZE / SPAGE_SIZE;
/// The number of level-2 entries that make up one large page.
pub const SPAGES_PER_LPAGE: usize = LPAGE_SIZE / SPAGE_SIZE;

/// The size of a level-2 table in bytes.
pub const LV2TABLE_SIZE: usize = NUM_LV2ENTRIES * size_of::<u32>();
/// The size of a level-2 table together with its trailing duplicate counts.
pub const LV2TABLE_REFCNT_SZ: usize = LV2TABLE_SIZE * 2;
/// The size of the level-1 table in bytes.
pub const LV1TABLE_SIZE: usize = NUM_LV1ENTRIES * size_of::<u32>();
/// The 36-bit level-1 table must be aligned to 256 KiB.
pub const LV1TABLE_ALIGN: u64 = LV1TABLE_SIZE as u64;
