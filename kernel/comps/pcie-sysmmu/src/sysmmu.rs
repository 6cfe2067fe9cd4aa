// SPDX-License-Identifier: MPL-2.0

use alloc::{format, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use align_ext::AlignExt;
use bitflags::bitflags;
use log::{debug, error, info, trace, warn};
use spin::Mutex;

#[cfg(feature = "history_log")]
use crate::history::{HistoryLog, HistoryRecord};
use crate::{
    config::{PinnedRegion, SysmmuConfig, MAX_QOS_VALUE},
    domain::{Domain, Unmapped},
    fault::{self, FaultEvent, FaultVerdict, IrqOutcome},
    flush::CacheFlush,
    lv2_alloc::Lv2Allocator,
    pgsize::{choose_pagesize, min_pagesize},
    region::DramRegions,
    regs::{
        cfg_qos, reg_tlb_cfg, reg_tlb_match_cfg, reg_tlb_match_eva, reg_tlb_match_sva, HwVersion,
        SysmmuIo, TlbMatchCfg, CFG_MASK, CFG_QOS_OVERRIDE, CTRL_BLOCK, CTRL_DISABLE, CTRL_ENABLE,
        REG_INT_CLEAR, REG_MMU_CFG, REG_MMU_CTRL, REG_MMU_VERSION, REG_PT_BASE_PPN,
    },
    tlb::{self, TlbDump},
    Error, Iova, Paddr, Result, ADDRESS_WIDTH, SPAGE_ORDER, SPAGE_SIZE,
};

/// The number of PCIe root complexes, each with its own SysMMU.
pub const MAX_RC_NUM: usize = 2;

bitflags! {
    /// The access rights of a mapping.
    pub struct IommuProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// The device accesses are coherent with the CPU caches, which makes
        /// the entries shareable.
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
    }
}

/// The collaborators of a [`PcieSysmmu`].
pub struct SysmmuDeps {
    pub regs: Arc<dyn SysmmuIo>,
    pub flush: Arc<dyn CacheFlush>,
    pub allocator: Arc<Lv2Allocator>,
    pub regions: Arc<DramRegions>,
    /// The physical address of the level-1 table.
    pub pgtable_paddr: Paddr,
}

/// Counters kept for debugging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SysmmuStats {
    /// The number of mapped chunks.
    pub live_chunks: usize,
    /// The highest `live_chunks` seen.
    pub max_live_chunks: usize,
    pub lv2_tables: usize,
    /// The number of suppressed false-positive faults.
    pub wrong_pf_cnt: u32,
}

struct ChannelState {
    /// Whether the table walker is on. TLB maintenance is skipped otherwise.
    active: bool,
    suspended: bool,
}

type FaultNotifier = Arc<dyn Fn(&FaultEvent) + Send + Sync>;

/// The SysMMU of one PCIe root complex.
pub struct PcieSysmmu {
    config: SysmmuConfig,
    name: String,
    regs: Arc<dyn SysmmuIo>,
    domain: Domain,
    regions: Arc<DramRegions>,
    version: HwVersion,
    /// Guards the active state. Independent of the table lock, so the fault
    /// handler never waits for a map or unmap.
    state: Mutex<ChannelState>,
    live_chunks: AtomicUsize,
    max_live_chunks: AtomicUsize,
    wrong_pf_cnt: AtomicU32,
    notifiers: Mutex<Vec<FaultNotifier>>,
    #[cfg(feature = "history_log")]
    map_history: HistoryLog,
    #[cfg(feature = "history_log")]
    unmap_history: HistoryLog,
}

impl PcieSysmmu {
    /// Sets up the SysMMU of `config.channel`, which is left disabled.
    pub fn new(mut config: SysmmuConfig, deps: SysmmuDeps) -> Result<Self> {
        if config.channel >= MAX_RC_NUM {
            error!("Channel {} is out of range", config.channel);
            return Err(Error::InvalidConfig);
        }
        if config.qos.is_some_and(|qos| qos > MAX_QOS_VALUE) {
            warn!("Invalid QoS value {:?}, use default.", config.qos);
            config.qos = None;
        }

        let domain = Domain::new(deps.pgtable_paddr, deps.allocator, deps.flush)?;
        let name = match &config.port_name {
            Some(name) => name.clone(),
            None => format!("pcie-sysmmu.{}", config.channel),
        };

        let mut sysmmu = Self {
            config,
            name,
            regs: deps.regs,
            domain,
            regions: deps.regions,
            version: HwVersion::default(),
            state: Mutex::new(ChannelState {
                active: false,
                suspended: false,
            }),
            live_chunks: AtomicUsize::new(0),
            max_live_chunks: AtomicUsize::new(0),
            wrong_pf_cnt: AtomicU32::new(0),
            notifiers: Mutex::new(Vec::new()),
            #[cfg(feature = "history_log")]
            map_history: HistoryLog::new(),
            #[cfg(feature = "history_log")]
            unmap_history: HistoryLog::new(),
        };

        // The version register only reads back while the SysMMU is on.
        sysmmu.hw_enable();
        sysmmu.version = HwVersion::from_reg(sysmmu.regs.read(REG_MMU_VERSION));
        sysmmu.hw_disable();

        info!(
            "[{}] L1Page Table Address : {:#x}(phys)",
            sysmmu.name,
            sysmmu.domain.pgtable_paddr()
        );
        info!("[{}] is initialized. Version {}", sysmmu.name, sysmmu.version);
        Ok(sysmmu)
    }

    pub fn channel(&self) -> usize {
        self.config.channel
    }

    pub fn config(&self) -> &SysmmuConfig {
        &self.config
    }

    pub fn version(&self) -> HwVersion {
        self.version
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn regions(&self) -> &DramRegions {
        &self.regions
    }

    /// Turns the table walker on and starts TLB maintenance.
    pub fn enable(&self) {
        self.hw_enable();
        self.state.lock().active = true;
        debug!("[{}] enabled", self.name);
    }

    /// Stops TLB maintenance and puts the SysMMU in bypass.
    pub fn disable(&self) {
        self.state.lock().active = false;
        self.hw_disable();

        let stats = self.stats();
        info!(
            "SysMMU alloc num : {}(Max:{}), lv2_alloc : {}, fault : {}",
            stats.live_chunks, stats.max_live_chunks, stats.lv2_tables, stats.wrong_pf_cnt
        );
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn suspend(&self) {
        if self.config.no_suspend {
            debug!("[{}] stays powered across suspend", self.name);
            return;
        }
        self.state.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.state.lock().suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    /// Maps `iova..iova + size` to `paddr..paddr + size`.
    ///
    /// A misaligned `iova` is aligned down together with `paddr`, and the
    /// size is grown to cover the same bytes. If a chunk fails, the chunks
    /// already mapped by this call are unmapped again before the error is
    /// returned.
    pub fn map(&self, iova: Iova, paddr: Paddr, size: usize, prot: IommuProt) -> Result<()> {
        self.regions.validate(paddr)?;

        let orig_paddr = paddr;
        let orig_size = size;
        let (iova, paddr, size) = align_map_request(iova, paddr, size)?;
        let min_pagesz = min_pagesize(self.domain.pgsize_bitmap()) as u64;
        if (iova | paddr | size as u64) % min_pagesz != 0 {
            error!(
                "unaligned: iova {:#x} pa {:#x} sz {:#x} min_pagesz {:#x}",
                iova, paddr, size, min_pagesz
            );
            return Err(Error::InvalidAddress);
        }
        if !in_address_space(iova, size) || !in_address_space(paddr, size) {
            error!("Mapping {:#x}@{:#x} -> {:#x} is out of range", size, iova, paddr);
            return Err(Error::InvalidAddress);
        }

        let mut mapped = 0;
        let mut result = Ok(());
        let mut guard = self.domain.lock();
        while mapped < size {
            let cur_iova = iova + mapped as u64;
            let cur_paddr = paddr + mapped as u64;
            let pgsize = choose_pagesize(
                cur_iova | cur_paddr,
                size - mapped,
                self.domain.pgsize_bitmap(),
            );
            trace!(
                "mapping: iova {:#x} pa {:#x} pgsize {:#x}",
                cur_iova,
                cur_paddr,
                pgsize
            );

            let chunk = guard.map_chunk(cur_iova, cur_paddr, pgsize, prot);
            #[cfg(feature = "history_log")]
            self.map_history.push(HistoryRecord {
                addr: cur_paddr,
                orig_addr: orig_paddr,
                size,
                orig_size,
            });
            if let Err(err) = chunk {
                result = Err(err);
                break;
            }

            self.count_mapped_chunk();
            self.tlb_invalidate(cur_iova, pgsize);
            mapped += pgsize;
        }
        drop(guard);

        if let Err(err) = result {
            error!("PCIe SysMMU mapping Error!");
            self.rollback(iova, mapped);
            return Err(err);
        }

        debug!("mapped: iova {:#x} pa {:#x} size {:#x}", iova, paddr, size);
        Ok(())
    }

    /// Unmaps `iova..iova + size` and returns the number of bytes that were
    /// mapped there.
    ///
    /// Holes are skipped. The walk stops early at a page that is larger than
    /// the rest of the range.
    pub fn unmap(&self, iova: Iova, size: usize) -> usize {
        let orig_iova = iova;
        let orig_size = size;
        let Some((iova, size)) = align_unmap_request(iova, size) else {
            error!("Unmapping {:#x}@{:#x} overflows", size, iova);
            return 0;
        };
        let min_pagesz = min_pagesize(self.domain.pgsize_bitmap()) as u64;
        if (iova | size as u64) % min_pagesz != 0 {
            error!(
                "unaligned: iova {:#x} size {:#x} min_pagesz {:#x}",
                iova, size, min_pagesz
            );
            return 0;
        }
        if !in_address_space(iova, size) {
            error!("Unmapping {:#x}@{:#x} is out of range", size, iova);
            return 0;
        }

        trace!("unmap this: iova {:#x} size {:#x}", iova, size);

        let mut consumed = 0;
        let mut unmapped = 0;
        let mut guard = self.domain.lock();
        while consumed < size {
            let cur_iova = iova + consumed as u64;
            let pgsize = choose_pagesize(cur_iova, size - consumed, self.domain.pgsize_bitmap());

            let chunk = guard.unmap_chunk(cur_iova, pgsize);
            #[cfg(feature = "history_log")]
            self.unmap_history.push(HistoryRecord {
                addr: cur_iova,
                orig_addr: orig_iova,
                size,
                orig_size,
            });
            match chunk {
                Ok(Unmapped::Freed(len)) => {
                    trace!("unmapped: iova {:#x} size {:#x}", cur_iova, len);
                    self.count_unmapped_chunk();
                    self.tlb_invalidate(cur_iova, len);
                    unmapped += len;
                    consumed += len;
                }
                Ok(Unmapped::Skipped(len)) => consumed += len,
                Err(_) => break,
            }
        }
        drop(guard);

        debug!(
            "UNMAPPED : req {:#x}({:#x}) size {:#x}({:#x}), unmapped {:#x}",
            iova, orig_iova, size, orig_size, unmapped
        );
        unmapped
    }

    pub fn iova_to_phys(&self, iova: Iova) -> Option<Paddr> {
        self.domain.iova_to_phys(iova)
    }

    /// Returns every level-2 table of the channel to the allocator.
    pub fn release_all_tables(&self) -> usize {
        self.domain.release_all_tables()
    }

    /// Prints the TLB contents of the SysMMU.
    pub fn dump_tlb(&self) -> TlbDump {
        let pgtable = (self.regs.read(REG_PT_BASE_PPN) as Paddr) << SPAGE_ORDER;
        error!("Page Table Base Address : {:#x}", pgtable);
        tlb::dump(&*self.regs)
    }

    /// Registers a callback that is invoked with every fault that is not
    /// suppressed.
    pub fn register_fault_handler<F>(&self, handler: F)
    where
        F: Fn(&FaultEvent) + Send + Sync + 'static,
    {
        self.notifiers.lock().push(Arc::new(handler));
    }

    /// Classifies `event` against the current tables.
    pub fn diagnose(&self, event: &FaultEvent) -> FaultVerdict {
        fault::diagnose(&self.domain, event)
    }

    /// Handles the fault interrupt.
    ///
    /// # Panics
    ///
    /// If `panic_on_fault` is set, the function panics on every fault that
    /// is not suppressed, after the fault notifiers have run.
    pub fn handle_irq(&self) -> IrqOutcome {
        info!("[{}] irq happened", self.name);
        if !self.is_active() {
            warn!("Fault occurred while System MMU {} is not enabled!", self.name);
        }

        let (event, int_status) = FaultEvent::read(&*self.regs, self.version);
        self.regs.write(REG_INT_CLEAR, int_status);

        let verdict = fault::report(&*self.regs, &self.name, &self.domain, &event);
        if verdict == FaultVerdict::Suppressed {
            self.wrong_pf_cnt.fetch_add(1, Ordering::Relaxed);
            return IrqOutcome::Suppressed;
        }

        // The lock is not held across the calls, so a notifier may register
        // further handlers. Those see the next fault.
        let notifiers = self.notifiers.lock().clone();
        for notifier in notifiers.iter() {
            notifier(&event);
        }

        if self.config.panic_on_fault {
            panic!("Unrecoverable System MMU Fault!!");
        }
        IrqOutcome::Escalated(verdict)
    }

    pub fn stats(&self) -> SysmmuStats {
        SysmmuStats {
            live_chunks: self.live_chunks.load(Ordering::Relaxed),
            max_live_chunks: self.max_live_chunks.load(Ordering::Relaxed),
            lv2_tables: self.domain.num_lv2_tables(),
            wrong_pf_cnt: self.wrong_pf_cnt.load(Ordering::Relaxed),
        }
    }

    #[cfg(feature = "history_log")]
    pub fn map_history(&self) -> &HistoryLog {
        &self.map_history
    }

    #[cfg(feature = "history_log")]
    pub fn unmap_history(&self) -> &HistoryLog {
        &self.unmap_history
    }

    fn rollback(&self, iova: Iova, mapped: usize) {
        if mapped == 0 {
            return;
        }
        let unmapped = self.unmap(iova, mapped);
        if unmapped != mapped {
            error!(
                "Rollback of {:#x}@{:#x} unmapped {:#x} bytes",
                mapped, iova, unmapped
            );
        }
    }

    fn tlb_invalidate(&self, iova: Iova, size: usize) {
        let state = self.state.lock();
        if !state.active {
            debug!("Skip TLB invalidation {:#x}@{:#x}", size, iova);
            return;
        }
        debug!("TLB invalidation {:#x}@{:#x}", size, iova);
        tlb::invalidate_range(&*self.regs, iova, size);
    }

    fn count_mapped_chunk(&self) {
        let live = self.live_chunks.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_live_chunks.fetch_max(live, Ordering::Relaxed);
    }

    fn count_unmapped_chunk(&self) {
        // The closure never fails, so neither does the update.
        self.live_chunks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                Some(live.saturating_sub(1))
            })
            .ok();
    }

    fn hw_enable(&self) {
        let regs = &*self.regs;
        regs.write(REG_MMU_CTRL, CTRL_BLOCK);

        regs.write(reg_tlb_cfg(0), 0);
        // TLB 1 serves both PCIe channels.
        regs.write(reg_tlb_cfg(1), 0);
        regs.write(
            reg_tlb_match_cfg(1),
            (TlbMatchCfg::ALL_PCIE_PORT | TlbMatchCfg::RW_REQ).bits(),
        );
        if let Some(region) = self.config.tlb_pinning {
            self.pin_tlb(region);
        }

        let mut cfg = 0;
        if let Some(qos) = self.config.qos {
            cfg |= CFG_QOS_OVERRIDE | cfg_qos(qos);
        }
        cfg |= regs.read(REG_MMU_CFG) & !CFG_MASK;
        regs.write(REG_MMU_CFG, cfg);

        regs.write(
            REG_PT_BASE_PPN,
            (self.domain.pgtable_paddr() >> SPAGE_ORDER) as u32,
        );
        tlb::invalidate_all(regs);

        regs.write(REG_MMU_CTRL, CTRL_ENABLE);
    }

    fn hw_disable(&self) {
        self.regs.write(REG_MMU_CFG, 0);
        // Full disable puts the SysMMU in bypass.
        self.regs.write(REG_MMU_CTRL, CTRL_DISABLE);
    }

    fn pin_tlb(&self, region: PinnedRegion) {
        let regs = &*self.regs;
        let upper = ((region.start >> 32) & 0xf) as u32;
        let start = region.start as u32;
        let end = start.wrapping_add(region.size as u32);

        let mut match_cfg = regs.read(reg_tlb_match_cfg(1));
        // Replace the upper bits of both bounds.
        match_cfg &= !0xff;
        match_cfg |= (upper << 4) | upper;
        regs.write(reg_tlb_match_cfg(1), match_cfg);

        regs.write(reg_tlb_match_sva(1), start);
        regs.write(reg_tlb_match_eva(1), end);

        info!(
            "Set TLB MATCH address for TLB1 Pinning : {:#x}_{:x} ~ {:#x}_{:x}",
            upper, start, upper, end
        );
    }
}

impl core::fmt::Debug for PcieSysmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PcieSysmmu")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Aligns a map request to small pages.
fn align_map_request(iova: Iova, paddr: Paddr, size: usize) -> Result<(Iova, Paddr, usize)> {
    let offset = iova & (SPAGE_SIZE as u64 - 1);
    let (iova, paddr, size) = if offset != 0 {
        let size = size
            .checked_add(offset as usize)
            .ok_or(Error::InvalidAddress)?;
        (
            iova.align_down(SPAGE_SIZE as u64),
            paddr.align_down(SPAGE_SIZE as u64),
            size,
        )
    } else {
        (iova, paddr, size)
    };
    let size = round_up_to_spage(size).ok_or(Error::InvalidAddress)?;
    Ok((iova, paddr, size))
}

/// Aligns an unmap request to small pages.
fn align_unmap_request(iova: Iova, size: usize) -> Option<(Iova, usize)> {
    let offset = iova & (SPAGE_SIZE as u64 - 1);
    let size = size.checked_add(offset as usize)?;
    Some((iova.align_down(SPAGE_SIZE as u64), round_up_to_spage(size)?))
}

fn round_up_to_spage(size: usize) -> Option<usize> {
    Some(size.checked_add(SPAGE_SIZE - 1)?.align_down(SPAGE_SIZE))
}

fn in_address_space(addr: u64, size: usize) -> bool {
    addr.checked_add(size as u64)
        .is_some_and(|end| end <= 1 << ADDRESS_WIDTH)
}
