// SPDX-License-Identifier: MPL-2.0

//! TLB maintenance and the TLB dump.

use log::error;

use crate::{
    regs::{
        entry_valid, flush_range_regs, tlb_geometry, tlb_read_entry, Capability, SysmmuIo,
        REG_CAPA1_SBB_ATTR, REG_CAPA1_SBB_LINK, REG_CAPA1_SBB_READ, REG_CAPA1_SBB_VPN,
        REG_CAPA1_TLB_ATTR, REG_CAPA1_TLB_PPN, REG_CAPA1_TLB_READ, REG_CAPA1_TLB_VPN,
        REG_FLUSH_RANGE_END, REG_FLUSH_RANGE_START, REG_MMU_FLUSH, REG_MMU_FLUSH_RANGE,
    },
    Iova,
};

const NUM_TLB_SUBLINE: usize = 4;

pub(crate) fn invalidate_all(regs: &dyn SysmmuIo) {
    regs.write(REG_MMU_FLUSH, 0x1);
}

/// Invalidates the TLB entries of `iova..iova + size`.
pub(crate) fn invalidate_range(regs: &dyn SysmmuIo, iova: Iova, size: usize) {
    let (start, end) = flush_range_regs(iova, size);
    regs.write(REG_FLUSH_RANGE_START, start);
    regs.write(REG_FLUSH_RANGE_END, end);
    regs.write(REG_MMU_FLUSH_RANGE, 0x1);
}

/// The number of valid entries found by a TLB dump.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlbDump {
    pub tlb_entries: usize,
    pub sbb_entries: usize,
}

/// Prints every valid entry of the TLBs and of the second-level page table
/// base buffer (SBB).
pub(crate) fn dump(regs: &dyn SysmmuIo) -> TlbDump {
    let capa = Capability::read(regs);
    error!(
        "SysMMU has {} TLBs, {} ports, {} sbb entries",
        capa.num_tlb, capa.num_port, capa.num_sbb
    );

    let mut result = TlbDump::default();
    for tlb in 0..capa.num_tlb {
        let (num_way, num_set) = tlb_geometry(regs, tlb);
        error!("TLB.{} has {} way, {} set.", tlb, num_way, num_set);
        error!("------------- TLB[WAY][SET][ENTRY] -------------");
        for way in 0..num_way {
            for set in 0..num_set {
                for line in 0..NUM_TLB_SUBLINE {
                    regs.write(REG_CAPA1_TLB_READ, tlb_read_entry(tlb, set, way, line));
                    let attr = regs.read(REG_CAPA1_TLB_ATTR);
                    if entry_valid(attr) {
                        error!(
                            "[{:02}][{:02}] VPN: {:#010x}, PPN: {:#010x}, ATTR: {:#010x}",
                            way,
                            set,
                            regs.read(REG_CAPA1_TLB_VPN),
                            regs.read(REG_CAPA1_TLB_PPN),
                            attr
                        );
                        result.tlb_entries += 1;
                    }
                }
            }
        }
    }
    if result.tlb_entries == 0 {
        error!(">> No Valid TLB Entries");
    }

    error!("--- SBB(Second-Level Page Table Base Address Buffer) ---");
    for i in 0..capa.num_sbb {
        regs.write(REG_CAPA1_SBB_READ, i as u32);
        let vpn = regs.read(REG_CAPA1_SBB_VPN);
        if entry_valid(vpn) {
            error!(
                "[{:02}] VPN: {:#010x}, PPN: {:#010x}, ATTR: {:#010x}",
                i,
                vpn,
                regs.read(REG_CAPA1_SBB_LINK),
                regs.read(REG_CAPA1_SBB_ATTR)
            );
            result.sbb_entries += 1;
        }
    }
    if result.sbb_entries == 0 {
        error!(">> No Valid SBB Entries");
    }

    result
}
