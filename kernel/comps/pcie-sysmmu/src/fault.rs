// SPDX-License-Identifier: MPL-2.0

//! Fault reporting.
//!
//! A fault interrupt is decoded into a [`FaultEvent`], reported together with
//! the table entries that translate the faulting address, and classified
//! into a [`FaultVerdict`]. The tables are read without the table lock, so
//! the entries printed may already be stale.

use bit_field::BitField;
use int_to_c_enum::TryFromInt;
use log::error;

use crate::{
    domain::Domain,
    pte::{Lv1Entry, PG_ENT_SHIFT},
    regs::{
        HwVersion, SysmmuIo, REG_FAULT_ADDR, REG_FAULT_AR_TRANS_INFO, REG_FAULT_AW_TRANS_INFO,
        REG_FAULT_TRANS_INFO, REG_INT_STATUS, REG_PT_BASE_PPN,
    },
    tlb, Paddr, SPAGE_ORDER,
};

/// The kind of a SysMMU fault, in the order of the `INT_STATUS` bits.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
pub enum FaultKind {
    PtwAccess = 0,
    Page = 1,
    MultiHit = 2,
    Access = 3,
    Security = 4,
    Unknown = 5,
}

impl FaultKind {
    /// Classifies a fault by the lowest bit set in `INT_STATUS`.
    pub fn from_status(int_status: u32) -> Self {
        if int_status == 0 {
            return FaultKind::Unknown;
        }
        FaultKind::try_from(int_status.trailing_zeros() as u8).unwrap_or(FaultKind::Unknown)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FaultKind::PtwAccess => "PTW ACCESS FAULT",
            FaultKind::Page => "PAGE FAULT",
            FaultKind::MultiHit => "L1TLB MULTI-HIT FAULT",
            FaultKind::Access => "ACCESS FAULT",
            FaultKind::Security => "SECURITY FAULT",
            FaultKind::Unknown => "UNKNOWN FAULT",
        }
    }
}

/// A decoded fault interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultEvent {
    pub kind: FaultKind,
    /// The faulting IOVA. All ones if the kind is unknown.
    pub address: u64,
    pub is_write: bool,
    /// The AxID of the faulting transaction.
    pub transaction_id: u16,
    /// The AxLEN of the faulting transaction.
    pub axlen: u8,
}

const TRANS_INFO_WRITE_BIT: usize = 20;

impl FaultEvent {
    /// Decodes the fault registers. Returns the event and the raw
    /// `INT_STATUS`, which the caller must write back to clear it.
    pub(crate) fn read(regs: &dyn SysmmuIo, version: HwVersion) -> (Self, u32) {
        let int_status = regs.read(REG_INT_STATUS);
        let kind = FaultKind::from_status(int_status);

        let trans_info = regs.read(REG_FAULT_TRANS_INFO);
        let mut address = match kind {
            FaultKind::Unknown => u64::MAX,
            _ => regs.read(REG_FAULT_ADDR) as u64,
        };
        // Bits 35:32 of the address are in the top bits of the trans info.
        address |= (trans_info.get_bits(28..32) as u64) << 32;

        let is_write = trans_info.get_bit(TRANS_INFO_WRITE_BIT);
        let info = if version.major() >= 7 {
            trans_info
        } else if is_write {
            regs.read(REG_FAULT_AW_TRANS_INFO)
        } else {
            regs.read(REG_FAULT_AR_TRANS_INFO)
        };

        let event = Self {
            kind,
            address,
            is_write,
            transaction_id: info.get_bits(0..16) as u16,
            axlen: info.get_bits(16..20) as u8,
        };
        (event, int_status)
    }
}

/// The conclusion of reporting a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultVerdict {
    /// The fault was not raised by this SysMMU.
    Unknown,
    Genuine,
    /// The table maps the faulting address as reported, so the fault is a
    /// known false positive.
    Suppressed,
}

/// What the interrupt handler did with a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqOutcome {
    /// The fault was a false positive and is ignored.
    Suppressed,
    /// The fault was reported to the notifiers and must be escalated by the
    /// caller.
    Escalated(FaultVerdict),
}

/// Classifies `event` against the current tables of `domain`.
pub fn diagnose(domain: &Domain, event: &FaultEvent) -> FaultVerdict {
    if event.kind == FaultKind::Unknown {
        error!("The fault is not caused by this System MMU.");
        error!("Please check IRQ and SFR base address.");
        return FaultVerdict::Unknown;
    }

    let lv1 = domain.lv1_raw(event.address);
    error!("Lv1 entry: {:#010x}", lv1);
    if !matches!(Lv1Entry::decode(lv1), Lv1Entry::Page { .. }) {
        return FaultVerdict::Genuine;
    }

    let Some(lv2) = domain.lv2_raw(event.address) else {
        // The table was reclaimed after the level-1 entry was read.
        return FaultVerdict::Genuine;
    };
    error!("Lv2 entry: {:#010x}", lv2);

    let ent_pfn = (lv2 as u64) >> (SPAGE_ORDER - PG_ENT_SHIFT);
    let fault_pfn = event.address >> SPAGE_ORDER;
    if ent_pfn == fault_pfn {
        error!("ent({:#x}) == faddr({:#x})...", ent_pfn, fault_pfn);
        error!("Try to IGNORE Page fault panic...");
        return FaultVerdict::Suppressed;
    }
    FaultVerdict::Genuine
}

/// Prints the full report of `event` and classifies it.
pub(crate) fn report(
    regs: &dyn SysmmuIo,
    port_name: &str,
    domain: &Domain,
    event: &FaultEvent,
) -> FaultVerdict {
    let hw_pgtable = (regs.read(REG_PT_BASE_PPN) as Paddr) << SPAGE_ORDER;

    error!("----------------------------------------------------------");
    error!(
        "From [{}], SysMMU {} {} at {:#010x} (page table @ {:#x})",
        port_name,
        if event.is_write { "WRITE" } else { "READ" },
        event.kind.name(),
        event.address,
        hw_pgtable
    );

    if event.kind != FaultKind::Unknown {
        error!(
            "AxID: {:#x}, AxLEN: {:#x}",
            event.transaction_id, event.axlen
        );
        if hw_pgtable != domain.pgtable_paddr() {
            error!("Page table base of driver: {:#x}", domain.pgtable_paddr());
        }
        if event.kind == FaultKind::PtwAccess {
            error!("System MMU has failed to access page table");
        }
    }

    let verdict = diagnose(domain, event);
    if verdict != FaultVerdict::Unknown {
        tlb::dump(regs);
    }
    error!("----------------------------------------------------------");

    verdict
}
