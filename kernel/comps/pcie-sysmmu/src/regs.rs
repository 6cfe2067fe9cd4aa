// SPDX-License-Identifier: MPL-2.0

//! The special function registers (SFRs) of the PCIe SysMMU.

use core::{fmt, ptr::NonNull};

use bit_field::BitField;
use bitflags::bitflags;
use volatile::VolatilePtr;

use crate::Iova;

pub const REG_MMU_CTRL: usize = 0x000;
pub const REG_MMU_CFG: usize = 0x004;
pub const REG_PT_BASE_PPN: usize = 0x00c;
pub const REG_MMU_FLUSH: usize = 0x010;
pub const REG_MMU_FLUSH_RANGE: usize = 0x018;
pub const REG_FLUSH_RANGE_START: usize = 0x020;
pub const REG_FLUSH_RANGE_END: usize = 0x024;
pub const REG_MMU_VERSION: usize = 0x034;
pub const REG_INT_STATUS: usize = 0x060;
pub const REG_INT_CLEAR: usize = 0x064;
pub const REG_FAULT_ADDR: usize = 0x070;
pub const REG_FAULT_AR_TRANS_INFO: usize = 0x074;
pub const REG_FAULT_TRANS_INFO: usize = 0x078;
pub const REG_FAULT_AW_TRANS_INFO: usize = 0x07c;
pub const REG_MMU_CAPA0_V7: usize = 0x870;
pub const REG_MMU_CAPA1_V7: usize = 0x874;
pub const REG_CAPA1_TLB_READ: usize = 0x8000;
pub const REG_CAPA1_TLB_VPN: usize = 0x8004;
pub const REG_CAPA1_TLB_PPN: usize = 0x8008;
pub const REG_CAPA1_TLB_ATTR: usize = 0x800c;
pub const REG_CAPA1_SBB_READ: usize = 0x8020;
pub const REG_CAPA1_SBB_VPN: usize = 0x8024;
pub const REG_CAPA1_SBB_LINK: usize = 0x8028;
pub const REG_CAPA1_SBB_ATTR: usize = 0x802c;

/// The size of the SFR block.
pub const SFR_SIZE: usize = 0x9000;

pub const fn reg_tlb_info(tlb: usize) -> usize {
    0x2000 + tlb * 0x20
}

pub const fn reg_tlb_cfg(tlb: usize) -> usize {
    reg_tlb_info(tlb) + 0x4
}

pub const fn reg_tlb_match_cfg(tlb: usize) -> usize {
    reg_tlb_info(tlb) + 0x8
}

pub const fn reg_tlb_match_sva(tlb: usize) -> usize {
    reg_tlb_info(tlb) + 0xc
}

pub const fn reg_tlb_match_eva(tlb: usize) -> usize {
    reg_tlb_info(tlb) + 0x10
}

pub const CTRL_ENABLE: u32 = 0x5;
pub const CTRL_DISABLE: u32 = 0x0;
pub const CTRL_BLOCK: u32 = 0x7;

/// The QoS bits of `MMU_CFG` that the driver owns.
pub const CFG_MASK: u32 = 0xf80;
pub const CFG_QOS_OVERRIDE: u32 = 1 << 11;

pub const fn cfg_qos(qos: u8) -> u32 {
    ((qos & 0xf) as u32) << 7
}

bitflags! {
    /// The requests that a TLB accepts, programmed into `TLB_MATCH_CFG`.
    pub struct TlbMatchCfg: u32 {
        const PCIE_PORT0 = 1 << 16;
        const PCIE_PORT1 = 1 << 17;
        const READ_REQ = 1 << 24;
        const WRITE_REQ = 1 << 25;

        const ALL_PCIE_PORT = Self::PCIE_PORT0.bits | Self::PCIE_PORT1.bits;
        const RW_REQ = Self::READ_REQ.bits | Self::WRITE_REQ.bits;
    }
}

/// Access to the SFRs of one SysMMU.
///
/// Offsets are in bytes from the start of the SFR block and always 4-byte
/// aligned.
pub trait SysmmuIo: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// The memory-mapped SFR block of a real SysMMU.
pub struct MmioRegs {
    base: NonNull<u32>,
    len: usize,
}

// SAFETY: The registers may be accessed from any CPU; every access is a
// single volatile load or store.
unsafe impl Send for MmioRegs {}
// SAFETY: Ditto.
unsafe impl Sync for MmioRegs {}

impl MmioRegs {
    /// Creates the register block at `base`, which is `len` bytes long.
    ///
    /// # Safety
    ///
    /// `base` must point to the mapped SFRs of a SysMMU that stay mapped for
    /// the lifetime of the returned value, and no one else may access them.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        assert_eq!(base.as_ptr() as usize % size_of::<u32>(), 0);
        Self {
            base: base.cast(),
            len,
        }
    }

    fn reg(&self, offset: usize) -> VolatilePtr<'_, u32> {
        assert!(offset % size_of::<u32>() == 0 && offset + size_of::<u32>() <= self.len);
        // SAFETY: The offset is inside the block, as checked above.
        let ptr = unsafe { self.base.add(offset / size_of::<u32>()) };
        // SAFETY: The caller of `new` guarantees that the register is mapped.
        unsafe { VolatilePtr::new(ptr) }
    }
}

impl SysmmuIo for MmioRegs {
    fn read(&self, offset: usize) -> u32 {
        self.reg(offset).read()
    }

    fn write(&self, offset: usize, value: u32) {
        self.reg(offset).write(value);
    }
}

impl fmt::Debug for MmioRegs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioRegs")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

/// The hardware version, as read from `MMU_VERSION`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HwVersion(u32);

impl HwVersion {
    pub fn from_reg(reg: u32) -> Self {
        Self(reg.get_bits(21..32))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn major(&self) -> u32 {
        self.0.get_bits(7..11)
    }

    pub fn minor(&self) -> u32 {
        self.0.get_bits(4..7)
    }

    pub fn revision(&self) -> u32 {
        self.0.get_bits(0..4)
    }
}

impl fmt::Display for HwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.revision())
    }
}

/// Encodes the range `iova..iova + size` for `FLUSH_RANGE_START` and
/// `FLUSH_RANGE_END`.
///
/// Bits `35:32` of the IOVA are carried in bits `11:8` of both registers.
pub fn flush_range_regs(iova: Iova, size: usize) -> (u32, u32) {
    let lower = iova as u32;
    let upper = ((iova >> 32) as u32) & 0xf;

    let start = (lower & 0xffff_f000) | (upper << 8);

    let mut end = (size as u32).wrapping_sub(1).wrapping_add(lower);
    end &= !(0xf << 8);
    end |= upper << 8;
    end &= !0xff;

    (start, end)
}

/// The TLB geometry of the SysMMU, read from its capability registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capability {
    pub num_tlb: usize,
    pub num_port: usize,
    pub num_sbb: usize,
}

impl Capability {
    pub fn read(regs: &dyn SysmmuIo) -> Self {
        let capa0 = regs.read(REG_MMU_CAPA0_V7);
        let capa1 = regs.read(REG_MMU_CAPA1_V7);
        Self {
            num_tlb: capa1.get_bits(12..16) as usize,
            num_port: capa1.get_bits(0..8) as usize,
            num_sbb: 1 << capa0.get_bits(12..16),
        }
    }
}

/// The number of ways and sets of TLB `tlb`.
pub fn tlb_geometry(regs: &dyn SysmmuIo, tlb: usize) -> (usize, usize) {
    let info = regs.read(reg_tlb_info(tlb));
    (info.get_bits(0..8) as usize, info.get_bits(16..24) as usize)
}

/// The value of `CAPA1_TLB_READ` that selects one TLB sub-line.
pub fn tlb_read_entry(tlb: usize, set: usize, way: usize, line: usize) -> u32 {
    (set | (way << 8) | (line << 16) | (tlb << 20)) as u32
}

/// Whether a `CAPA1_TLB_ATTR` or `CAPA1_SBB_VPN` value is a valid entry.
pub fn entry_valid(reg: u32) -> bool {
    reg.get_bits(28..32) != 0
}
