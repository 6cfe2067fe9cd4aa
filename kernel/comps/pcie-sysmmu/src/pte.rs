// SPDX-License-Identifier: MPL-2.0

//! The binary layout of the SysMMU page table entries.
//!
//! Every entry is a 32-bit word that stores a physical base shifted right by
//! [`PG_ENT_SHIFT`], so that 36-bit physical addresses fit, plus a type tag
//! in the lowest two bits:
//!
//! | bits `1:0` | level-1 entry  | level-2 entry |
//! |------------|----------------|---------------|
//! | `00`       | fault          | fault         |
//! | `01`       | level-2 table  | large page    |
//! | `1x`       | section        | small page    |
//!
//! The bit packing lives only in the `encode`/`decode` pair of each level.

use crate::{Iova, Paddr, NUM_LV2ENTRIES, SECT_ORDER, SPAGE_ORDER};

/// The right shift applied to a physical base before storing it in an entry.
pub const PG_ENT_SHIFT: u32 = 4;

const TYPE_MASK: u32 = 0b11;
const TYPE_FAULT: u32 = 0b00;
const TYPE_LINK: u32 = 0b01;
const TYPE_LEAF: u32 = 0b10;

const LV1_SHAREABLE: u32 = 1 << 6;
const LV2_SHAREABLE: u32 = 1 << 4;

// Masks of the stored (already shifted) physical bases.
const SECT_BASE_MASK: u32 = !((1 << (SECT_ORDER - PG_ENT_SHIFT)) - 1);
const LV2_TABLE_BASE_MASK: u32 = !0x7f;
const LPAGE_BASE_MASK: u32 = !0xfff;
const SPAGE_BASE_MASK: u32 = !0xff;

/// A decoded level-1 entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lv1Entry {
    Fault,
    /// Points to the level-2 table at the physical address `table`.
    Page { table: Paddr },
    /// Maps the 1 MiB region at `paddr` directly.
    Section { paddr: Paddr, shareable: bool },
}

impl Lv1Entry {
    pub fn decode(raw: u32) -> Self {
        match raw & TYPE_MASK {
            TYPE_FAULT => Self::Fault,
            TYPE_LINK => Self::Page {
                table: unshift(raw & LV2_TABLE_BASE_MASK),
            },
            _ => Self::Section {
                paddr: unshift(raw & SECT_BASE_MASK),
                shareable: raw & LV1_SHAREABLE != 0,
            },
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            Self::Fault => 0,
            Self::Page { table } => (shift(table) & LV2_TABLE_BASE_MASK) | TYPE_LINK,
            Self::Section { paddr, shareable } => {
                let mut raw = (shift(paddr) & SECT_BASE_MASK) | TYPE_LEAF;
                if shareable {
                    raw |= LV1_SHAREABLE;
                }
                raw
            }
        }
    }
}

/// A decoded level-2 entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lv2Entry {
    Fault,
    /// One of the 16 identical entries that map the 64 KiB page at `paddr`.
    Large { paddr: Paddr, shareable: bool },
    /// Maps the 4 KiB page at `paddr`.
    Small { paddr: Paddr, shareable: bool },
}

impl Lv2Entry {
    pub fn decode(raw: u32) -> Self {
        match raw & TYPE_MASK {
            TYPE_FAULT => Self::Fault,
            TYPE_LINK => Self::Large {
                paddr: unshift(raw & LPAGE_BASE_MASK),
                shareable: raw & LV2_SHAREABLE != 0,
            },
            _ => Self::Small {
                paddr: unshift(raw & SPAGE_BASE_MASK),
                shareable: raw & LV2_SHAREABLE != 0,
            },
        }
    }

    pub fn encode(self) -> u32 {
        let (base, tag, shareable) = match self {
            Self::Fault => return 0,
            Self::Large { paddr, shareable } => {
                (shift(paddr) & LPAGE_BASE_MASK, TYPE_LINK, shareable)
            }
            Self::Small { paddr, shareable } => {
                (shift(paddr) & SPAGE_BASE_MASK, TYPE_LEAF, shareable)
            }
        };
        let mut raw = base | tag;
        if shareable {
            raw |= LV2_SHAREABLE;
        }
        raw
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault)
    }
}

fn shift(paddr: Paddr) -> u32 {
    (paddr >> PG_ENT_SHIFT) as u32
}

fn unshift(stored: u32) -> Paddr {
    (stored as Paddr) << PG_ENT_SHIFT
}

/// The index of the level-1 entry that translates `iova`.
pub const fn lv1_index(iova: Iova) -> usize {
    (iova >> SECT_ORDER) as usize
}

/// The index of the level-2 entry that translates `iova` within its table.
pub const fn lv2_index(iova: Iova) -> usize {
    ((iova >> SPAGE_ORDER) as usize) & (NUM_LV2ENTRIES - 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lv1_layout() {
        assert_eq!(Lv1Entry::decode(0), Lv1Entry::Fault);

        let sect = Lv1Entry::Section {
            paddr: 0x8_8010_0000,
            shareable: true,
        };
        assert_eq!(sect.encode(), 0x8801_0042);
        assert_eq!(Lv1Entry::decode(sect.encode()), sect);
        // Both `10` and `11` are sections.
        assert!(matches!(
            Lv1Entry::decode(0x8801_0003),
            Lv1Entry::Section { paddr: 0x8_8010_0000, shareable: false }
        ));

        let page = Lv1Entry::Page { table: 0x9000_0800 };
        assert_eq!(page.encode(), 0x0900_0081);
        assert_eq!(Lv1Entry::decode(page.encode()), page);
    }

    #[test]
    fn lv2_layout() {
        let small = Lv2Entry::Small {
            paddr: 0x8000_3000,
            shareable: false,
        };
        assert_eq!(small.encode(), 0x0800_0302);
        // The fault path compares `raw >> 8` with a page frame number.
        assert_eq!(small.encode() >> 8, 0x8000_3000 >> 12);

        let large = Lv2Entry::Large {
            paddr: 0xf_8001_0000,
            shareable: true,
        };
        assert_eq!(large.encode(), 0xf800_1011);
        assert_eq!(Lv2Entry::decode(large.encode()), large);
        assert!(Lv2Entry::decode(0).is_fault());
    }

    #[test]
    fn indices() {
        assert_eq!(lv1_index(0x1000_0000), 0x100);
        assert_eq!(lv1_index(0xf_fff0_0000), 0xffff);
        assert_eq!(lv2_index(0x1000_0000), 0);
        assert_eq!(lv2_index(0x100f_f000), 0xff);
        assert_eq!(lv2_index(0x1001_5000), 0x15);
    }
}
