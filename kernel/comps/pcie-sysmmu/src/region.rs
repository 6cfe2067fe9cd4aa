// SPDX-License-Identifier: MPL-2.0

use log::{error, info};
use smallvec::SmallVec;

use crate::{Error, Paddr, Result};

/// The capacity of the DRAM region table.
///
/// A platform that reports this many memory blocks or more is rejected.
pub const NUM_DRAM_REGION: usize = 20;

/// A range of DRAM, with both bounds inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DramRegion {
    pub start: Paddr,
    pub end: Paddr,
}

/// The physical ranges that may be handed out to a PCIe device.
///
/// It is populated once from the platform memory layout and only queried
/// afterwards.
#[derive(Debug, Default)]
pub struct DramRegions {
    regions: SmallVec<[DramRegion; NUM_DRAM_REGION]>,
}

impl DramRegions {
    /// Builds the table from `(base, size)` memory blocks.
    pub fn from_memblocks(blocks: &[(Paddr, u64)]) -> Result<Self> {
        if blocks.len() >= NUM_DRAM_REGION {
            error!("DRAM region for validation is too big: {} blocks", blocks.len());
            return Err(Error::InvalidConfig);
        }

        let mut regions = SmallVec::new();
        for (i, &(base, size)) in blocks.iter().enumerate() {
            let Some(end) = size.checked_sub(1).and_then(|last| base.checked_add(last)) else {
                error!("Invalid DRAM block {}: {:#x}+{:#x}", i, base, size);
                return Err(Error::InvalidConfig);
            };
            info!("Valid DRAM region{} : {:#x} ~ {:#x}", i, base, end);
            regions.push(DramRegion { start: base, end });
        }

        Ok(Self { regions })
    }

    /// Returns whether `paddr` is inside any DRAM region.
    pub fn contains(&self, paddr: Paddr) -> bool {
        self.regions
            .iter()
            .any(|region| region.start <= paddr && paddr <= region.end)
    }

    /// Checks `paddr` before it is mapped.
    pub(crate) fn validate(&self, paddr: Paddr) -> Result<()> {
        if self.contains(paddr) {
            Ok(())
        } else {
            error!("Requested address {:#x} is NOT in DRAM region!!", paddr);
            Err(Error::InvalidAddress)
        }
    }

    pub fn regions(&self) -> &[DramRegion] {
        &self.regions
    }
}
