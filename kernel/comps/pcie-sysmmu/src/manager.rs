// SPDX-License-Identifier: MPL-2.0

use alloc::sync::Arc;

use log::{error, info};

use crate::{
    fault::IrqOutcome,
    sysmmu::{IommuProt, PcieSysmmu, MAX_RC_NUM},
    tlb::TlbDump,
    Error, Iova, Paddr, Result,
};

/// The SysMMUs of all PCIe channels, addressed by channel number.
///
/// This is the entry point of the PCIe controller driver, which only knows
/// the channel that a request belongs to.
#[derive(Debug, Default)]
pub struct SysmmuManager {
    channels: [Option<Arc<PcieSysmmu>>; MAX_RC_NUM],
}

impl SysmmuManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an initialized SysMMU under its channel.
    pub fn register(&mut self, sysmmu: Arc<PcieSysmmu>) -> Result<()> {
        let channel = sysmmu.channel();
        let slot = self.channels.get_mut(channel).ok_or(Error::NoSuchChannel)?;
        if slot.is_some() {
            error!("SysMMU of channel {} is already registered", channel);
            return Err(Error::InvalidConfig);
        }
        *slot = Some(sysmmu);
        info!("Registered SysMMU of channel {}", channel);
        Ok(())
    }

    pub fn get(&self, channel: usize) -> Option<&Arc<PcieSysmmu>> {
        self.channels.get(channel)?.as_ref()
    }

    fn channel(&self, channel: usize) -> Result<&Arc<PcieSysmmu>> {
        self.get(channel).ok_or_else(|| {
            error!("No SysMMU for channel {}", channel);
            Error::NoSuchChannel
        })
    }

    /// Maps a range for channel `channel`. `prot` takes the raw
    /// [`IommuProt`] bits; unknown bits are ignored.
    pub fn map(
        &self,
        channel: usize,
        iova: Iova,
        paddr: Paddr,
        size: usize,
        prot: u32,
    ) -> Result<()> {
        self.channel(channel)?
            .map(iova, paddr, size, IommuProt::from_bits_truncate(prot))
    }

    /// Unmaps a range for channel `channel` and returns the unmapped bytes.
    /// An unknown channel unmaps nothing.
    pub fn unmap(&self, channel: usize, iova: Iova, size: usize) -> usize {
        match self.channel(channel) {
            Ok(sysmmu) => sysmmu.unmap(iova, size),
            Err(_) => 0,
        }
    }

    pub fn enable(&self, channel: usize) -> Result<()> {
        self.channel(channel)?.enable();
        Ok(())
    }

    pub fn disable(&self, channel: usize) -> Result<()> {
        self.channel(channel)?.disable();
        Ok(())
    }

    pub fn dump_tlb(&self, channel: usize) -> Result<TlbDump> {
        Ok(self.channel(channel)?.dump_tlb())
    }

    /// Dispatches the fault interrupt of channel `channel`.
    pub fn handle_irq(&self, channel: usize) -> Result<IrqOutcome> {
        Ok(self.channel(channel)?.handle_irq())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        lv2_alloc::{Lv2AllocConfig, Lv2Allocator},
        region::DramRegions,
        sysmmu::SysmmuDeps,
        test_util::FakeRegs,
        CoherentFlush, SysmmuConfig,
    };

    fn sysmmu(channel: usize, allocator: &Arc<Lv2Allocator>) -> Arc<PcieSysmmu> {
        let deps = SysmmuDeps {
            regs: Arc::new(FakeRegs::default()),
            flush: Arc::new(CoherentFlush),
            allocator: allocator.clone(),
            regions: Arc::new(DramRegions::from_memblocks(&[(0x8000_0000, 0x4000_0000)]).unwrap()),
            pgtable_paddr: 0x9c00_0000 + channel as Paddr * 0x4_0000,
        };
        Arc::new(PcieSysmmu::new(SysmmuConfig::new(channel), deps).unwrap())
    }

    #[test]
    fn channels_are_independent() {
        let allocator = Lv2Allocator::new(Lv2AllocConfig::default()).unwrap();
        let mut manager = SysmmuManager::new();
        manager.register(sysmmu(0, &allocator)).unwrap();
        manager.register(sysmmu(1, &allocator)).unwrap();

        manager.map(0, 0x1000_0000, 0x8000_0000, 0x1000, 0x3).unwrap();
        manager.map(1, 0x1000_0000, 0x8000_5000, 0x1000, 0x3).unwrap();
        assert_eq!(manager.get(0).unwrap().iova_to_phys(0x1000_0000), Some(0x8000_0000));
        assert_eq!(manager.get(1).unwrap().iova_to_phys(0x1000_0000), Some(0x8000_5000));
        // Both tables come from the shared pool.
        assert_eq!(allocator.stats().pool, 2);

        assert_eq!(manager.unmap(0, 0x1000_0000, 0x1000), 0x1000);
        assert_eq!(manager.get(1).unwrap().iova_to_phys(0x1000_0000), Some(0x8000_5000));
    }

    #[test]
    fn missing_channels() {
        let allocator = Lv2Allocator::new(Lv2AllocConfig::default()).unwrap();
        let mut manager = SysmmuManager::new();
        manager.register(sysmmu(1, &allocator)).unwrap();

        assert_eq!(
            manager.map(0, 0x1000_0000, 0x8000_0000, 0x1000, 0x3),
            Err(Error::NoSuchChannel)
        );
        assert_eq!(manager.unmap(0, 0x1000_0000, 0x1000), 0);
        assert_eq!(manager.enable(5), Err(Error::NoSuchChannel));
        assert!(manager.handle_irq(0).is_err());
        assert_eq!(
            manager.register(sysmmu(1, &allocator)),
            Err(Error::InvalidConfig)
        );
    }
}
