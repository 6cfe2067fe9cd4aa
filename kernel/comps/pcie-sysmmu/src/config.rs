// SPDX-License-Identifier: MPL-2.0

use alloc::string::{String, ToString};

use log::{debug, error, info, warn};

use crate::{sysmmu::MAX_RC_NUM, Error, Iova, Result};

/// The highest QoS priority that the SysMMU accepts.
pub const MAX_QOS_VALUE: u8 = 15;

/// An IOVA window whose translations are pinned in TLB 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinnedRegion {
    pub start: Iova,
    pub size: u64,
}

/// The static configuration of one SysMMU channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SysmmuConfig {
    /// The index of the PCIe root complex served by the SysMMU.
    pub channel: usize,
    /// Overrides the QoS of page table walks. `None` keeps the hardware
    /// default.
    pub qos: Option<u8>,
    /// Keeps the SysMMU powered across system suspend.
    pub no_suspend: bool,
    pub tlb_pinning: Option<PinnedRegion>,
    /// The name of the master port, used in fault reports.
    pub port_name: Option<String>,
    /// Panics after a genuine fault has been reported.
    pub panic_on_fault: bool,
}

impl SysmmuConfig {
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            qos: None,
            no_suspend: false,
            tlb_pinning: None,
            port_name: None,
            panic_on_fault: true,
        }
    }

    /// Builds the configuration from device tree properties.
    ///
    /// Each property is a `(name, value)` pair. Boolean properties are set
    /// by their presence and ignore the value.
    pub fn from_properties<'a, I>(props: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut channel = None;
        let mut qos = None;
        let mut no_suspend = false;
        let mut use_tlb_pinning = false;
        let mut pinned_region = None;
        let mut port_name = None;

        for (name, value) in props {
            match name {
                "ch-num" => channel = parse_number(value),
                "qos" => qos = parse_qos(value),
                "sysmmu,no-suspend" => no_suspend = true,
                "use-tlb-pinning" => use_tlb_pinning = parse_switch(value),
                "pinned-region" => pinned_region = parse_region(value),
                "port-name" => port_name = Some(value.to_string()),
                _ => debug!("Ignored SysMMU property {}", name),
            }
        }

        let Some(channel) = channel else {
            error!("Failed to parse the channel number");
            return Err(Error::InvalidConfig);
        };
        let channel = channel as usize;
        if channel >= MAX_RC_NUM {
            error!("Channel {} is out of range", channel);
            return Err(Error::InvalidConfig);
        }

        let tlb_pinning = match (use_tlb_pinning, pinned_region) {
            (true, Some(region)) => {
                info!("Enable TLB Pinning.");
                Some(region)
            }
            (true, None) => {
                warn!("TLB pinning is enabled without a pinned region, disable it");
                None
            }
            (false, _) => None,
        };

        Ok(Self {
            channel,
            qos,
            no_suspend,
            tlb_pinning,
            port_name,
            ..Self::new(channel)
        })
    }
}

fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_qos(value: &str) -> Option<u8> {
    match parse_number(value) {
        Some(qos) if qos <= MAX_QOS_VALUE as u64 => Some(qos as u8),
        _ => {
            warn!("Invalid QoS value {}, use default.", value);
            None
        }
    }
}

fn parse_switch(value: &str) -> bool {
    match value {
        "true" => true,
        "false" => false,
        _ => {
            warn!("Invalid TLB pinning value {} (set to default -> false)", value);
            false
        }
    }
}

fn parse_region(value: &str) -> Option<PinnedRegion> {
    let mut fields = value.split_whitespace().map(parse_number);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Some(start)), Some(Some(size)), None) if size != 0 => {
            Some(PinnedRegion { start, size })
        }
        _ => {
            warn!("Invalid pinned region {:?}", value);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_properties() {
        let config = SysmmuConfig::from_properties([
            ("ch-num", "1"),
            ("qos", "0xf"),
            ("sysmmu,no-suspend", ""),
            ("use-tlb-pinning", "true"),
            ("pinned-region", "0x8f0000000 0x400000"),
            ("port-name", "PCIe_WIFI"),
            ("compatible", "samsung,pcie-sysmmu"),
        ])
        .unwrap();

        assert_eq!(config.channel, 1);
        assert_eq!(config.qos, Some(15));
        assert!(config.no_suspend);
        assert_eq!(
            config.tlb_pinning,
            Some(PinnedRegion {
                start: 0x8_f000_0000,
                size: 0x40_0000
            })
        );
        assert_eq!(config.port_name.as_deref(), Some("PCIe_WIFI"));
        assert!(config.panic_on_fault);
    }

    #[test]
    fn minimal_properties() {
        let config = SysmmuConfig::from_properties([("ch-num", "0")]).unwrap();
        assert_eq!(config, SysmmuConfig::new(0));
    }

    #[test]
    fn bad_values_fall_back() {
        let config = SysmmuConfig::from_properties([
            ("ch-num", "0"),
            ("qos", "16"),
            ("use-tlb-pinning", "yes"),
            ("pinned-region", "0x8f0000000 0x400000"),
        ])
        .unwrap();
        assert_eq!(config.qos, None);
        assert_eq!(config.tlb_pinning, None);

        let config =
            SysmmuConfig::from_properties([("ch-num", "0"), ("use-tlb-pinning", "true")]).unwrap();
        assert_eq!(config.tlb_pinning, None);
    }

    #[test]
    fn channel_is_required() {
        assert_eq!(
            SysmmuConfig::from_properties([("qos", "3")]),
            Err(Error::InvalidConfig)
        );
        assert_eq!(
            SysmmuConfig::from_properties([("ch-num", "2")]),
            Err(Error::InvalidConfig)
        );
        assert_eq!(
            SysmmuConfig::from_properties([("ch-num", "one")]),
            Err(Error::InvalidConfig)
        );
    }

    #[test]
    fn regions() {
        assert_eq!(parse_region("0x1000 0x2000 0x3000"), None);
        assert_eq!(parse_region("0x1000 0"), None);
        assert_eq!(
            parse_region(" 4096   8192 "),
            Some(PinnedRegion {
                start: 0x1000,
                size: 0x2000
            })
        );
    }
}
