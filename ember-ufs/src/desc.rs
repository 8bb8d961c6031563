//! Device configuration descriptors, attributes and flags.
//!
//! Descriptors are read with query request UPIUs and carry big endian
//! multi-byte fields. Only the device and unit descriptors are decoded;
//! everything else the driver reads stays as raw bytes.

use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{UfsError, UfsResult};

/// Descriptor identifiers.
pub mod idn {
    /// Device descriptor.
    pub const DEVICE: u8 = 0x00;
    /// Unit descriptor, indexed by logical unit.
    pub const UNIT: u8 = 0x02;
}

/// Attribute identifiers.
pub mod attr {
    /// Reference clock frequency, `bRefClkFreq`.
    pub const REF_CLK_FREQ: u8 = 0x0a;
}

/// Flag identifiers.
pub mod flag {
    /// Device initialisation, `fDeviceInit`.
    pub const DEVICE_INIT: u8 = 0x01;
}

/// Largest descriptor a query response can carry.
pub const DESCRIPTOR_MAX_SIZE: usize = 255;

/// Reference clock frequencies accepted by the `bRefClkFreq` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RefClkFreq {
    /// 19.2 MHz.
    Mhz19_2 = 0,
    /// 26 MHz.
    Mhz26 = 1,
    /// 38.4 MHz.
    Mhz38_4 = 2,
    /// 52 MHz.
    Mhz52 = 3,
}

/// A raw descriptor as returned by the device.
///
/// The device may truncate a descriptor, so the valid prefix length is
/// carried alongside the bytes.
#[derive(Clone, Copy)]
pub struct Descriptor {
    len: u8,
    raw: [u8; DESCRIPTOR_MAX_SIZE],
}

impl Descriptor {
    /// Wraps `len` valid bytes of descriptor data.
    #[must_use]
    pub(crate) fn new(len: u8, raw: [u8; DESCRIPTOR_MAX_SIZE]) -> Self {
        Self { len, raw }
    }

    /// Returns the valid descriptor bytes.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.raw[..self.len as usize]
    }

    /// Decodes the descriptor as a device descriptor.
    pub fn device(&self) -> UfsResult<&DeviceDescriptor> {
        DeviceDescriptor::ref_from_prefix(self.bytes())
            .map(|(desc, _)| desc)
            .map_err(|_| UfsError::Protocol)
    }

    /// Decodes the descriptor as a unit descriptor.
    pub fn unit(&self) -> UfsResult<&UnitDescriptor> {
        UnitDescriptor::ref_from_prefix(self.bytes())
            .map(|(desc, _)| desc)
            .map_err(|_| UfsError::Protocol)
    }
}

/// Device descriptor (JESD220E Table 14.4).
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_idn: u8,
    pub device: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// Number of regular logical units.
    pub lu_count: u8,
    /// Number of well known logical units.
    pub wlu_count: u8,
    pub boot_enable: u8,
    pub descr_access_en: u8,
    pub init_power_mode: u8,
    pub high_priority_lun: u8,
    pub secure_removal_type: u8,
    pub security_lu: u8,
    pub background_ops_term_lat: u8,
    pub init_active_icc_level: u8,
    pub spec_version: U16<BigEndian>,
    pub manufacture_date: U16<BigEndian>,
    pub manufacturer_name: u8,
    pub product_name: u8,
    pub serial_number: u8,
    pub oem_id: u8,
    pub manufacturer_id: U16<BigEndian>,
    pub ud0_base_offset: u8,
    pub ud_config_p_length: u8,
    pub device_rtt_cap: u8,
    pub periodic_rtc_update: U16<BigEndian>,
}

/// Unit descriptor (JESD220E Table 14.12).
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct UnitDescriptor {
    pub length: u8,
    pub descriptor_idn: u8,
    pub unit_index: u8,
    /// Nonzero when the logical unit is enabled.
    pub lu_enable: u8,
    pub boot_lun_id: u8,
    pub lu_write_protect: u8,
    pub lu_queue_depth: u8,
    pub psa_sensitive: u8,
    pub memory_type: u8,
    pub data_reliability: u8,
    /// Block size as a power of two exponent.
    pub logical_block_size: u8,
    pub logical_block_count: U64<BigEndian>,
    pub erase_block_size: U32<BigEndian>,
    pub provisioning_type: u8,
    pub phy_mem_resource_count: U64<BigEndian>,
    pub context_capabilities: U16<BigEndian>,
    pub large_unit_granularity: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_sizes() {
        assert_eq!(size_of::<DeviceDescriptor>(), 31);
        assert_eq!(size_of::<UnitDescriptor>(), 35);
    }

    #[test]
    fn unit_descriptor_field_offsets() {
        let mut raw = [0u8; DESCRIPTOR_MAX_SIZE];
        raw[0] = 35;
        raw[1] = idn::UNIT;
        raw[3] = 1;
        raw[10] = 12;
        raw[11..19].copy_from_slice(&0x1_0000u64.to_be_bytes());

        let desc = Descriptor::new(35, raw);
        let unit = desc.unit().unwrap();
        assert_eq!(unit.lu_enable, 1);
        assert_eq!(unit.logical_block_size, 12);
        assert_eq!(unit.logical_block_count.get(), 0x1_0000);
    }

    #[test]
    fn device_descriptor_field_offsets() {
        let mut raw = [0u8; DESCRIPTOR_MAX_SIZE];
        raw[0] = 31;
        raw[1] = idn::DEVICE;
        raw[6] = 3;
        raw[16..18].copy_from_slice(&0x0310u16.to_be_bytes());

        let desc = Descriptor::new(31, raw);
        let device = desc.device().unwrap();
        assert_eq!(device.lu_count, 3);
        assert_eq!(device.spec_version.get(), 0x0310);
    }

    #[test]
    fn truncated_descriptor_fails_decode() {
        let desc = Descriptor::new(20, [0; DESCRIPTOR_MAX_SIZE]);
        assert!(desc.unit().is_err());
    }
}
