//! Device information block (DIB) returned by a Status request with selector 3.

use crate::constants::{
    DIB_BLOCK_COUNT_OFFSET, DIB_NAME_LENGTH_OFFSET, DIB_NAME_OFFSET, DIB_NAME_SIZE, DIB_SIZE,
    DIB_STATUS_OFFSET, DIB_SUBTYPE_OFFSET, DIB_TYPE_OFFSET, DIB_VERSION_OFFSET, DISK_DEVICE_TYPES,
    MAX_BLOCK_NUMBER,
};
use crate::error::{RelayError, Result};
use bitflags::bitflags;

bitflags! {
    /// General status byte (DIB byte 0).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UnitStatus: u8 {
        const BLOCK_DEVICE    = 0b1000_0000;
        const WRITE_ALLOWED   = 0b0100_0000;
        const READ_ALLOWED    = 0b0010_0000;
        const ONLINE          = 0b0001_0000;
        const FORMAT_ALLOWED  = 0b0000_1000;
        const WRITE_PROTECTED = 0b0000_0100;
        const INTERRUPTING    = 0b0000_0010;
        const OPEN            = 0b0000_0001;
    }
}

impl UnitStatus {
    /// Flags reported by a mounted, writable block device.
    pub fn disk_online() -> Self {
        UnitStatus::BLOCK_DEVICE
            | UnitStatus::WRITE_ALLOWED
            | UnitStatus::READ_ALLOWED
            | UnitStatus::ONLINE
            | UnitStatus::FORMAT_ALLOWED
    }
}

/// Parsed device information block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub status: UnitStatus,
    pub block_count: u32,
    pub name: String,
    pub device_type: u8,
    pub subtype: u8,
    pub version: u16,
}

impl DeviceInfo {
    /// A disk of `block_count` blocks with the given name, online.
    pub fn disk(name: &str, block_count: u32) -> Self {
        DeviceInfo {
            status: UnitStatus::disk_online(),
            block_count: block_count.min(MAX_BLOCK_NUMBER),
            name: name.to_string(),
            device_type: DISK_DEVICE_TYPES[1],
            subtype: 0x20,
            version: 0x0100,
        }
    }

    pub fn is_disk(&self) -> bool {
        DISK_DEVICE_TYPES.contains(&self.device_type) && self.status.contains(UnitStatus::ONLINE)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DIB_SIZE {
            return Err(RelayError::malformed(format!(
                "device information block needs {DIB_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let name_len = (data[DIB_NAME_LENGTH_OFFSET] as usize).min(DIB_NAME_SIZE);
        let name_bytes = &data[DIB_NAME_OFFSET..DIB_NAME_OFFSET + name_len];

        Ok(DeviceInfo {
            status: UnitStatus::from_bits_retain(data[DIB_STATUS_OFFSET]),
            block_count: u32::from_le_bytes([
                data[DIB_BLOCK_COUNT_OFFSET],
                data[DIB_BLOCK_COUNT_OFFSET + 1],
                data[DIB_BLOCK_COUNT_OFFSET + 2],
                0,
            ]),
            name: String::from_utf8_lossy(name_bytes).into_owned(),
            device_type: data[DIB_TYPE_OFFSET],
            subtype: data[DIB_SUBTYPE_OFFSET],
            version: u16::from_le_bytes([data[DIB_VERSION_OFFSET], data[DIB_VERSION_OFFSET + 1]]),
        })
    }

    /// Serializes into the 25-byte wire layout; the name is truncated to 16
    /// bytes and space padded.
    pub fn encode(&self) -> Vec<u8> {
        let mut dib = vec![0u8; DIB_SIZE];
        dib[DIB_STATUS_OFFSET] = self.status.bits();
        dib[DIB_BLOCK_COUNT_OFFSET..DIB_BLOCK_COUNT_OFFSET + 3]
            .copy_from_slice(&self.block_count.to_le_bytes()[..3]);

        let name = self.name.as_bytes();
        let name_len = name.len().min(DIB_NAME_SIZE);
        dib[DIB_NAME_LENGTH_OFFSET] = name_len as u8;
        let name_field = &mut dib[DIB_NAME_OFFSET..DIB_NAME_OFFSET + DIB_NAME_SIZE];
        name_field.fill(b' ');
        name_field[..name_len].copy_from_slice(&name[..name_len]);

        dib[DIB_TYPE_OFFSET] = self.device_type;
        dib[DIB_SUBTYPE_OFFSET] = self.subtype;
        dib[DIB_VERSION_OFFSET..DIB_VERSION_OFFSET + 2].copy_from_slice(&self.version.to_le_bytes());
        dib
    }
}
