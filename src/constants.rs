//! SmartPort Relay Protocol Constants
//!
//! This module defines constants used by the SmartPort-over-SLIP relay: command
//! codes, frame geometry, DIB field offsets and the timing defaults used by the
//! listener.

use std::time::Duration;

// ----------------------------------------------------------------------------
// Command codes (SmartPort numbering)
// ----------------------------------------------------------------------------

pub const SP_CMD_STATUS: u8 = 0x00;
pub const SP_CMD_READ_BLOCK: u8 = 0x01;
pub const SP_CMD_WRITE_BLOCK: u8 = 0x02;
pub const SP_CMD_INIT: u8 = 0x05;
pub const SP_CMD_CLOSE: u8 = 0x07;

// ----------------------------------------------------------------------------
// Status codes
// ----------------------------------------------------------------------------

/// Command completed
pub const SP_STATUS_OK: u8 = 0x00;

/// No device connected at the addressed unit
pub const SP_STATUS_NO_DEVICE: u8 = 0x28;

/// Unit is offline or the medium is not present
pub const SP_STATUS_OFFLINE: u8 = 0x2F;

/// Bad block number
pub const SP_STATUS_BAD_BLOCK: u8 = 0x2D;

/// Unit is write protected
pub const SP_STATUS_WRITE_PROTECTED: u8 = 0x2B;

/// Unsupported status or control code
pub const SP_STATUS_BAD_CONTROL: u8 = 0x21;

// Status selector codes
pub const SP_STATUS_CODE_STATUS: u8 = 0x00;
pub const SP_STATUS_CODE_DIB: u8 = 0x03;

// ----------------------------------------------------------------------------
// Frame geometry
// ----------------------------------------------------------------------------

/// seq + command + device id
pub const REQUEST_HEADER_SIZE: usize = 3;

/// seq + status
pub const RESPONSE_HEADER_SIZE: usize = 2;

/// Bytes in one block
pub const BLOCK_SIZE: usize = 512;

/// Bytes in a wire block number
pub const BLOCK_NUMBER_SIZE: usize = 3;

/// Largest block number that fits in three bytes
pub const MAX_BLOCK_NUMBER: u32 = 0x00FF_FFFF;

/// Out-of-band frame a device sends when it resets.
pub const REBOOT_SEQUENCE: [u8; 4] = [0xFF, 0x00, 0x00, 0xFF];

/// Never handed out by the sequence counter so correlated responses cannot
/// start like the reboot sequence.
pub const RESERVED_SEQUENCE_NUMBER: u8 = 0xFF;

// ----------------------------------------------------------------------------
// DIB (device information block) layout
// ----------------------------------------------------------------------------

pub const DIB_STATUS_OFFSET: usize = 0;
pub const DIB_BLOCK_COUNT_OFFSET: usize = 1;
pub const DIB_NAME_LENGTH_OFFSET: usize = 4;
pub const DIB_NAME_OFFSET: usize = 5;
pub const DIB_NAME_SIZE: usize = 16;
pub const DIB_TYPE_OFFSET: usize = 21;
pub const DIB_SUBTYPE_OFFSET: usize = 22;
pub const DIB_VERSION_OFFSET: usize = 23;
pub const DIB_SIZE: usize = 25;

/// Device type codes treated as disks.
pub const DISK_DEVICE_TYPES: [u8; 3] = [0x01, 0x02, 0x0A];

// ----------------------------------------------------------------------------
// Device-id space
// ----------------------------------------------------------------------------

pub const FIRST_DEVICE_ID: u8 = 1;
pub const MAX_DEVICE_ID: u8 = 254;

// ----------------------------------------------------------------------------
// Listener defaults
// ----------------------------------------------------------------------------

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 1985;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACCEPT_POLL: Duration = Duration::from_secs(2);

/// Reboot frames held for `wait_for_request` before new ones are dropped
pub const UNSOLICITED_QUEUE_DEPTH: usize = 8;
