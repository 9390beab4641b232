//! # SmartPort Commands
//!
//! Typed request/response pairs. Every request type names the response type it
//! expects through [`Request::Response`], so the transport never has to work out
//! at runtime what kind of reply it received.
//!
//! | Request    | Payload                                    | Response payload      |
//! |------------|--------------------------------------------|-----------------------|
//! | Init       | none                                       | none                  |
//! | Status     | selector(1)                                | status / DIB bytes    |
//! | ReadBlock  | block number(3)                            | block(512)            |
//! | WriteBlock | block size(2, LE), block number(3), block  | none                  |
//! | Close      | none                                       | none                  |

use crate::constants::{
    BLOCK_SIZE, DISK_DEVICE_TYPES, SP_CMD_CLOSE, SP_CMD_INIT, SP_CMD_READ_BLOCK, SP_CMD_STATUS,
    SP_CMD_WRITE_BLOCK, SP_STATUS_OK,
};
use crate::error::{RelayError, Result};
use crate::smartport::dib::{DeviceInfo, UnitStatus};
use crate::smartport::frame::{
    block_from_slice, decode_request_header, decode_response_header, empty_block, parse_block,
    parse_block_number, parse_block_size, parse_status_code, Block, BlockNumber, RequestHeader,
    ResponseHeader,
};
use bytes::{BufMut, BytesMut};

/// A reply from a device. A nonzero status is a device-level failure and still
/// decodes successfully.
pub trait Response: Sized + Send + std::fmt::Debug {
    fn sequence_number(&self) -> u8;

    fn status(&self) -> u8;

    fn is_ok(&self) -> bool {
        self.status() == SP_STATUS_OK
    }

    fn decode(data: &[u8]) -> Result<Self>;

    fn encode(&self) -> Vec<u8>;
}

/// A command addressed to one unit on a link.
pub trait Request: Sized + Send + Sync + std::fmt::Debug {
    type Response: Response;

    const COMMAND: u8;

    fn sequence_number(&self) -> u8;

    fn device_id(&self) -> u8;

    /// Retargets the request, e.g. from a global device id to the unit id the
    /// device knows itself by.
    fn set_device_id(&mut self, device_id: u8);

    fn encode_payload(&self, out: &mut BytesMut);

    fn decode_payload(header: RequestHeader, payload: &[u8]) -> Result<Self>;

    fn header(&self) -> RequestHeader {
        RequestHeader {
            sequence_number: self.sequence_number(),
            command: Self::COMMAND,
            device_id: self.device_id(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        self.header().write(&mut out);
        self.encode_payload(&mut out);
        out.to_vec()
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let (payload, header) = decode_request_header(data)?;
        if header.command != Self::COMMAND {
            return Err(RelayError::malformed(format!(
                "expected command 0x{:02X}, got 0x{:02X}",
                Self::COMMAND,
                header.command
            )));
        }
        Self::decode_payload(header, payload)
    }

    fn decode_response(&self, data: &[u8]) -> Result<Self::Response> {
        Self::Response::decode(data)
    }
}

fn encode_status_only(sequence_number: u8, status: u8) -> Vec<u8> {
    let mut out = BytesMut::new();
    ResponseHeader {
        sequence_number,
        status,
    }
    .write(&mut out);
    out.to_vec()
}

macro_rules! status_only_response {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub sequence_number: u8,
            pub status: u8,
        }

        impl $name {
            pub fn new(sequence_number: u8, status: u8) -> Self {
                Self { sequence_number, status }
            }
        }

        impl Response for $name {
            fn sequence_number(&self) -> u8 {
                self.sequence_number
            }

            fn status(&self) -> u8 {
                self.status
            }

            fn decode(data: &[u8]) -> Result<Self> {
                let (_, header) = decode_response_header(data)?;
                Ok(Self::new(header.sequence_number, header.status))
            }

            fn encode(&self) -> Vec<u8> {
                encode_status_only(self.sequence_number, self.status)
            }
        }
    };
}

macro_rules! header_only_request {
    ($(#[$doc:meta])* $name:ident, $response:ident, $command:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub sequence_number: u8,
            pub device_id: u8,
        }

        impl $name {
            pub fn new(sequence_number: u8, device_id: u8) -> Self {
                Self { sequence_number, device_id }
            }
        }

        impl Request for $name {
            type Response = $response;

            const COMMAND: u8 = $command;

            fn sequence_number(&self) -> u8 {
                self.sequence_number
            }

            fn device_id(&self) -> u8 {
                self.device_id
            }

            fn set_device_id(&mut self, device_id: u8) {
                self.device_id = device_id;
            }

            fn encode_payload(&self, _out: &mut BytesMut) {}

            fn decode_payload(header: RequestHeader, _payload: &[u8]) -> Result<Self> {
                Ok(Self::new(header.sequence_number, header.device_id))
            }
        }
    };
}

status_only_response!(
    /// Status 0 means the probed unit exists.
    InitResponse
);
status_only_response!(WriteBlockResponse);
status_only_response!(CloseResponse);

header_only_request!(
    /// Probes (and resets) one unit. Used by discovery to count units on a link.
    InitRequest,
    InitResponse,
    SP_CMD_INIT
);
header_only_request!(CloseRequest, CloseResponse, SP_CMD_CLOSE);

// ----------------------------------------------------------------------------
// Status
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest {
    pub sequence_number: u8,
    pub device_id: u8,
    pub status_code: u8,
}

impl StatusRequest {
    pub fn new(sequence_number: u8, device_id: u8, status_code: u8) -> Self {
        Self {
            sequence_number,
            device_id,
            status_code,
        }
    }
}

impl Request for StatusRequest {
    type Response = StatusResponse;

    const COMMAND: u8 = SP_CMD_STATUS;

    fn sequence_number(&self) -> u8 {
        self.sequence_number
    }

    fn device_id(&self) -> u8 {
        self.device_id
    }

    fn set_device_id(&mut self, device_id: u8) {
        self.device_id = device_id;
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_u8(self.status_code);
    }

    fn decode_payload(header: RequestHeader, payload: &[u8]) -> Result<Self> {
        let (_, status_code) = parse_status_code(payload)?;
        Ok(Self::new(header.sequence_number, header.device_id, status_code))
    }
}

/// Status reply; `data` is everything after the header, a DIB for selector 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub sequence_number: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

impl StatusResponse {
    pub fn new(sequence_number: u8, status: u8, data: Vec<u8>) -> Self {
        Self {
            sequence_number,
            status,
            data,
        }
    }

    pub fn unit_status(&self) -> Option<UnitStatus> {
        self.data.first().map(|&b| UnitStatus::from_bits_retain(b))
    }

    pub fn device_type(&self) -> Option<u8> {
        self.data.get(crate::constants::DIB_TYPE_OFFSET).copied()
    }

    /// Disk type code at byte 21 and the online bit set in byte 0.
    pub fn is_online_disk(&self) -> bool {
        match (self.device_type(), self.unit_status()) {
            (Some(kind), Some(flags)) => {
                DISK_DEVICE_TYPES.contains(&kind) && flags.contains(UnitStatus::ONLINE)
            }
            _ => false,
        }
    }

    pub fn device_info(&self) -> Result<DeviceInfo> {
        DeviceInfo::parse(&self.data)
    }
}

impl Response for StatusResponse {
    fn sequence_number(&self) -> u8 {
        self.sequence_number
    }

    fn status(&self) -> u8 {
        self.status
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let (payload, header) = decode_response_header(data)?;
        Ok(Self::new(header.sequence_number, header.status, payload.to_vec()))
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = encode_status_only(self.sequence_number, self.status);
        out.extend_from_slice(&self.data);
        out
    }
}

// ----------------------------------------------------------------------------
// ReadBlock
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlockRequest {
    pub sequence_number: u8,
    pub device_id: u8,
    pub block_number: BlockNumber,
}

impl ReadBlockRequest {
    pub fn new(sequence_number: u8, device_id: u8, block_number: BlockNumber) -> Self {
        Self {
            sequence_number,
            device_id,
            block_number,
        }
    }
}

impl Request for ReadBlockRequest {
    type Response = ReadBlockResponse;

    const COMMAND: u8 = SP_CMD_READ_BLOCK;

    fn sequence_number(&self) -> u8 {
        self.sequence_number
    }

    fn device_id(&self) -> u8 {
        self.device_id
    }

    fn set_device_id(&mut self, device_id: u8) {
        self.device_id = device_id;
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_slice(&self.block_number.to_bytes());
    }

    fn decode_payload(header: RequestHeader, payload: &[u8]) -> Result<Self> {
        let (_, block_number) = parse_block_number(payload)?;
        Ok(Self::new(header.sequence_number, header.device_id, block_number))
    }
}

/// Read reply. The wire shape is fixed: header plus exactly one block, even
/// when the status reports a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlockResponse {
    pub sequence_number: u8,
    pub status: u8,
    pub block_data: Block,
}

impl ReadBlockResponse {
    pub fn new(sequence_number: u8, status: u8, block_data: Block) -> Self {
        Self {
            sequence_number,
            status,
            block_data,
        }
    }

    /// Failure reply with a zero-filled block.
    pub fn failed(sequence_number: u8, status: u8) -> Self {
        Self::new(sequence_number, status, empty_block())
    }
}

impl Response for ReadBlockResponse {
    fn sequence_number(&self) -> u8 {
        self.sequence_number
    }

    fn status(&self) -> u8 {
        self.status
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let (payload, header) = decode_response_header(data)?;
        if payload.len() != BLOCK_SIZE {
            return Err(RelayError::malformed(format!(
                "read block response carries {} data bytes, expected {BLOCK_SIZE}",
                payload.len()
            )));
        }
        let (_, block) = parse_block(payload)?;
        Ok(Self::new(
            header.sequence_number,
            header.status,
            block_from_slice(block)?,
        ))
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = encode_status_only(self.sequence_number, self.status);
        out.extend_from_slice(&self.block_data[..]);
        out
    }
}

// ----------------------------------------------------------------------------
// WriteBlock
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBlockRequest {
    pub sequence_number: u8,
    pub device_id: u8,
    pub block_number: BlockNumber,
    pub block_data: Block,
}

impl WriteBlockRequest {
    pub fn new(
        sequence_number: u8,
        device_id: u8,
        block_number: BlockNumber,
        block_data: Block,
    ) -> Self {
        Self {
            sequence_number,
            device_id,
            block_number,
            block_data,
        }
    }

    /// Builds a write from a slice, which must hold exactly one block.
    pub fn from_slice(
        sequence_number: u8,
        device_id: u8,
        block_number: BlockNumber,
        data: &[u8],
    ) -> Result<Self> {
        Ok(Self::new(
            sequence_number,
            device_id,
            block_number,
            block_from_slice(data)?,
        ))
    }

    pub fn block_size(&self) -> u16 {
        BLOCK_SIZE as u16
    }
}

impl Request for WriteBlockRequest {
    type Response = WriteBlockResponse;

    const COMMAND: u8 = SP_CMD_WRITE_BLOCK;

    fn sequence_number(&self) -> u8 {
        self.sequence_number
    }

    fn device_id(&self) -> u8 {
        self.device_id
    }

    fn set_device_id(&mut self, device_id: u8) {
        self.device_id = device_id;
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        out.reserve(2 + 3 + BLOCK_SIZE);
        out.put_u16_le(self.block_size());
        out.put_slice(&self.block_number.to_bytes());
        out.put_slice(&self.block_data[..]);
    }

    fn decode_payload(header: RequestHeader, payload: &[u8]) -> Result<Self> {
        let (rest, block_size) = parse_block_size(payload)?;
        if block_size as usize != BLOCK_SIZE {
            return Err(RelayError::InvalidBlockData(block_size as usize));
        }
        let (rest, block_number) = parse_block_number(rest)?;
        let (_, block) = parse_block(rest)?;
        Self::from_slice(header.sequence_number, header.device_id, block_number, block)
    }
}

// ----------------------------------------------------------------------------
// Tagged request, for the device side of a link
// ----------------------------------------------------------------------------

/// Any request frame, decoded by its command code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status(StatusRequest),
    ReadBlock(ReadBlockRequest),
    WriteBlock(WriteBlockRequest),
    Init(InitRequest),
    Close(CloseRequest),
}

impl Command {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (payload, header) = decode_request_header(data)?;
        let command = match header.command {
            SP_CMD_STATUS => Command::Status(StatusRequest::decode_payload(header, payload)?),
            SP_CMD_READ_BLOCK => {
                Command::ReadBlock(ReadBlockRequest::decode_payload(header, payload)?)
            }
            SP_CMD_WRITE_BLOCK => {
                Command::WriteBlock(WriteBlockRequest::decode_payload(header, payload)?)
            }
            SP_CMD_INIT => Command::Init(InitRequest::decode_payload(header, payload)?),
            SP_CMD_CLOSE => Command::Close(CloseRequest::decode_payload(header, payload)?),
            other => {
                return Err(RelayError::malformed(format!(
                    "unknown command 0x{other:02X}"
                )))
            }
        };
        Ok(command)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Status(r) => r.encode(),
            Command::ReadBlock(r) => r.encode(),
            Command::WriteBlock(r) => r.encode(),
            Command::Init(r) => r.encode(),
            Command::Close(r) => r.encode(),
        }
    }

    pub fn header(&self) -> RequestHeader {
        match self {
            Command::Status(r) => r.header(),
            Command::ReadBlock(r) => r.header(),
            Command::WriteBlock(r) => r.header(),
            Command::Init(r) => r.header(),
            Command::Close(r) => r.header(),
        }
    }

    pub fn sequence_number(&self) -> u8 {
        self.header().sequence_number
    }

    pub fn device_id(&self) -> u8 {
        self.header().device_id
    }
}
