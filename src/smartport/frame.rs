//! # SmartPort Frame Codec
//!
//! Byte layout shared by every command. A request frame starts with
//! `seq, command, device_id`; a response frame starts with `seq, status`.
//! Everything after the header is command-specific and handled in
//! [`super::command`]. Parsing uses `nom` over complete input: a frame that
//! runs out of bytes is malformed, never "incomplete", because SLIP has
//! already delimited it.

use crate::constants::{
    BLOCK_NUMBER_SIZE, BLOCK_SIZE, MAX_BLOCK_NUMBER, REBOOT_SEQUENCE, REQUEST_HEADER_SIZE,
    RESPONSE_HEADER_SIZE,
};
use crate::error::{RelayError, Result};
use bytes::{BufMut, BytesMut};
use nom::bytes::complete::take;
use nom::number::complete::{be_u8, le_u16};
use nom::IResult;
use std::fmt;

/// One block of device data.
pub type Block = Box<[u8; BLOCK_SIZE]>;

/// A zero-filled block.
pub fn empty_block() -> Block {
    Box::new([0u8; BLOCK_SIZE])
}

/// Copies exactly one block out of `data`.
pub fn block_from_slice(data: &[u8]) -> Result<Block> {
    let boxed: Box<[u8]> = data.into();
    boxed
        .try_into()
        .map_err(|rejected: Box<[u8]>| RelayError::InvalidBlockData(rejected.len()))
}

/// 24-bit block address, stored in wire order (low, middle, high).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlockNumber([u8; BLOCK_NUMBER_SIZE]);

impl BlockNumber {
    pub fn new(block: u32) -> Result<Self> {
        if block > MAX_BLOCK_NUMBER {
            return Err(RelayError::InvalidBlockNumber(block));
        }
        let [l, m, h, _] = block.to_le_bytes();
        Ok(BlockNumber([l, m, h]))
    }

    pub const fn from_bytes(l: u8, m: u8, h: u8) -> Self {
        BlockNumber([l, m, h])
    }

    pub fn value(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], 0])
    }

    pub fn to_bytes(self) -> [u8; BLOCK_NUMBER_SIZE] {
        self.0
    }
}

impl TryFrom<u32> for BlockNumber {
    type Error = RelayError;

    fn try_from(block: u32) -> Result<Self> {
        BlockNumber::new(block)
    }
}

impl fmt::Debug for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockNumber({})", self.value())
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// The three bytes every request frame starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub sequence_number: u8,
    pub command: u8,
    pub device_id: u8,
}

impl RequestHeader {
    pub fn write(&self, out: &mut BytesMut) {
        out.reserve(REQUEST_HEADER_SIZE);
        out.put_u8(self.sequence_number);
        out.put_u8(self.command);
        out.put_u8(self.device_id);
    }
}

/// The two bytes every response frame starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub sequence_number: u8,
    pub status: u8,
}

impl ResponseHeader {
    pub fn write(&self, out: &mut BytesMut) {
        out.reserve(RESPONSE_HEADER_SIZE);
        out.put_u8(self.sequence_number);
        out.put_u8(self.status);
    }
}

pub fn parse_request_header(input: &[u8]) -> IResult<&[u8], RequestHeader> {
    let (input, sequence_number) = be_u8(input)?;
    let (input, command) = be_u8(input)?;
    let (input, device_id) = be_u8(input)?;
    Ok((
        input,
        RequestHeader {
            sequence_number,
            command,
            device_id,
        },
    ))
}

pub fn parse_response_header(input: &[u8]) -> IResult<&[u8], ResponseHeader> {
    let (input, sequence_number) = be_u8(input)?;
    let (input, status) = be_u8(input)?;
    Ok((
        input,
        ResponseHeader {
            sequence_number,
            status,
        },
    ))
}

/// Parses the Status selector byte.
pub fn parse_status_code(input: &[u8]) -> IResult<&[u8], u8> {
    be_u8(input)
}

pub fn parse_block_number(input: &[u8]) -> IResult<&[u8], BlockNumber> {
    let (input, bytes) = take(BLOCK_NUMBER_SIZE)(input)?;
    Ok((input, BlockNumber::from_bytes(bytes[0], bytes[1], bytes[2])))
}

/// Parses the little-endian block size that prefixes write payloads.
pub fn parse_block_size(input: &[u8]) -> IResult<&[u8], u16> {
    le_u16(input)
}

pub fn parse_block(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take(BLOCK_SIZE)(input)
}

/// Decodes a response header, failing with `MalformedFrame` below two bytes.
pub fn decode_response_header(data: &[u8]) -> Result<(&[u8], ResponseHeader)> {
    if data.len() < RESPONSE_HEADER_SIZE {
        return Err(RelayError::malformed(format!(
            "response needs {RESPONSE_HEADER_SIZE} header bytes, got {}",
            data.len()
        )));
    }
    Ok(parse_response_header(data)?)
}

/// Decodes a request header, failing with `MalformedFrame` below three bytes.
pub fn decode_request_header(data: &[u8]) -> Result<(&[u8], RequestHeader)> {
    if data.len() < REQUEST_HEADER_SIZE {
        return Err(RelayError::malformed(format!(
            "request needs {REQUEST_HEADER_SIZE} header bytes, got {}",
            data.len()
        )));
    }
    Ok(parse_request_header(data)?)
}

/// True if the frame is the device reset signal rather than a response.
pub fn is_reboot_sequence(frame: &[u8]) -> bool {
    frame == REBOOT_SEQUENCE
}
