//! # SLIP Link Framing
//!
//! Frames travel over the byte stream delimited per RFC 1055. Encoding wraps a
//! frame in `END` bytes and escapes any `END`/`ESC` inside it. Decoding is
//! streaming: the reader hands over whatever chunk the channel produced and
//! gets back every frame that chunk completed, with partial frames buffered
//! until the next call.

use crate::error::RelayError;
use bytes::{BufMut, Bytes, BytesMut};

pub const SLIP_END: u8 = 0xC0;
pub const SLIP_ESC: u8 = 0xDB;
pub const SLIP_ESC_END: u8 = 0xDC;
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Largest decoded frame accepted before the decoder gives up on it.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Wraps `frame` in SLIP delimiters, escaping reserved bytes.
pub fn slip_encode(frame: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(frame.len() + frame.len() / 8 + 2);
    out.put_u8(SLIP_END);
    for &byte in frame {
        match byte {
            SLIP_END => out.put_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.put_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            _ => out.put_u8(byte),
        }
    }
    out.put_u8(SLIP_END);
    out.freeze()
}

/// Streaming SLIP decoder.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buffer: BytesMut,
    escaping: bool,
    /// Set when the frame in progress is already known to be bad; the rest of
    /// it is skipped up to the next END.
    corrupt: Option<String>,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of received bytes, returning every frame it completed.
    ///
    /// A frame with an invalid escape or one that outgrows [`MAX_FRAME_SIZE`]
    /// is reported once as `MalformedFrame` when its closing END arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Bytes, RelayError>> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if let Some(frame) = self.push(byte) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes of the frame currently being assembled.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn push(&mut self, byte: u8) -> Option<Result<Bytes, RelayError>> {
        if byte == SLIP_END {
            self.escaping = false;
            if let Some(reason) = self.corrupt.take() {
                self.buffer.clear();
                return Some(Err(RelayError::MalformedFrame(reason)));
            }
            if self.buffer.is_empty() {
                return None;
            }
            return Some(Ok(self.buffer.split().freeze()));
        }

        if self.corrupt.is_some() {
            return None;
        }

        let decoded = if self.escaping {
            self.escaping = false;
            match byte {
                SLIP_ESC_END => SLIP_END,
                SLIP_ESC_ESC => SLIP_ESC,
                other => {
                    self.corrupt = Some(format!("invalid SLIP escape 0x{other:02X}"));
                    return None;
                }
            }
        } else if byte == SLIP_ESC {
            self.escaping = true;
            return None;
        } else {
            byte
        };

        if self.buffer.len() >= MAX_FRAME_SIZE {
            self.corrupt = Some(format!("frame exceeds {MAX_FRAME_SIZE} bytes"));
            return None;
        }
        self.buffer.put_u8(decoded);
        None
    }
}
