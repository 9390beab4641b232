//! Sequence numbering and the synchronous request/response round trip.

use crate::constants::RESERVED_SEQUENCE_NUMBER;
use crate::error::Result;
use crate::smartport::command::Request;
use crate::smartport::connection::Connection;
use log::debug;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

static GLOBAL_REQUESTOR: Lazy<Arc<Requestor>> = Lazy::new(|| Arc::new(Requestor::new()));

/// Hands out sequence numbers and runs round trips over a [`Connection`].
///
/// Sequence numbers wrap through `0x00..=0xFE`; `0xFF` is never issued because
/// a response starting with it could be mistaken for the reboot sequence.
#[derive(Debug, Default)]
pub struct Requestor {
    next_sequence: AtomicU8,
}

impl Requestor {
    pub const fn new() -> Self {
        Requestor {
            next_sequence: AtomicU8::new(0),
        }
    }

    /// The process-wide requestor. Tests that need an isolated counter build
    /// their own with [`Requestor::new`].
    pub fn global() -> Arc<Requestor> {
        Arc::clone(&GLOBAL_REQUESTOR)
    }

    pub fn next_sequence_number(&self) -> u8 {
        self.next_sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(Self::successor(current))
            })
            .unwrap_or_else(|current| current)
    }

    fn successor(current: u8) -> u8 {
        let next = current.wrapping_add(1);
        if next == RESERVED_SEQUENCE_NUMBER {
            0
        } else {
            next
        }
    }

    /// Sends `request` and waits up to `timeout` for its typed response.
    ///
    /// `Timeout`, `Closed` and `MalformedFrame` reach the caller unchanged;
    /// nothing is retried here.
    pub async fn send_request<R: Request>(
        request: &R,
        connection: &Connection,
        timeout: Duration,
    ) -> Result<R::Response> {
        let frame = request.encode();
        let pending = connection.expect_response(request.sequence_number())?;
        connection.send(&frame).await?;
        let reply = connection.wait_for_response(pending, timeout).await?;
        debug!(
            "[{}] request {} (cmd 0x{:02X}, unit {}) answered with {} bytes",
            connection.peer(),
            request.sequence_number(),
            R::COMMAND,
            request.device_id(),
            reply.len()
        );
        request.decode_response(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_increase() {
        let requestor = Requestor::new();
        assert_eq!(requestor.next_sequence_number(), 0);
        assert_eq!(requestor.next_sequence_number(), 1);
        assert_eq!(requestor.next_sequence_number(), 2);
    }

    #[test]
    fn test_sequence_numbers_wrap_without_reserved_value() {
        let requestor = Requestor::new();
        let issued: Vec<u8> = (0..600).map(|_| requestor.next_sequence_number()).collect();
        assert!(!issued.contains(&RESERVED_SEQUENCE_NUMBER));
        assert_eq!(issued[254], 0xFE);
        assert_eq!(issued[255], 0x00);
    }

    #[test]
    fn test_global_requestor_is_shared() {
        assert!(Arc::ptr_eq(&Requestor::global(), &Requestor::global()));
    }
}
