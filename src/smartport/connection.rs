//! # Relay Connection
//!
//! One physical duplex link to a device bridge. A connection owns:
//!
//! - the write half, behind an async lock so concurrent senders never
//!   interleave their frames;
//! - a background reader task that SLIP-decodes incoming bytes and hands each
//!   response to the caller waiting on its sequence number;
//! - the pending-call table, mapping outstanding sequence numbers to one-shot
//!   completion signals;
//! - a small queue of unsolicited reboot frames for [`Connection::wait_for_request`].
//!
//! The write lock and the pending-table lock are never held together.

use crate::constants::{RESERVED_SEQUENCE_NUMBER, RESPONSE_HEADER_SIZE, UNSOLICITED_QUEUE_DEPTH};
use crate::error::{RelayError, Result};
use crate::logging::log_frame_hex;
use crate::smartport::frame::is_reboot_sequence;
use crate::smartport::slip::{slip_encode, SlipDecoder};
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const READ_CHUNK_SIZE: usize = 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Constructed, reader not yet running.
    Opening,
    /// Reader running; requests can be exchanged.
    Connected,
    /// Channel ended or closed. Terminal.
    Disconnected,
}

struct PendingEntry {
    token: u64,
    tx: oneshot::Sender<Bytes>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u8, PendingEntry>,
    next_token: u64,
    closed: bool,
}

/// State shared between a connection and its reader task.
struct Shared {
    peer: String,
    pending: Mutex<PendingTable>,
    state: watch::Sender<LinkState>,
    unsolicited: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl Shared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Routes one decoded frame to its waiter, the reboot queue, or nowhere.
    fn dispatch(&self, frame: Bytes) {
        log_frame_hex("RX", &self.peer, &frame);

        if is_reboot_sequence(&frame) {
            info!("[{}] device signalled a reboot", self.peer);
            let queue = self.unsolicited.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tx) = queue.as_ref() {
                if tx.try_send(frame).is_err() {
                    warn!("[{}] reboot queue full, dropping signal", self.peer);
                }
            }
            return;
        }

        if frame.len() < RESPONSE_HEADER_SIZE {
            warn!(
                "[{}] dropping {}-byte frame, shorter than a response header",
                self.peer,
                frame.len()
            );
            return;
        }

        let sequence = frame[0];
        let entry = self.lock_pending().entries.remove(&sequence);
        match entry {
            Some(entry) => {
                // The waiter may have timed out between removal and send.
                let _ = entry.tx.send(frame);
            }
            None => debug!(
                "[{}] no caller waiting for response {}, discarding",
                self.peer, sequence
            ),
        }
    }

    /// Moves to `Disconnected` and fails everything still waiting.
    fn disconnect(&self) {
        self.state.send_replace(LinkState::Disconnected);

        let drained: Vec<PendingEntry> = {
            let mut table = self.lock_pending();
            table.closed = true;
            table.entries.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            debug!(
                "[{}] failing {} outstanding request(s)",
                self.peer,
                drained.len()
            );
        }
        // Dropping the senders wakes each waiter with a closed-channel error.
        drop(drained);

        self.unsolicited
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }
}

/// A registered expectation of one response. Dropping it removes the entry
/// from the pending-call table, so abandoned calls never leak.
pub struct PendingResponse {
    sequence: u8,
    token: u64,
    rx: oneshot::Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    pub fn sequence_number(&self) -> u8 {
        self.sequence
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let mut table = self.shared.lock_pending();
        if table
            .entries
            .get(&self.sequence)
            .is_some_and(|entry| entry.token == self.token)
        {
            table.entries.remove(&self.sequence);
        }
    }
}

/// One duplex link carrying SLIP-framed SmartPort traffic.
pub struct Connection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BoxedReader>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    unsolicited_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl Connection {
    /// Wraps any duplex byte channel. Nothing is read until [`Connection::open`].
    pub fn new<T>(io: T, peer: impl Into<String>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half): (ReadHalf<T>, WriteHalf<T>) = tokio::io::split(io);
        let (state, _) = watch::channel(LinkState::Opening);
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel(UNSOLICITED_QUEUE_DEPTH);

        Connection {
            shared: Arc::new(Shared {
                peer: peer.into(),
                pending: Mutex::new(PendingTable::default()),
                state,
                unsolicited: Mutex::new(Some(unsolicited_tx)),
            }),
            writer: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            reader: Mutex::new(Some(Box::new(read_half))),
            reader_task: Mutex::new(None),
            unsolicited_rx: tokio::sync::Mutex::new(unsolicited_rx),
        }
    }

    /// Wraps an accepted TCP stream, labelled with its peer address.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown-peer".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{peer}] could not disable Nagle: {e}");
        }
        Connection::new(stream, peer)
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Number of calls currently registered in the pending-call table.
    pub fn pending_count(&self) -> usize {
        self.shared.lock_pending().entries.len()
    }

    /// Starts the background reader. Calling it again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self) -> Result<()> {
        let mut task = self.reader_task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return Ok(());
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(RelayError::Closed)?;

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(read_loop(shared, reader)));
        Ok(())
    }

    /// Waits until the link leaves `Opening`, failing after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s != LinkState::Opening),
        )
        .await
        .map_err(|_| RelayError::HandshakeTimeout(timeout))?;

        match settled.map(|s| *s) {
            Ok(LinkState::Connected) => Ok(()),
            _ => Err(RelayError::Closed),
        }
    }

    /// Registers interest in the response tagged `sequence`. Must be called
    /// before the request is sent so a fast reply cannot be missed.
    pub fn expect_response(&self, sequence: u8) -> Result<PendingResponse> {
        if sequence == RESERVED_SEQUENCE_NUMBER {
            return Err(RelayError::ReservedSequence(sequence));
        }

        let (tx, rx) = oneshot::channel();
        let mut table = self.shared.lock_pending();
        if table.closed {
            return Err(RelayError::Closed);
        }
        if table.entries.contains_key(&sequence) {
            return Err(RelayError::DuplicateSequence(sequence));
        }
        let token = table.next_token;
        table.next_token = table.next_token.wrapping_add(1);
        table.entries.insert(sequence, PendingEntry { token, tx });

        Ok(PendingResponse {
            sequence,
            token,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Sends one encoded frame. Concurrent senders are serialized.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.state() == LinkState::Disconnected {
            return Err(RelayError::Closed);
        }
        log_frame_hex("TX", self.peer(), frame);
        let encoded = slip_encode(frame);

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(RelayError::Closed)?;
        let written = async {
            writer.write_all(&encoded).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| {
            warn!("[{}] write failed: {e}", self.peer());
            RelayError::Closed
        })
    }

    /// Waits for the response registered by `pending`, returning the raw
    /// frame (header and payload).
    pub async fn wait_for_response(
        &self,
        mut pending: PendingResponse,
        timeout: Duration,
    ) -> Result<Bytes> {
        match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                debug!(
                    "[{}] request {} timed out after {timeout:?}",
                    self.peer(),
                    pending.sequence
                );
                Err(RelayError::Timeout {
                    sequence: pending.sequence,
                    waited: timeout,
                })
            }
        }
    }

    /// Waits for an unsolicited frame from the device (the reboot sequence).
    pub async fn wait_for_request(&self, timeout: Duration) -> Result<Bytes> {
        let mut rx = self.unsolicited_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(RelayError::Closed),
            Err(_) => Err(RelayError::Timeout {
                sequence: RESERVED_SEQUENCE_NUMBER,
                waited: timeout,
            }),
        }
    }

    /// Closes the channel, fails every waiter with `Closed`, and joins the reader.
    pub async fn close(&self) {
        self.shared.disconnect();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("[{}] shutdown: {e}", self.peer());
            }
        }

        // A never-opened connection still owns its read half.
        self.reader.lock().unwrap_or_else(|p| p.into_inner()).take();

        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("[{}] reader task ended abnormally: {e}", self.peer());
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader_task
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: BoxedReader) {
    let mut state = shared.state.subscribe();
    let opening = *state.borrow_and_update() == LinkState::Opening;
    if opening {
        shared.state.send_replace(LinkState::Connected);
    }
    debug!("[{}] reader started", shared.peer);

    let mut decoder = SlipDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = state.wait_for(|s| *s == LinkState::Disconnected) => break,
        };

        match read {
            Ok(0) => {
                info!("[{}] link closed by peer", shared.peer);
                break;
            }
            Ok(n) => {
                for frame in decoder.feed(&buf[..n]) {
                    match frame {
                        Ok(frame) => shared.dispatch(frame),
                        Err(e) => warn!("[{}] {e}", shared.peer),
                    }
                }
            }
            Err(e) => {
                warn!("[{}] read failed: {e}", shared.peer);
                break;
            }
        }
    }

    if decoder.pending_len() > 0 {
        debug!(
            "[{}] discarding {} bytes of an unfinished frame",
            shared.peer,
            decoder.pending_len()
        );
    }
    shared.disconnect();
    debug!("[{}] reader stopped", shared.peer);
}
