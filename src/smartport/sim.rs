//! Simulated device bridge
//!
//! Serves a chain of SmartPort units over any duplex channel, speaking the same
//! SLIP-framed protocol as real hardware. Used by the integration tests and by
//! `sprelay simulate` to exercise a relay without hardware.

use crate::constants::{
    REBOOT_SEQUENCE, SP_STATUS_BAD_BLOCK, SP_STATUS_BAD_CONTROL, SP_STATUS_CODE_DIB,
    SP_STATUS_CODE_STATUS, SP_STATUS_NO_DEVICE, SP_STATUS_OFFLINE, SP_STATUS_OK,
    SP_STATUS_WRITE_PROTECTED,
};
use crate::error::{RelayError, Result};
use crate::smartport::command::{
    CloseResponse, Command, InitResponse, ReadBlockResponse, Response, StatusResponse,
    WriteBlockResponse,
};
use crate::smartport::dib::{DeviceInfo, UnitStatus};
use crate::smartport::frame::{empty_block, Block};
use crate::smartport::slip::{slip_encode, SlipDecoder};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// One unit on the simulated chain.
#[derive(Debug, Clone)]
pub struct SimulatedUnit {
    pub info: DeviceInfo,
    blocks: HashMap<u32, Block>,
}

impl SimulatedUnit {
    pub fn new(info: DeviceInfo) -> Self {
        SimulatedUnit {
            info,
            blocks: HashMap::new(),
        }
    }
}

/// A chain of units behind one link.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    units: Vec<SimulatedUnit>,
    silent_units: HashSet<u8>,
    reply_delays: HashMap<u8, Duration>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` online 140K disks named `SIM_DISK_<n>`.
    pub fn with_disks(count: usize) -> Self {
        (1..=count).fold(Self::new(), |device, n| {
            device.add_unit(DeviceInfo::disk(&format!("SIM_DISK_{n}"), 280))
        })
    }

    pub fn add_unit(mut self, info: DeviceInfo) -> Self {
        self.units.push(SimulatedUnit::new(info));
        self
    }

    /// Requests addressed to `unit` are swallowed without a reply.
    pub fn silent_unit(mut self, unit: u8) -> Self {
        self.silent_units.insert(unit);
        self
    }

    /// Replies for `unit` are held back by `delay`.
    pub fn reply_delay(mut self, unit: u8, delay: Duration) -> Self {
        self.reply_delays.insert(unit, delay);
        self
    }

    fn unit_mut(&mut self, unit: u8) -> Option<&mut SimulatedUnit> {
        let index = (unit as usize).checked_sub(1)?;
        self.units.get_mut(index)
    }

    /// Produces the encoded reply for one request, or `None` if the unit is silent.
    pub fn handle(&mut self, command: &Command) -> Option<Vec<u8>> {
        let unit_id = command.device_id();
        if self.silent_units.contains(&unit_id) {
            return None;
        }
        let seq = command.sequence_number();
        let Some(unit) = self.unit_mut(unit_id) else {
            return Some(no_device_reply(command));
        };

        let reply = match command {
            Command::Init(_) => InitResponse::new(seq, SP_STATUS_OK).encode(),
            Command::Close(_) => CloseResponse::new(seq, SP_STATUS_OK).encode(),
            Command::Status(request) => match request.status_code {
                SP_STATUS_CODE_DIB => {
                    StatusResponse::new(seq, SP_STATUS_OK, unit.info.encode()).encode()
                }
                SP_STATUS_CODE_STATUS => {
                    let mut data = vec![unit.info.status.bits()];
                    data.extend_from_slice(&unit.info.block_count.to_le_bytes()[..3]);
                    StatusResponse::new(seq, SP_STATUS_OK, data).encode()
                }
                _ => StatusResponse::new(seq, SP_STATUS_BAD_CONTROL, Vec::new()).encode(),
            },
            Command::ReadBlock(request) => {
                let block = request.block_number.value();
                if !unit.info.status.contains(UnitStatus::ONLINE) {
                    ReadBlockResponse::failed(seq, SP_STATUS_OFFLINE).encode()
                } else if block >= unit.info.block_count {
                    ReadBlockResponse::failed(seq, SP_STATUS_BAD_BLOCK).encode()
                } else {
                    let data = unit.blocks.get(&block).cloned().unwrap_or_else(empty_block);
                    ReadBlockResponse::new(seq, SP_STATUS_OK, data).encode()
                }
            }
            Command::WriteBlock(request) => {
                let block = request.block_number.value();
                let status = if !unit.info.status.contains(UnitStatus::ONLINE) {
                    SP_STATUS_OFFLINE
                } else if unit.info.status.contains(UnitStatus::WRITE_PROTECTED)
                    || !unit.info.status.contains(UnitStatus::WRITE_ALLOWED)
                {
                    SP_STATUS_WRITE_PROTECTED
                } else if block >= unit.info.block_count {
                    SP_STATUS_BAD_BLOCK
                } else {
                    unit.blocks.insert(block, request.block_data.clone());
                    SP_STATUS_OK
                };
                WriteBlockResponse::new(seq, status).encode()
            }
        };
        Some(reply)
    }

    /// Serves requests arriving on `io` until the peer hangs up.
    pub fn spawn<T>(self, io: T) -> SimHandle
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(io);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
        let device = Arc::new(Mutex::new(self));

        let task = {
            let device = Arc::clone(&device);
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                let mut decoder = SlipDecoder::new();
                let mut buf = vec![0u8; 1024];
                loop {
                    let n = match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    for frame in decoder.feed(&buf[..n]) {
                        let command = match frame.and_then(|f| Command::decode(&f)) {
                            Ok(command) => command,
                            Err(e) => {
                                warn!("simulated device ignoring frame: {e}");
                                continue;
                            }
                        };
                        let (reply, delay) = {
                            let mut device = device.lock().unwrap_or_else(|p| p.into_inner());
                            let delay = device.reply_delays.get(&command.device_id()).copied();
                            (device.handle(&command), delay)
                        };
                        let Some(reply) = reply else {
                            debug!("simulated unit {} stays silent", command.device_id());
                            continue;
                        };
                        match delay {
                            Some(delay) => {
                                let writer = Arc::clone(&writer);
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = write_frame(&writer, &reply).await;
                                });
                            }
                            None => {
                                if write_frame(&writer, &reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                debug!("simulated device link closed");
            })
        };

        SimHandle {
            device,
            writer,
            task,
        }
    }
}

fn no_device_reply(command: &Command) -> Vec<u8> {
    let seq = command.sequence_number();
    match command {
        Command::ReadBlock(_) => ReadBlockResponse::failed(seq, SP_STATUS_NO_DEVICE).encode(),
        _ => InitResponse::new(seq, SP_STATUS_NO_DEVICE).encode(),
    }
}

async fn write_frame(writer: &SharedWriter, frame: &[u8]) -> Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(&slip_encode(frame)).await?;
    writer.flush().await.map_err(RelayError::from)
}

/// Running simulator.
pub struct SimHandle {
    device: Arc<Mutex<SimulatedDevice>>,
    writer: SharedWriter,
    task: JoinHandle<()>,
}

impl SimHandle {
    /// Sends the out-of-band reboot sequence.
    pub async fn send_reboot(&self) -> Result<()> {
        write_frame(&self.writer, &REBOOT_SEQUENCE).await
    }

    /// Contents of a block written through the link, if any.
    pub fn block(&self, unit: u8, block: u32) -> Option<Block> {
        let mut device = self.device.lock().unwrap_or_else(|p| p.into_inner());
        device.unit_mut(unit)?.blocks.get(&block).cloned()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the peer to hang up.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.writer.lock().await.shutdown().await;
    }
}
