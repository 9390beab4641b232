//! # smartport-relay - SmartPort Block Devices over SLIP-framed Links
//!
//! The smartport-relay crate lets a host address SmartPort storage units that
//! sit behind remote device bridges as if they were local numbered devices.
//! Each bridge connects over a byte-stream link (TCP in production) and may
//! carry several chained units.
//!
//! ## Features
//!
//! - Accept bridge links and discover how many units each one carries
//! - Assign every unit a global device id and route commands to it
//! - Typed Status, ReadBlock, WriteBlock, Init and Close commands
//! - Concurrent requests on one link, correlated by sequence number
//! - Device reboot notification
//! - An in-process device simulator for testing without hardware
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smartport_relay::{
//!     BlockNumber, Listener, ReadBlockRequest, RelayConfig, Response,
//! };
//! use std::time::Duration;
//!
//! # async fn run() -> smartport_relay::error::Result<()> {
//! let listener = Listener::new(&RelayConfig::default());
//! listener.start("0.0.0.0", 1985).await?;
//!
//! let request = ReadBlockRequest::new(listener.next_sequence_number(), 1, BlockNumber::new(0)?);
//! let response = listener.call(1, request, Duration::from_secs(5)).await?;
//! if response.is_ok() {
//!     println!("first byte: {:02X}", response.block_data[0]);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod smartport;

pub use crate::config::RelayConfig;
pub use crate::error::{RelayError, Result};
pub use crate::listener::{DiskDevices, Listener, ListenerState};
pub use crate::logging::init_logger;
pub use crate::registry::{DeviceRange, DeviceRegistry};

pub use smartport::{
    Block, BlockNumber, CloseRequest, CloseResponse, Command, Connection, DeviceInfo,
    InitRequest, InitResponse, LinkState, PendingResponse, ReadBlockRequest, ReadBlockResponse,
    Request, Requestor, Response, StatusRequest, StatusResponse, UnitStatus, WriteBlockRequest,
    WriteBlockResponse,
};
pub use smartport::sim::{SimHandle, SimulatedDevice};
