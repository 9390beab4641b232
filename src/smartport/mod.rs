//! The smartport module contains the link-level pieces of the relay: SLIP
//! framing, the command codec, the per-link connection with its reader task,
//! and the request/response round trip.

pub mod command;
pub mod connection;
pub mod dib;
pub mod frame;
pub mod requestor;
pub mod sim;
pub mod slip;

pub use command::{
    CloseRequest, CloseResponse, Command, InitRequest, InitResponse, ReadBlockRequest,
    ReadBlockResponse, Request, Response, StatusRequest, StatusResponse, WriteBlockRequest,
    WriteBlockResponse,
};
pub use connection::{Connection, LinkState, PendingResponse};
pub use dib::{DeviceInfo, UnitStatus};
pub use frame::{Block, BlockNumber};
pub use requestor::Requestor;
