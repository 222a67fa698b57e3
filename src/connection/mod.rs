//! Connection state machine (C6, §4.6): drives the handshake through a `tls::QuicToTls`
//! collaborator, tracks per-space ACK and loss-detection state, and owns the streams multiplexed
//! over the connection. `Connection` itself does no socket I/O — `endpoint::Endpoint` (C8) owns
//! the UDP socket and timers and calls into `Connection` at each wakeup, the split the teacher's
//! original `tokio::select!` skeleton conflated into one type.

mod ack;
#[allow(clippy::module_inception)]
mod connection;
pub mod types;

pub use connection::Connection;
pub use types::{CloseReason, ConnectionState};
