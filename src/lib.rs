pub mod primitives;
pub use primitives::*;

pub mod cid;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod macros;
pub mod multiplex;
pub mod packet;
pub mod recovery;
pub mod result;
pub mod stream;
pub mod tls;
pub mod tunnel;

pub const MINI_QUICHE_VERSION: u32 = 0b0000_0010;
