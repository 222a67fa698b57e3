pub mod error;
pub mod frame;
pub mod header;
pub mod packet;
pub mod pn;
pub mod transport_params;

pub mod types;

pub use types::*;
