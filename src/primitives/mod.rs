pub mod bits;
pub mod varint;

pub use bits::*;
pub use varint::*;
