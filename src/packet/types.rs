use crate::bits::{Bits, BitsExt};
use crate::bits_ext;

// unfortunately it's really annoying to implement a 160 bit integer
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct ConnectionId {
    // this MUST NOT exceed 20 bytes
    // endpoints which receive a version 1 long header with a cid_len > 20 must drop the packet
    // to faciliate version negotiation packets, servers should be equipped to handle a cid_len > 20
    pub cid_len: u8,
    pub cid: Vec<u8>,
}

impl ConnectionId {
    pub fn new(cid_len: u8, cid: Vec<u8>) -> Self {
        debug_assert_eq!(cid_len as usize, cid.len());
        Self { cid_len, cid }
    }

    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.cid
    }
}

bits_ext!(SingleBit, crate::bits::BitsExt, 1, u8);
bits_ext!(TwoBits, crate::bits::BitsExt, 2, u8);
bits_ext!(FourBits, crate::bits::BitsExt, 4, u8);
bits_ext!(SevenBits, crate::bits::BitsExt, 7, u8);
bits_ext!(LongPacketType, crate::bits::BitsExt, 2, u8);
bits_ext!(HeaderForm, crate::bits::BitsExt, 1, u8);

impl LongPacketType {
    pub fn initial() -> Self {
        Self::zero()
    }

    pub fn zero_rtt() -> Self {
        Self::one()
    }

    pub fn handshake() -> Self {
        Self(Bits::from(0b10))
    }

    pub fn retry() -> Self {
        Self(Bits::from(0b11))
    }
}

impl HeaderForm {
    pub fn short() -> Self {
        Self::zero()
    }

    pub fn long() -> Self {
        Self::one()
    }
}

/// Alias for the short-header key-phase bit (§3, §4.2) — toggled on each key update.
pub type KeyPhase = SingleBit;

/// Number of bytes a truncated packet number occupies on the wire, derived from the 2-bit
/// length field carried in both long and short headers (§3).
pub fn pn_len_from_bits(bits: u8) -> usize {
    (bits as usize) + 1
}

pub fn pn_len_to_bits(len: usize) -> u8 {
    debug_assert!((1..=4).contains(&len));
    (len - 1) as u8
}
