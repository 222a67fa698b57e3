//! Packet protection engine (C3, §4.3): turns a header plus a batch of frames into one AEAD- and
//! header-protected datagram payload, and the inverse. Packet-number reconstruction against the
//! receiver's largest-seen value lives in `super::pn`; the AEAD/header-protection primitives live
//! in `crate::crypto`.

use bytes::{Bytes, BytesMut};

use crate::crypto::{DirectionalKeys, HeaderProtection};
use crate::packet::frame::Frame;
use crate::packet::header::{Header, LongPacketKind, PnSpace};
use crate::packet::pn;
use crate::packet::types::pn_len_to_bits;
use crate::result::{require, QuicheError, QuicheResult};
use crate::varint::VarInt;

/// A decoded, deprotected packet: the clear header, its reconstructed packet number, and the
/// frames carried in its payload.
#[derive(Debug, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub packet_number: u64,
    pub frames: Vec<Frame>,
}

/// Reads the packet-number space a datagram belongs to from its still-protected bytes. Long
/// headers carry their type (and therefore space) in bits 5-6 of byte 0, which sit outside the
/// low-5-bit header-protection mask (§4.2), so this never needs deprotection. Short headers are
/// always `Application`. Returns `None` for Retry and Version Negotiation packets, neither of
/// which carry a packet number.
pub fn peek_space(datagram: &[u8]) -> QuicheResult<Option<PnSpace>> {
    require(!datagram.is_empty(), "empty datagram")?;
    if datagram[0] & 0x80 == 0 {
        return Ok(Some(PnSpace::Application));
    }
    if datagram.len() < 5 {
        return Err(QuicheError::Msg("long header too short to read version".into()));
    }
    let version = u32::from_be_bytes(datagram[1..5].try_into().unwrap());
    if version == 0 {
        return Ok(None);
    }
    let type_bits = (datagram[0] >> 5) & 0b11;
    let kind = match type_bits {
        0b00 => LongPacketKind::Initial,
        0b01 => LongPacketKind::ZeroRtt,
        0b10 => LongPacketKind::Handshake,
        0b11 => LongPacketKind::Retry,
        _ => unreachable!(),
    };
    Ok(kind.space())
}

/// Encodes `header` and `frames` into one fully protected packet, encrypted and header-protected
/// under `keys`. `largest_acked` is the peer's most recently acknowledged packet number in this
/// space, used only to pick the narrowest safe packet-number encoding (§3).
pub fn protect(
    header: &Header,
    packet_number: u64,
    largest_acked: Option<u64>,
    frames: &[Frame],
    keys: &DirectionalKeys,
) -> QuicheResult<Vec<u8>> {
    if let Header::Long(h) = header {
        require(h.kind != LongPacketKind::Retry, "Retry packets are not AEAD-protected")?;
    }

    let pn_len = pn::encode_len(packet_number, largest_acked);
    let pn_len_bits = pn_len_to_bits(pn_len);

    let mut payload = BytesMut::new();
    for frame in frames {
        frame.encode(&mut payload);
    }
    let ciphertext_len = payload.len() + 16; // AEAD tag

    let mut clear = header.encode_clear(pn_len_bits)?;
    if matches!(header, Header::Long(_)) {
        let length = VarInt::new_u64((pn_len + ciphertext_len) as u64)?;
        clear.extend(length.encode());
    }
    let pn_offset = clear.len();
    clear.extend(pn::truncate(packet_number, pn_len));

    let sealed = keys.seal(packet_number, &clear, payload.to_vec())?;

    let mut packet = clear;
    packet.extend(sealed);

    let sample = HeaderProtection::sample(&packet, pn_offset)?.to_vec();
    keys.hp.apply(&mut packet, pn_offset, pn_len, &sample)?;

    Ok(packet)
}

/// Removes header protection, decrypts the payload, and decodes its frames. `dst_cid_len` is
/// needed only for short headers, which don't self-describe their CID length on the wire (§3).
pub fn unprotect(
    datagram: &[u8],
    dst_cid_len: usize,
    largest_seen: Option<u64>,
    keys: &DirectionalKeys,
) -> QuicheResult<Packet> {
    let mut packet = datagram.to_vec();

    let (header, pn_offset) = if packet[0] & 0x80 != 0 {
        let (header, pn_offset, _masked_bits) = Header::decode_clear(&packet)?;
        (header, pn_offset)
    } else {
        let (header, pn_offset, _masked_bits) =
            crate::packet::header::decode_short_with_cid_len(&packet, dst_cid_len)?;
        (header, pn_offset)
    };

    if let Header::VersionNegotiation { .. } = header {
        return Err(QuicheError::Msg("version negotiation packets carry no packet number".into()));
    }

    let sample = HeaderProtection::sample(&packet, pn_offset)?.to_vec();
    let pn_len = keys.hp.remove_unknown_len(&mut packet, pn_offset, &sample)?;

    let truncated = bytes_to_u64(&packet[pn_offset..pn_offset + pn_len]);
    let packet_number = pn::reconstruct(largest_seen, truncated, pn_len);

    let header_len = pn_offset + pn_len;
    let (header_bytes, rest) = packet.split_at(header_len);
    let mut ciphertext = rest.to_vec();
    let plaintext_len = keys.open(packet_number, header_bytes, &mut ciphertext)?.len();
    ciphertext.truncate(plaintext_len);

    let mut payload = Bytes::from(ciphertext);
    let mut frames = Vec::new();
    while !payload.is_empty() {
        frames.push(Frame::decode(&mut payload)?);
    }

    Ok(Packet { header, packet_number, frames })
}

fn bytes_to_u64(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for b in bytes {
        value = (value << 8) | *b as u64;
    }
    value
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{CryptoContext, Endpoint, Secrets};
    use crate::packet::header::LongHeader;
    use crate::packet::types::ConnectionId;

    fn keypair(space: PnSpace) -> (DirectionalKeysOwned, DirectionalKeysOwned) {
        let secrets = Secrets { client: vec![0x11; 32], server: vec![0x22; 32] };
        let mut client_ctx = CryptoContext::new(Endpoint::Client);
        client_ctx.install(space, &secrets).unwrap();
        let mut server_ctx = CryptoContext::new(Endpoint::Server);
        server_ctx.install(space, &secrets).unwrap();
        (DirectionalKeysOwned(client_ctx), DirectionalKeysOwned(server_ctx))
    }

    // Helper so tests can hold both `CryptoContext`s alive while borrowing `DirectionalKeys` out
    // of them for the duration of a single protect/unprotect round trip.
    struct DirectionalKeysOwned(CryptoContext);

    #[test]
    fn initial_packet_round_trips_through_protection() {
        let (client, server) = keypair(PnSpace::Initial);
        let dst_cid = ConnectionId::new(8, vec![9; 8]);
        let src_cid = ConnectionId::new(8, vec![7; 8]);
        let header = Header::Long(LongHeader::initial(1, dst_cid.clone(), src_cid, Vec::new()));
        let frames = vec![Frame::Crypto { offset: 0, data: Bytes::from_static(b"client hello bytes") }];

        let client_keys = &client.0.keys(PnSpace::Initial).unwrap().local;
        let wire = protect(&header, 2, None, &frames, client_keys).unwrap();

        let server_keys = &server.0.keys(PnSpace::Initial).unwrap().remote;
        let decoded = unprotect(&wire, 8, None, server_keys).unwrap();

        assert_eq!(decoded.packet_number, 2);
        assert_eq!(decoded.frames, frames);
    }

    #[test]
    fn short_header_application_packet_round_trips() {
        let (client, server) = keypair(PnSpace::Application);
        let dst_cid = ConnectionId::new(18, vec![3; 18]);
        let header = Header::Short(crate::packet::header::ShortHeader::new(dst_cid, false));
        let frames = vec![Frame::Stream { stream_id: 4, offset: 0, fin: true, data: Bytes::from_static(b"payload") }];

        let client_keys = &client.0.keys(PnSpace::Application).unwrap().local;
        let wire = protect(&header, 900, Some(850), &frames, client_keys).unwrap();

        let server_keys = &server.0.keys(PnSpace::Application).unwrap().remote;
        let decoded = unprotect(&wire, 18, Some(850), server_keys).unwrap();

        assert_eq!(decoded.packet_number, 900);
        assert_eq!(decoded.frames, frames);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let (client, server) = keypair(PnSpace::Initial);
        let dst_cid = ConnectionId::new(8, vec![9; 8]);
        let src_cid = ConnectionId::new(8, vec![7; 8]);
        let header = Header::Long(LongHeader::initial(1, dst_cid, src_cid, Vec::new()));
        let frames = vec![Frame::Ping];

        let client_keys = &client.0.keys(PnSpace::Initial).unwrap().local;
        let mut wire = protect(&header, 1, None, &frames, client_keys).unwrap();
        *wire.last_mut().unwrap() ^= 0xff;

        let server_keys = &server.0.keys(PnSpace::Initial).unwrap().remote;
        assert!(unprotect(&wire, 8, None, server_keys).is_err());
    }
}
