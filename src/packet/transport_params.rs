//! Transport-parameter blob codec (§3, §4.1). This is the TLS-extension payload exchanged via
//! `QuicToTls::export_transport_params`/`peer_transport_params` (§4.10) — a flat
//! tag-length-value sequence, tag and length both varints, decoded eagerly so a malformed blob
//! fails the handshake instead of surfacing as a confusing later error.

use bytes::{Bytes, BytesMut};

use crate::error::FrameDecodeError;
use crate::varint::VarInt;

const TAG_INITIAL_MAX_STREAM_DATA: u64 = 0x01;
const TAG_INITIAL_MAX_DATA: u64 = 0x02;
const TAG_IDLE_TIMEOUT: u64 = 0x03;
const TAG_MAX_STREAM_ID: u64 = 0x04;
const TAG_ACK_DELAY_EXPONENT: u64 = 0x05;
const TAG_MAX_ACK_DELAY: u64 = 0x06;
const TAG_PREFERRED_ADDRESS: u64 = 0x07;
const TAG_STATELESS_RESET_TOKEN: u64 = 0x08;

/// Which side produced a transport-parameter blob. `preferred_address` and
/// `stateless_reset_token` are only valid server->client (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportParameters {
    pub initial_max_stream_data: u64,
    pub initial_max_data: u64,
    pub idle_timeout_ms: u64,
    pub max_stream_id: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay_ms: u64,
    pub preferred_address: Option<Bytes>,
    pub stateless_reset_token: Option<[u8; 16]>,
}

impl TransportParameters {
    pub fn encode(&self, direction: Direction) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_tlv(&mut buf, TAG_INITIAL_MAX_STREAM_DATA, &VarInt::new_u64(self.initial_max_stream_data).unwrap().encode());
        put_tlv(&mut buf, TAG_INITIAL_MAX_DATA, &VarInt::new_u64(self.initial_max_data).unwrap().encode());
        put_tlv(&mut buf, TAG_IDLE_TIMEOUT, &VarInt::new_u64(self.idle_timeout_ms).unwrap().encode());
        put_tlv(&mut buf, TAG_MAX_STREAM_ID, &VarInt::new_u64(self.max_stream_id).unwrap().encode());
        put_tlv(&mut buf, TAG_ACK_DELAY_EXPONENT, &VarInt::new_u64(self.ack_delay_exponent).unwrap().encode());
        put_tlv(&mut buf, TAG_MAX_ACK_DELAY, &VarInt::new_u64(self.max_ack_delay_ms).unwrap().encode());
        if direction == Direction::ServerToClient {
            if let Some(addr) = &self.preferred_address {
                put_tlv(&mut buf, TAG_PREFERRED_ADDRESS, addr);
            }
            if let Some(token) = &self.stateless_reset_token {
                put_tlv(&mut buf, TAG_STATELESS_RESET_TOKEN, token);
            }
        }
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8], direction: Direction) -> Result<Self, FrameDecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let mut params = TransportParameters::default();
        let mut seen_stream_data = false;
        let mut seen_max_data = false;
        let mut seen_idle_timeout = false;

        while !buf.is_empty() {
            let tag = get_varint(&mut buf, "transport parameter tag")?;
            let len = get_varint(&mut buf, "transport parameter length")? as usize;
            if buf.len() < len {
                return Err(FrameDecodeError::Underrun("transport parameter value", len - buf.len()));
            }
            let value = buf.split_to(len);
            match tag {
                TAG_INITIAL_MAX_STREAM_DATA => {
                    params.initial_max_stream_data = decode_varint_value(&value)?;
                    seen_stream_data = true;
                }
                TAG_INITIAL_MAX_DATA => {
                    params.initial_max_data = decode_varint_value(&value)?;
                    seen_max_data = true;
                }
                TAG_IDLE_TIMEOUT => {
                    params.idle_timeout_ms = decode_varint_value(&value)?;
                    seen_idle_timeout = true;
                }
                TAG_MAX_STREAM_ID => params.max_stream_id = decode_varint_value(&value)?,
                TAG_ACK_DELAY_EXPONENT => params.ack_delay_exponent = decode_varint_value(&value)?,
                TAG_MAX_ACK_DELAY => params.max_ack_delay_ms = decode_varint_value(&value)?,
                TAG_PREFERRED_ADDRESS => {
                    if direction != Direction::ServerToClient {
                        return Err(FrameDecodeError::MalformedTransportParam(
                            "preferred_address is only valid server->client",
                        ));
                    }
                    params.preferred_address = Some(value);
                }
                TAG_STATELESS_RESET_TOKEN => {
                    if direction != Direction::ServerToClient {
                        return Err(FrameDecodeError::MalformedTransportParam(
                            "stateless_reset_token is only valid server->client",
                        ));
                    }
                    if value.len() != 16 {
                        return Err(FrameDecodeError::MalformedTransportParam("stateless_reset_token must be 16 bytes"));
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(&value);
                    params.stateless_reset_token = Some(token);
                }
                // Unknown tags are ignored (§3).
                _ => {}
            }
        }

        if !seen_stream_data {
            return Err(FrameDecodeError::MissingTransportParam("initial_max_stream_data"));
        }
        if !seen_max_data {
            return Err(FrameDecodeError::MissingTransportParam("initial_max_data"));
        }
        if !seen_idle_timeout {
            return Err(FrameDecodeError::MissingTransportParam("idle_timeout"));
        }

        Ok(params)
    }
}

fn put_tlv(buf: &mut BytesMut, tag: u64, value: &[u8]) {
    buf.extend_from_slice(&VarInt::new_u64(tag).unwrap().encode());
    buf.extend_from_slice(&VarInt::new_u64(value.len() as u64).unwrap().encode());
    buf.extend_from_slice(value);
}

fn decode_varint_value(value: &[u8]) -> Result<u64, FrameDecodeError> {
    let mut owned = value.to_vec();
    VarInt::decode(&mut owned)
        .map(|v| v.to_inner())
        .map_err(|_| FrameDecodeError::MalformedTransportParam("value is not a valid varint"))
}

fn get_varint(buf: &mut Bytes, what: &'static str) -> Result<u64, FrameDecodeError> {
    if buf.is_empty() {
        return Err(FrameDecodeError::Underrun(what, 1));
    }
    let disc = (buf[0] & 0b1100_0000) >> 6;
    let len = 1usize << disc;
    if buf.len() < len {
        return Err(FrameDecodeError::Underrun(what, len - buf.len()));
    }
    let mut tmp = buf.split_to(len).to_vec();
    let mut value = (tmp.remove(0) & 0b0011_1111) as u64;
    for b in tmp {
        value = (value << 8) | b as u64;
    }
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> TransportParameters {
        TransportParameters {
            initial_max_stream_data: 0x4000,
            initial_max_data: 0x10_0000,
            idle_timeout_ms: 30_000,
            max_stream_id: 100,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            preferred_address: None,
            stateless_reset_token: None,
        }
    }

    #[test]
    fn client_to_server_round_trips() {
        let params = sample();
        let encoded = params.encode(Direction::ClientToServer);
        let decoded = TransportParameters::decode(&encoded, Direction::ClientToServer).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn server_to_client_carries_preferred_address_and_reset_token() {
        let mut params = sample();
        params.preferred_address = Some(Bytes::from_static(b"10.0.0.1:4433"));
        params.stateless_reset_token = Some([7u8; 16]);
        let encoded = params.encode(Direction::ServerToClient);
        let decoded = TransportParameters::decode(&encoded, Direction::ServerToClient).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn client_to_server_rejects_stateless_reset_token() {
        let mut params = sample();
        params.stateless_reset_token = Some([1u8; 16]);
        let encoded = params.encode(Direction::ServerToClient);
        let err = TransportParameters::decode(&encoded, Direction::ClientToServer).unwrap_err();
        assert!(matches!(err, FrameDecodeError::MalformedTransportParam(_)));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let mut buf = BytesMut::new();
        put_tlv(&mut buf, TAG_INITIAL_MAX_DATA, &VarInt::new_u64(1024).unwrap().encode());
        put_tlv(&mut buf, TAG_IDLE_TIMEOUT, &VarInt::new_u64(30_000).unwrap().encode());
        let err = TransportParameters::decode(&buf, Direction::ClientToServer).unwrap_err();
        assert_eq!(err, FrameDecodeError::MissingTransportParam("initial_max_stream_data"));
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let mut buf = BytesMut::new();
        put_tlv(&mut buf, 0x7e, b"future extension");
        buf.extend_from_slice(&sample().encode(Direction::ClientToServer));
        let decoded = TransportParameters::decode(&buf, Direction::ClientToServer).unwrap();
        assert_eq!(decoded, sample());
    }
}
