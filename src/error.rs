//! Typed error taxonomy (§7) layered under [`crate::result::QuicheError`].
//!
//! The teacher crate's `QuicheError` stays the single user-facing error type returned from the
//! public API; these enums exist so that internal call sites can match on *kind* (a flow-control
//! breach vs. a malformed frame vs. a config bound) before that detail is collapsed into a
//! `CONNECTION_CLOSE` transport code (§7) or a `Display`-able message.

use thiserror::Error;

use crate::packet::error::ProtocolError;
use crate::result::QuicheError;

/// A transport protocol violation (§7): malformed frame, frame in the wrong packet type,
/// flow-control breach, final-offset mismatch, stream-id out of range. Always fatal to the
/// connection; carries the matching CONNECTION_CLOSE transport error code.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("flow control error: received {received} bytes, credit was {credit}")]
    FlowControl { received: u64, credit: u64 },

    #[error("final size error: stream already terminated at offset {prior}, peer now claims {new}")]
    FinalSize { prior: u64, new: u64 },

    #[error("stream id {stream_id} exceeds the advertised limit {limit}")]
    StreamIdBlocked { stream_id: u64, limit: u64 },

    #[error("stream {stream_id} is in the wrong state for this frame")]
    StreamState { stream_id: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error(transparent)]
    FrameDecode(#[from] FrameDecodeError),
}

impl TransportError {
    /// Maps this violation onto the QUIC transport error code space so it can be carried in a
    /// `CONNECTION_CLOSE` frame (§4.3 frame table / §7).
    pub fn code(&self) -> ProtocolError {
        match self {
            TransportError::FlowControl { .. } => ProtocolError::FlowControlError,
            TransportError::FinalSize { .. } => ProtocolError::FinalSizeError,
            TransportError::StreamIdBlocked { .. } => ProtocolError::StreamLimitError,
            TransportError::StreamState { .. } => ProtocolError::StreamStateError,
            TransportError::ProtocolViolation(_) => ProtocolError::ProtocolViolation,
            TransportError::FrameDecode(_) => ProtocolError::FrameEncodingError,
        }
    }
}

/// Decode-time failure in the wire codec (C1, §4.1). A frame whose declared length underruns or
/// overruns the remaining packet buffer, an out-of-range enum discriminant, or a required
/// transport parameter missing from the TLV blob.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("buffer underrun decoding {0}: needed {1} more byte(s)")]
    Underrun(&'static str, usize),

    #[error("trailing bytes after decoding declared payload")]
    TrailingBytes,

    #[error("unknown frame type 0x{0:x}")]
    UnknownFrameType(u64),

    #[error("malformed transport parameter: {0}")]
    MalformedTransportParam(&'static str),

    #[error("required transport parameter missing: {0}")]
    MissingTransportParam(&'static str),
}

/// Cryptographic failure (§7). AEAD-open failure is *not* fatal on its own (the packet is
/// discarded, see C3 §4.3); a fatal TLS alert surfaced through the collaborator interface is.
#[derive(Debug, Error)]
pub enum CryptoFailure {
    #[error("AEAD open failed (packet discarded)")]
    AeadOpen,

    #[error("header protection sample unavailable: packet too short")]
    ShortSample,

    #[error("keys for packet-number space not yet installed")]
    KeysNotInstalled,

    #[error("fatal TLS alert: {0}")]
    FatalAlert(u8),
}

/// A `TransportConfig`/`EndpointConfig` builder argument out of the representable range —
/// grounded on `quinn-proto::config::ConfigError`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("value is out of the representable bounds for this parameter")]
    OutOfBounds,
}

impl From<TransportError> for QuicheError {
    fn from(err: TransportError) -> Self {
        QuicheError::Transport(err)
    }
}

impl From<FrameDecodeError> for QuicheError {
    fn from(err: FrameDecodeError) -> Self {
        QuicheError::FrameDecode(err)
    }
}

impl From<CryptoFailure> for QuicheError {
    fn from(err: CryptoFailure) -> Self {
        QuicheError::Crypto(err)
    }
}

impl From<ConfigError> for QuicheError {
    fn from(err: ConfigError) -> Self {
        QuicheError::Config(err)
    }
}
