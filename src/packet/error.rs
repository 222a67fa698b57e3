use crate::result::QuicheError;

/// QUIC transport error codes (§7). Carried in `CONNECTION_CLOSE` frames; `CryptoError` folds in
/// the `CRYPTO_ERROR` range (0x0100-0x01ff), whose low byte is the TLS alert code (§6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ConnectionIdLimitError,
    ProtocolViolation,
    InvalidToken,
    ApplicationError,
    CryptoBufferExceeded,
    KeyUpdateError,
    AeadLimitReached,
    NoViablePath,
    CryptoError(u8),
}

impl ProtocolError {
    pub fn code(self) -> u64 {
        match self {
            ProtocolError::NoError => 0x00,
            ProtocolError::InternalError => 0x01,
            ProtocolError::ConnectionRefused => 0x02,
            ProtocolError::FlowControlError => 0x03,
            ProtocolError::StreamLimitError => 0x04,
            ProtocolError::StreamStateError => 0x05,
            ProtocolError::FinalSizeError => 0x06,
            ProtocolError::FrameEncodingError => 0x07,
            ProtocolError::TransportParameterError => 0x08,
            ProtocolError::ConnectionIdLimitError => 0x09,
            ProtocolError::ProtocolViolation => 0x0a,
            ProtocolError::InvalidToken => 0x0b,
            ProtocolError::ApplicationError => 0x0c,
            ProtocolError::CryptoBufferExceeded => 0x0d,
            ProtocolError::KeyUpdateError => 0x0e,
            ProtocolError::AeadLimitReached => 0x0f,
            ProtocolError::NoViablePath => 0x10,
            ProtocolError::CryptoError(alert) => 0x0100 | alert as u64,
        }
    }

    pub fn from_code(value: u64) -> Self {
        match value {
            0x00 => ProtocolError::NoError,
            0x01 => ProtocolError::InternalError,
            0x02 => ProtocolError::ConnectionRefused,
            0x03 => ProtocolError::FlowControlError,
            0x04 => ProtocolError::StreamLimitError,
            0x05 => ProtocolError::StreamStateError,
            0x06 => ProtocolError::FinalSizeError,
            0x07 => ProtocolError::FrameEncodingError,
            0x08 => ProtocolError::TransportParameterError,
            0x09 => ProtocolError::ConnectionIdLimitError,
            0x0a => ProtocolError::ProtocolViolation,
            0x0b => ProtocolError::InvalidToken,
            0x0c => ProtocolError::ApplicationError,
            0x0d => ProtocolError::CryptoBufferExceeded,
            0x0e => ProtocolError::KeyUpdateError,
            0x0f => ProtocolError::AeadLimitReached,
            0x10 => ProtocolError::NoViablePath,
            0x0100..=0x01ff => ProtocolError::CryptoError((value & 0xff) as u8),
            _ => ProtocolError::InternalError,
        }
    }

    pub fn is_protocol_error(code: u64) -> bool {
        matches!(code, 0x00..=0x10) || matches!(code, 0x0100..=0x01ff)
    }
}

impl From<ProtocolError> for QuicheError {
    fn from(err: ProtocolError) -> Self {
        QuicheError::Msg(format!("transport error: {err:?}"))
    }
}
