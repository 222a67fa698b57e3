use std::fmt;

use crate::error::{ConfigError, CryptoFailure, FrameDecodeError, TransportError};

pub type QuicheResult<T> = Result<T, QuicheError>;

/// Top-level error type returned from this crate's public API. Most call sites produce one of
/// the typed variants (see `crate::error`); `Msg` remains for the ad-hoc `require(..)` checks
/// the teacher crate already used throughout the wire codec.
#[derive(Debug)]
pub enum QuicheError {
    Msg(String),
    Io(std::io::Error),
    Transport(TransportError),
    FrameDecode(FrameDecodeError),
    Crypto(CryptoFailure),
    Config(ConfigError),
}

impl std::error::Error for QuicheError {}

impl fmt::Display for QuicheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuicheError::Msg(msg) => write!(f, "QuicheError: {msg}"),
            QuicheError::Io(err) => write!(f, "QuicheError: {err}"),
            QuicheError::Transport(err) => write!(f, "QuicheError: {err}"),
            QuicheError::FrameDecode(err) => write!(f, "QuicheError: {err}"),
            QuicheError::Crypto(err) => write!(f, "QuicheError: {err}"),
            QuicheError::Config(err) => write!(f, "QuicheError: {err}"),
        }
    }
}

impl From<std::io::Error> for QuicheError {
    fn from(err: std::io::Error) -> Self {
        QuicheError::Io(err)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for QuicheError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        QuicheError::Msg(err.to_string())
    }
}

pub fn require(cond: bool, msg: &str) -> QuicheResult<()> {
    if !cond {
        return Err(QuicheError::Msg(msg.to_string()));
    }
    Ok(())
}
