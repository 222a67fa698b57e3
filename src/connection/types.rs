//! Connection state machine states (§4.6): `Initial -> Handshake -> PostHandshake` on the happy
//! path, with `Closing`/`Draining`/`Closed` as the terminal states reachable from any of those.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Handshake,
    PostHandshake,
    /// Sent a close frame; re-emits it in response to any arriving packet for 3*PTO.
    Closing,
    /// Received a close frame; sends nothing further for 3*PTO.
    Draining,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed)
    }

    pub fn is_established(self) -> bool {
        matches!(self, ConnectionState::PostHandshake)
    }
}

/// Why a connection entered `Closing`/`Draining` (§4.6, §7).
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Locally-detected transport error, closed with `CONNECTION_CLOSE`.
    Transport { code: u64, reason: &'static str },
    /// Application-requested close, closed with `APPLICATION_CLOSE`.
    Application { code: u64 },
    /// A close frame arrived from the peer.
    PeerInitiated { code: u64 },
    /// Idle timeout expired with no close frame exchanged either way.
    IdleTimeout,
    /// A stateless reset token matched a packet that failed to unprotect.
    StatelessReset,
}
