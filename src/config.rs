//! Configuration surface (C9): parameters governing the connection state machine, negotiated
//! through the transport-parameter blob (`packet::transport_params`) and otherwise local to each
//! endpoint. Shaped directly on `quinn-proto::config::TransportConfig` — same builder-method
//! pattern (`&mut Self` / `Result<&mut Self, ConfigError>`), narrowed to the parameters this
//! connection actually negotiates.

use std::time::Duration;

use crate::cid::{ConnectionIdGenerator, Role};
use crate::error::ConfigError;
use crate::primitives::varint::VarInt;
use crate::result::QuicheResult;

/// Per-connection negotiable parameters (§4.9). Defaults are tuned for the tunnel's expected
/// traffic pattern — two long-lived, relatively low-bandwidth SDN control streams — rather than a
/// bulk-transfer workload.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub(crate) max_concurrent_bidi_streams: u64,
    pub(crate) initial_max_stream_data: u64,
    pub(crate) initial_max_data: u64,
    pub(crate) send_window: u64,
    pub(crate) max_idle_timeout: Duration,
    pub(crate) keep_alive_interval: Option<Duration>,
    pub(crate) packet_threshold: u32,
    pub(crate) time_threshold: f32,
    pub(crate) initial_rtt: Duration,
    pub(crate) ack_delay_exponent: u8,
    pub(crate) max_ack_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_concurrent_bidi_streams: 8,
            initial_max_stream_data: 256 * 1024,
            initial_max_data: 1024 * 1024,
            send_window: 1024 * 1024,
            max_idle_timeout: Duration::from_secs(30),
            keep_alive_interval: None,
            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            initial_rtt: Duration::from_millis(100),
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
        }
    }
}

impl TransportConfig {
    /// Maximum number of bidirectional streams the peer may have open concurrently. Since this
    /// tunnel only ever needs two (OpenFlow, OVSDB), the default is deliberately small.
    pub fn max_concurrent_bidi_streams(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        VarInt::new_u64(value).map_err(|_| ConfigError::OutOfBounds)?;
        self.max_concurrent_bidi_streams = value;
        Ok(self)
    }

    pub fn initial_max_stream_data(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        VarInt::new_u64(value).map_err(|_| ConfigError::OutOfBounds)?;
        self.initial_max_stream_data = value;
        Ok(self)
    }

    pub fn initial_max_data(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        VarInt::new_u64(value).map_err(|_| ConfigError::OutOfBounds)?;
        self.initial_max_data = value;
        Ok(self)
    }

    pub fn send_window(&mut self, value: u64) -> &mut Self {
        self.send_window = value;
        self
    }

    /// Maximum duration of inactivity tolerated before the connection is declared idle and moved
    /// to `DRAINING` (§4.6). The effective timeout used is `min(self, peer's advertised value)`.
    pub fn max_idle_timeout(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.as_millis() > VarInt::MAX.to_inner() as u128 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_idle_timeout = value;
        Ok(self)
    }

    pub fn keep_alive_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.keep_alive_interval = value;
        self
    }

    /// Reordering threshold in packets before a gap is declared a loss (§4.4).
    pub fn packet_threshold(&mut self, value: u32) -> &mut Self {
        self.packet_threshold = value.max(1);
        self
    }

    /// Reordering threshold as a multiple of the smoothed/latest RTT (§4.4). spec.md fixes 9/8.
    pub fn time_threshold(&mut self, value: f32) -> &mut Self {
        self.time_threshold = value;
        self
    }

    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    pub fn ack_delay_exponent(&mut self, value: u8) -> &mut Self {
        self.ack_delay_exponent = value;
        self
    }

    pub fn max_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.max_ack_delay = value;
        self
    }
}

/// Endpoint-wide configuration shared by every connection the endpoint drives (§4.9): which
/// versions it speaks and how it mints local connection IDs and stateless reset tokens.
pub struct EndpointConfig {
    pub supported_versions: Vec<u32>,
    pub cid_generator: ConnectionIdGenerator,
}

impl EndpointConfig {
    pub fn new(role: Role) -> QuicheResult<Self> {
        Ok(Self {
            supported_versions: vec![crate::MINI_QUICHE_VERSION],
            cid_generator: ConnectionIdGenerator::new(role)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_idle_timeout_beyond_varint_range() {
        let mut config = TransportConfig::default();
        let huge = Duration::from_millis(u64::MAX);
        assert!(matches!(config.max_idle_timeout(huge), Err(ConfigError::OutOfBounds)));
    }

    #[test]
    fn builder_methods_chain() {
        let mut config = TransportConfig::default();
        config
            .max_concurrent_bidi_streams(4)
            .unwrap()
            .initial_max_data(2048)
            .unwrap()
            .send_window(4096)
            .packet_threshold(5);
        assert_eq!(config.max_concurrent_bidi_streams, 4);
        assert_eq!(config.initial_max_data, 2048);
        assert_eq!(config.send_window, 4096);
        assert_eq!(config.packet_threshold, 5);
    }
}
