//! Persisted transport-parameters and TLS session files (§6): a plain-text `key=value`
//! transport-parameters file, and a PEM-wrapped session file for 0-RTT resumption. The session
//! half of this isn't consumed by anything yet — `tls::MockHandshake` never derives 0-RTT keys to
//! resume into (DESIGN.md's 0-RTT Open Question) — so `save_session`/`load_session` exist as the
//! file-format a real TLS binding's resumption path would read and write.

use std::fs;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::TransportConfig;
use crate::result::{QuicheError, QuicheResult};

const SESSION_PEM_LABEL: &str = "MINI QUICHE SESSION";

/// Writes `config`'s negotiable parameters as `key=value` lines.
pub fn save_transport_config(path: &Path, config: &TransportConfig) -> QuicheResult<()> {
    let body = format!(
        "max_concurrent_bidi_streams={}\n\
         initial_max_stream_data={}\n\
         initial_max_data={}\n\
         send_window={}\n\
         max_idle_timeout_ms={}\n\
         packet_threshold={}\n\
         ack_delay_exponent={}\n\
         max_ack_delay_ms={}\n",
        config.max_concurrent_bidi_streams,
        config.initial_max_stream_data,
        config.initial_max_data,
        config.send_window,
        config.max_idle_timeout.as_millis(),
        config.packet_threshold,
        config.ack_delay_exponent,
        config.max_ack_delay.as_millis(),
    );
    fs::write(path, body)?;
    Ok(())
}

/// Reads back a file `save_transport_config` wrote, layering its values onto
/// `TransportConfig::default()`. Unknown keys and unparsable values are skipped rather than
/// fatal: a stale or hand-edited file degrading to defaults beats a tunnel that refuses to start.
pub fn load_transport_config(path: &Path) -> QuicheResult<TransportConfig> {
    let text = fs::read_to_string(path)?;
    let mut config = TransportConfig::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        let Ok(n) = value.trim().parse::<u64>() else { continue };
        match key.trim() {
            "max_concurrent_bidi_streams" => {
                let _ = config.max_concurrent_bidi_streams(n);
            }
            "initial_max_stream_data" => {
                let _ = config.initial_max_stream_data(n);
            }
            "initial_max_data" => {
                let _ = config.initial_max_data(n);
            }
            "send_window" => {
                config.send_window(n);
            }
            "max_idle_timeout_ms" => {
                let _ = config.max_idle_timeout(Duration::from_millis(n));
            }
            "packet_threshold" => {
                config.packet_threshold(n as u32);
            }
            "ack_delay_exponent" => {
                config.ack_delay_exponent(n as u8);
            }
            "max_ack_delay_ms" => {
                config.max_ack_delay(Duration::from_millis(n));
            }
            _ => {}
        }
    }
    Ok(config)
}

/// Wraps an opaque session blob in a PEM-style envelope (§6: "PEM-wrapped session").
pub fn save_session(path: &Path, session: &[u8]) -> QuicheResult<()> {
    let encoded = BASE64.encode(session);
    let mut body = format!("-----BEGIN {SESSION_PEM_LABEL}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        body.push_str(std::str::from_utf8(chunk).expect("base64 alphabet is ASCII"));
        body.push('\n');
    }
    body.push_str(&format!("-----END {SESSION_PEM_LABEL}-----\n"));
    fs::write(path, body)?;
    Ok(())
}

pub fn load_session(path: &Path) -> QuicheResult<Vec<u8>> {
    let text = fs::read_to_string(path)?;
    let body: String = text.lines().filter(|line| !line.starts_with("-----")).collect();
    BASE64.decode(body).map_err(|_| QuicheError::Msg("malformed session file".into()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transport_config_round_trips_through_the_file_format() {
        let dir = std::env::temp_dir().join("mini-quiche-test-transport-config");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("params");

        let mut config = TransportConfig::default();
        config.max_concurrent_bidi_streams(16).unwrap();
        config.send_window(8192);
        save_transport_config(&path, &config).unwrap();

        let loaded = load_transport_config(&path).unwrap();
        assert_eq!(loaded.max_concurrent_bidi_streams, 16);
        assert_eq!(loaded.send_window, 8192);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn session_round_trips_through_the_pem_envelope() {
        let dir = std::env::temp_dir().join("mini-quiche-test-session");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.pem");

        let session = b"opaque-session-state-bytes".to_vec();
        save_session(&path, &session).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("-----BEGIN MINI QUICHE SESSION-----"));

        let loaded = load_session(&path).unwrap();
        assert_eq!(loaded, session);

        fs::remove_dir_all(&dir).ok();
    }
}
