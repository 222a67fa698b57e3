//! Tunnel front-ends (C11, §4.11): the two local-protocol sinks, the CLI, and the persisted
//! transport-parameter/session files that turn the core (`connection`, `endpoint`) into a
//! runnable client/server pair. None of this is driven by the core directly —
//! `endpoint::Endpoint` only ever sees `(multiplex::Tag, Vec<u8>)` pairs, never a
//! protocol-specific socket, so swapping OpenFlow/OVSDB for some other pair of local protocols
//! would never touch `connection` or `endpoint`.

pub mod cli;
pub mod openflow;
pub mod ovsdb;
pub mod persist;

use std::net::SocketAddr;
use std::path::Path;

use tokio::sync::mpsc;

pub use cli::Cli;

use crate::cid::{ConnectionIdGenerator, Role as CidRole};
use crate::config::EndpointConfig;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::multiplex::{Mode, Tag};
use crate::result::{QuicheError, QuicheResult};

/// Runs one side of the tunnel end to end (§6, §4.11): resolves addresses, opens the QUIC
/// connection, starts whichever local sinks `mode` carries, and pumps bytes between them until
/// the connection closes or the process is interrupted.
pub async fn run(is_client: bool, cli: Cli, mode: Mode) -> QuicheResult<()> {
    let quic_addr = resolve(&cli.quic_addr, cli.quic_port)?;
    let local_addr = resolve(&cli.local_addr, cli.local_port)?;
    let bind_addr: SocketAddr = if quic_addr.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };

    let config = persist::load_transport_config(Path::new("transport_params.txt")).unwrap_or_default();

    let own_role = if is_client { CidRole::Client } else { CidRole::Server };
    let peer_role = if is_client { CidRole::Server } else { CidRole::Client };
    let endpoint_config = EndpointConfig::new(own_role)?;
    let src_cid = endpoint_config.cid_generator.generate()?;
    // Real QUIC learns the peer's chosen connection id from its first Initial packet (§3); this
    // tunnel has no such round trip modeled ahead of `Connection::new` (Non-goals: connection
    // migration and CID rotation are out of scope, and the two sides are pointed at each other
    // out of band already), so each side mints a placeholder of the peer's role-appropriate
    // length and `Connection::recv_datagram`'s header parsing never needs to match it against
    // anything but its own `src_cid`.
    let dst_cid = ConnectionIdGenerator::new(peer_role)?.generate()?;

    let version = endpoint_config.supported_versions[0];
    let config_for_persist = config.clone();
    let mut connection = Connection::new(is_client, config, version, dst_cid, src_cid)?;
    connection.set_multiplex_mode(mode);
    if is_client {
        connection.start()?;
    }

    let (to_core_tx, to_core_rx) = mpsc::channel::<(Tag, Vec<u8>)>(64);
    let (from_core_tx, mut from_core_rx) = mpsc::channel::<(Tag, Vec<u8>)>(64);
    let mut endpoint = Endpoint::bind(bind_addr, quic_addr, connection, to_core_rx, from_core_tx).await?;

    let (openflow_tx, openflow_rx) = mpsc::channel::<Vec<u8>>(64);
    let (ovsdb_tx, ovsdb_rx) = mpsc::channel::<Vec<u8>>(64);

    let demux = tokio::spawn(async move {
        while let Some((tag, data)) = from_core_rx.recv().await {
            let sent = match tag {
                Tag::OpenFlow => openflow_tx.send(data).await,
                Tag::Ovsdb => ovsdb_tx.send(data).await,
            };
            if sent.is_err() {
                break;
            }
        }
    });

    let mut sinks = Vec::new();
    if mode.carries(Tag::OpenFlow) {
        let sink = openflow::OpenFlowSink::bind(local_addr).await?;
        sinks.push(tokio::spawn(sink.run(to_core_tx.clone(), openflow_rx)));
    }
    if mode.carries(Tag::Ovsdb) {
        let sink = ovsdb::OvsdbSink::bind(local_addr).await?;
        sinks.push(tokio::spawn(sink.run(to_core_tx.clone(), ovsdb_rx)));
    }
    drop(to_core_tx);

    let result = endpoint.run().await;

    persist::save_transport_config(Path::new("transport_params.txt"), &config_for_persist).ok();
    demux.abort();
    for sink in sinks {
        sink.abort();
    }

    result
}

fn resolve(host: &str, port: u16) -> QuicheResult<SocketAddr> {
    format!("{host}:{port}").parse().map_err(|_| QuicheError::Msg(format!("invalid address: {host}:{port}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_accepts_ipv4_and_ipv6_hosts() {
        assert!(resolve("127.0.0.1", 4433).is_ok());
        assert!(resolve("::1", 4433).is_ok());
        assert!(resolve("not an address", 4433).is_err());
    }
}
