//! TLS collaborator boundary (C10, §4.10, §6, §9). The connection state machine never speaks TLS
//! directly — it drives a `QuicToTls` implementation and reacts to the `TlsToQuic` callbacks that
//! implementation makes back into it. This mirrors the design note in §9 ("reimplement the
//! callback graph as two narrow interfaces so the core is testable against a mock"), and the only
//! concrete implementation shipped here, `MockHandshake`, is exactly that mock: a deterministic
//! two-message exchange good enough to drive the whole state machine end to end without a real
//! TLS 1.3 stack (explicitly out of scope per the Non-goals).

use ring::hkdf;

use crate::packet::header::PnSpace;
use crate::packet::transport_params::{Direction, TransportParameters};

/// Direction of a freshly derived secret, as `TlsToQuic::on_new_secret` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretDirection {
    Client,
    Server,
}

/// What the connection state machine needs from its TLS collaborator (§4.10).
pub trait QuicToTls {
    fn write_handshake(&mut self, space: PnSpace, data: &[u8]);
    fn read_handshake(&mut self) -> Option<(PnSpace, Vec<u8>)>;
    fn is_handshake_complete(&self) -> bool;
    fn export_transport_params(&mut self, params: &[u8]);
    fn peer_transport_params(&self) -> Option<&[u8]>;
}

/// What the TLS collaborator calls back into the connection with (§4.10).
pub trait TlsToQuic {
    fn on_new_secret(&mut self, direction: SecretDirection, space: PnSpace, secret: Vec<u8>);
    fn on_handshake_done(&mut self);
}

const MOCK_HANDSHAKE_PSK: &[u8] = b"mock-handshake-pre-shared-value";

/// A deterministic stand-in for a TLS 1.3 handshake: `ClientHello`/`ServerHello` each carry the
/// local transport parameters, and per-space secrets are HKDF-Expanded from a fixed pre-shared
/// value keyed by connection ID and space — enough entropy to exercise the full key schedule and
/// state machine without ever doing a real key exchange. Never use this for anything but tests
/// and the tunnel binaries' default (no external CA) mode.
pub struct MockHandshake {
    role: Role,
    dst_cid: Vec<u8>,
    local_params: TransportParameters,
    peer_params: Option<Vec<u8>>,
    outbox: Vec<(PnSpace, Vec<u8>)>,
    inbox: Vec<(PnSpace, Vec<u8>)>,
    sent_hello: bool,
    received_hello: bool,
    handshake_done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl MockHandshake {
    pub fn new(role: Role, dst_cid: Vec<u8>, local_params: TransportParameters) -> Self {
        Self {
            role,
            dst_cid,
            local_params,
            peer_params: None,
            outbox: Vec::new(),
            inbox: Vec::new(),
            sent_hello: false,
            received_hello: false,
            handshake_done: false,
        }
    }

    /// Starts the exchange: the client emits its "ClientHello" (just its encoded transport
    /// parameters) in the Initial space.
    pub fn start<T: TlsToQuic>(&mut self, sink: &mut T) {
        if self.role != Role::Client || self.sent_hello {
            return;
        }
        let direction = match self.role {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        };
        let body = self.local_params.encode(direction);
        self.outbox.push((PnSpace::Initial, body));
        self.sent_hello = true;
        self.install_secret(sink, PnSpace::Initial);
    }

    /// Feeds a peer's handshake bytes in and drives the mock state forward. Real TLS stacks do
    /// this incrementally over several flights; the mock only needs one each way.
    pub fn drive<T: TlsToQuic>(&mut self, sink: &mut T) {
        while let Some((space, data)) = self.inbox.pop() {
            self.peer_params = Some(data);
            self.received_hello = true;

            if self.role == Role::Server && !self.sent_hello {
                let body = self.local_params.encode(Direction::ServerToClient);
                self.outbox.push((space, body));
                self.sent_hello = true;
                self.install_secret(sink, PnSpace::Initial);
                self.install_secret(sink, PnSpace::Handshake);
            }

            if self.sent_hello && self.received_hello && !self.handshake_done {
                self.install_secret(sink, PnSpace::Application);
                self.handshake_done = true;
                sink.on_handshake_done();
            }
        }
    }

    fn install_secret<T: TlsToQuic>(&self, sink: &mut T, space: PnSpace) {
        let client_secret = expand(&self.dst_cid, space, b"client");
        let server_secret = expand(&self.dst_cid, space, b"server");
        keylog_if_enabled(&self.dst_cid, space, SecretDirection::Client, &client_secret);
        keylog_if_enabled(&self.dst_cid, space, SecretDirection::Server, &server_secret);
        sink.on_new_secret(SecretDirection::Client, space, client_secret);
        sink.on_new_secret(SecretDirection::Server, space, server_secret);
    }
}

/// Stands in for NSS-format `SSLKEYLOGFILE` logging (§6, §4.11): with no real TLS record layer,
/// there are no actual traffic secrets a packet sniffer could use, so this crate logs the mock
/// handshake's derived secrets through `tracing` instead of writing the file a real
/// implementation would. Presence of the env var (its path is never read here — a real binding
/// doing the file write is `tunnel`'s job, see `tunnel::persist`) just gates the log line so a
/// quiet default run never prints key material.
fn keylog_if_enabled(dst_cid: &[u8], space: PnSpace, direction: SecretDirection, secret: &[u8]) {
    if std::env::var_os("SSLKEYLOGFILE").is_none() {
        return;
    }
    let label = match (space, direction) {
        (PnSpace::Initial, _) => "INITIAL_SECRET",
        (PnSpace::Handshake, SecretDirection::Client) => "CLIENT_HANDSHAKE_TRAFFIC_SECRET",
        (PnSpace::Handshake, SecretDirection::Server) => "SERVER_HANDSHAKE_TRAFFIC_SECRET",
        (PnSpace::Application, SecretDirection::Client) => "CLIENT_TRAFFIC_SECRET_0",
        (PnSpace::Application, SecretDirection::Server) => "SERVER_TRAFFIC_SECRET_0",
    };
    let cid_hex = dst_cid.iter().map(|b| format!("{b:02x}")).collect::<String>();
    let secret_hex = secret.iter().map(|b| format!("{b:02x}")).collect::<String>();
    tracing::trace!(target: "sslkeylog", "{label} {cid_hex} {secret_hex}");
}

/// Derives one side's per-space secret deterministically from the connection ID the client
/// offered, so client and server (both running a `MockHandshake`) land on the same value without
/// ever exchanging key material over the wire — a real handshake does this via Diffie-Hellman,
/// the mock just needs both sides to agree.
fn expand(dst_cid: &[u8], space: PnSpace, side: &[u8]) -> Vec<u8> {
    struct Len32;
    impl hkdf::KeyType for Len32 {
        fn len(&self) -> usize {
            32
        }
    }
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, dst_cid);
    let prk = salt.extract(MOCK_HANDSHAKE_PSK);
    let space_label: &[u8] = match space {
        PnSpace::Initial => b"initial",
        PnSpace::Handshake => b"handshake",
        PnSpace::Application => b"application",
    };
    let label_arr = [space_label, side];
    let okm = prk.expand(&label_arr, Len32).expect("hkdf expand cannot fail for fixed length");
    let mut out = vec![0u8; 32];
    okm.fill(&mut out).expect("hkdf fill cannot fail for matching length");
    out
}

impl QuicToTls for MockHandshake {
    fn write_handshake(&mut self, space: PnSpace, data: &[u8]) {
        self.inbox.push((space, data.to_vec()));
    }

    fn read_handshake(&mut self) -> Option<(PnSpace, Vec<u8>)> {
        self.outbox.pop()
    }

    fn is_handshake_complete(&self) -> bool {
        self.handshake_done
    }

    fn export_transport_params(&mut self, params: &[u8]) {
        self.local_params = TransportParameters::decode(
            params,
            match self.role {
                Role::Client => Direction::ClientToServer,
                Role::Server => Direction::ServerToClient,
            },
        )
        .expect("caller supplies a blob this process just encoded");
    }

    fn peer_transport_params(&self) -> Option<&[u8]> {
        self.peer_params.as_deref()
    }
}
