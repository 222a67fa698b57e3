//! HKDF key schedule (§4.1/§4.2): derives the AEAD and header-protection keys for each
//! packet-number space from a traffic secret, using the literal `"quic key"`/`"quic iv"`/
//! `"quic pn"` expand labels named in the data model.

use std::collections::HashMap;

use ring::aead;
use ring::hkdf;

use crate::crypto::hp::HeaderProtection;
use crate::crypto::DirectionalKeys;
use crate::error::CryptoFailure;
use crate::packet::header::PnSpace;

/// Salt used to derive the Initial packet-number space's secrets from the client's first
/// destination connection ID (§3, §4.2) — this connection's analogue of RFC 9001's well-known
/// Initial salt, fixed so both endpoints compute the same secret without negotiation.
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

const LABEL_CLIENT_IN: &[u8] = b"client in";
const LABEL_SERVER_IN: &[u8] = b"server in";
const LABEL_KEY: &[u8] = b"quic key";
const LABEL_IV: &[u8] = b"quic iv";
const LABEL_PN: &[u8] = b"quic pn";

/// Which endpoint produced a traffic secret. Mirrors the client/server split every packet-number
/// space needs: each side encrypts with its own secret and decrypts with the peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Client,
    Server,
}

/// A pair of raw 32-byte traffic secrets for one packet-number space, as handed to the
/// connection by `TlsToQuic::on_new_secret` (§4.10).
#[derive(Debug, Clone)]
pub struct Secrets {
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

pub struct SpaceKeys {
    pub local: DirectionalKeys,
    pub remote: DirectionalKeys,
}

/// Holds derived keys per packet-number space for one endpoint role. Initial secrets are
/// self-derived from the connection ID (§4.2); Handshake/Application secrets are installed as
/// they arrive from the TLS collaborator.
pub struct CryptoContext {
    role: Endpoint,
    spaces: HashMap<PnSpace, SpaceKeys>,
}

impl CryptoContext {
    pub fn new(role: Endpoint) -> Self {
        Self { role, spaces: HashMap::new() }
    }

    /// Derives and installs the Initial space's keys from the client's first destination
    /// connection ID, deterministically, so both client and server land on the same secrets
    /// without any handshake round trip (§4.2).
    pub fn from_initial_secret(dst_cid: &[u8]) -> Self {
        let mut ctx = CryptoContext::new(Endpoint::Client);
        ctx.install_initial(dst_cid).expect("initial secret derivation cannot fail");
        ctx
    }

    pub fn install_initial(&mut self, dst_cid: &[u8]) -> Result<(), CryptoFailure> {
        let initial_salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
        let initial_secret = initial_salt.extract(dst_cid);
        let client_secret = expand_label(&initial_secret, LABEL_CLIENT_IN, 32)?;
        let server_secret = expand_label(&initial_secret, LABEL_SERVER_IN, 32)?;
        self.install(PnSpace::Initial, &Secrets { client: client_secret, server: server_secret })
    }

    /// Installs the secrets a TLS collaborator produced for a given space (§4.10
    /// `TlsToQuic::on_new_secret`), deriving the AEAD/header-protection keys for both
    /// directions.
    pub fn install(&mut self, space: PnSpace, secrets: &Secrets) -> Result<(), CryptoFailure> {
        let client_prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(&secrets.client);
        let server_prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(&secrets.server);
        let client_keys = derive_directional(&client_prk)?;
        let server_keys = derive_directional(&server_prk)?;
        let (local, remote) = match self.role {
            Endpoint::Client => (client_keys, server_keys),
            Endpoint::Server => (server_keys, client_keys),
        };
        self.spaces.insert(space, SpaceKeys { local, remote });
        Ok(())
    }

    pub fn keys(&self, space: PnSpace) -> Result<&SpaceKeys, CryptoFailure> {
        self.spaces.get(&space).ok_or(CryptoFailure::KeysNotInstalled)
    }

    pub fn has_space(&self, space: PnSpace) -> bool {
        self.spaces.contains_key(&space)
    }
}

fn expand_label(prk: &hkdf::Prk, label: &[u8], len: usize) -> Result<Vec<u8>, CryptoFailure> {
    struct OutLen(usize);
    impl hkdf::KeyType for OutLen {
        fn len(&self) -> usize {
            self.0
        }
    }
    let label_arr = [label];
    let okm = prk.expand(&label_arr, OutLen(len)).map_err(|_| CryptoFailure::KeysNotInstalled)?;
    let mut out = vec![0u8; len];
    okm.fill(&mut out).map_err(|_| CryptoFailure::KeysNotInstalled)?;
    Ok(out)
}

fn derive_directional(prk: &hkdf::Prk) -> Result<DirectionalKeys, CryptoFailure> {
    let key_bytes = expand_label(prk, LABEL_KEY, 16)?;
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&expand_label(prk, LABEL_IV, 12)?);
    let hp_key_bytes = expand_label(prk, LABEL_PN, 16)?;

    let unbound = aead::UnboundKey::new(&aead::AES_128_GCM, &key_bytes).map_err(|_| CryptoFailure::KeysNotInstalled)?;
    let aead_key = aead::LessSafeKey::new(unbound);
    let hp = HeaderProtection::new(&hp_key_bytes)?;

    Ok(DirectionalKeys { aead_key, iv, hp })
}
