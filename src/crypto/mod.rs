//! Cryptographic context (C2): HKDF key derivation, AEAD seal/open, header-protection mask.
//!
//! Grounded on the `ring` usage patterns in the retrieval pack's handwritten TLS fragments
//! (`grahamking-ort/src/tls.rs`: HKDF-Expand-Label shape, nonce-from-sequence-number XOR) but
//! narrowed to exactly what the packet protection engine (`packet::packet`) needs. Key material
//! itself comes from whichever `TlsToQuic::on_new_secret` call installed it (§4.10) — this module
//! never talks to a socket.

mod hp;
mod keys;

pub use hp::HeaderProtection;
pub use keys::{CryptoContext, Endpoint, Secrets};

use ring::aead;

use crate::error::CryptoFailure;

/// One direction's (client->server or server->client) fully-derived key material for a single
/// packet-number space: an AEAD key/iv pair for payload protection and a header-protection key.
pub struct DirectionalKeys {
    pub(crate) aead_key: aead::LessSafeKey,
    pub(crate) iv: [u8; 12],
    pub(crate) hp: HeaderProtection,
}

impl DirectionalKeys {
    fn nonce_for(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&packet_number.to_be_bytes());
        for (n, iv) in nonce.iter_mut().zip(self.iv.iter()) {
            *n ^= iv;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Seals `payload` in place, returning it with the 16-byte authentication tag appended.
    /// `header` is the encoded (but not header-protected) packet header, used as AEAD associated
    /// data so any bit-flip in the clear header fails authentication (§4.1/§4.2).
    pub fn seal(&self, packet_number: u64, header: &[u8], mut payload: Vec<u8>) -> Result<Vec<u8>, CryptoFailure> {
        let nonce = self.nonce_for(packet_number);
        self.aead_key
            .seal_in_place_append_tag(nonce, aead::Aad::from(header), &mut payload)
            .map_err(|_| CryptoFailure::AeadOpen)?;
        Ok(payload)
    }

    /// Opens an in-place protected payload (header-protection already removed, tag still
    /// appended), returning the plaintext length on success.
    pub fn open<'a>(&self, packet_number: u64, header: &[u8], payload: &'a mut [u8]) -> Result<&'a mut [u8], CryptoFailure> {
        let nonce = self.nonce_for(packet_number);
        self.aead_key
            .open_in_place(nonce, aead::Aad::from(header), payload)
            .map_err(|_| CryptoFailure::AeadOpen)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::keys::CryptoContext;
    use crate::packet::header::PnSpace;

    #[test]
    fn seal_then_open_round_trips() {
        let ctx = CryptoContext::from_initial_secret(b"test connection id");
        let client = ctx.keys(PnSpace::Initial).unwrap();
        let sealed = client.local.seal(1, b"header-bytes", b"hello world".to_vec()).unwrap();
        let mut buf = sealed.clone();
        let opened = client.local.open(1, b"header-bytes", &mut buf).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn tampered_header_fails_to_open() {
        let ctx = CryptoContext::from_initial_secret(b"test connection id");
        let client = ctx.keys(PnSpace::Initial).unwrap();
        let sealed = client.local.seal(1, b"header-bytes", b"hello world".to_vec()).unwrap();
        let mut buf = sealed.clone();
        assert!(client.local.open(1, b"tampered-head", &mut buf).is_err());
    }
}
