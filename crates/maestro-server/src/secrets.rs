//! At-rest sealing of info-request responses.
//!
//! ChaCha20-Poly1305 with a key derived from the configured secret via
//! SHA-256. Each seal draws a fresh 12-byte nonce, prepended to the
//! ciphertext so the blob is self-contained. The runtime stores the
//! blob opaquely together with the algorithm tag; retrieval succeeds
//! only when the caller-supplied secret derives the same key, which the
//! AEAD tag authenticates.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

pub const SEAL_ALGO: &str = "chacha20poly1305";

#[derive(Clone)]
pub struct ResponseSealer {
    key: [u8; 32],
}

impl ResponseSealer {
    pub fn new(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        Self {
            key: hasher.finalize().into(),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>, String> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("seal response: {e}"))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a sealed blob; `None` means the key does not match or the
    /// blob was tampered with.
    pub fn open(&self, blob: &[u8]) -> Option<String> {
        if blob.len() <= NONCE_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_round_trips_with_the_same_secret() {
        let sealer = ResponseSealer::new("orchestrator-secret");
        let blob = sealer.seal("{\"region\":\"eu-west-1\"}").expect("seal");
        assert_eq!(
            sealer.open(&blob).as_deref(),
            Some("{\"region\":\"eu-west-1\"}")
        );
    }

    #[test]
    fn wrong_secret_fails_to_open() {
        let sealer = ResponseSealer::new("orchestrator-secret");
        let blob = sealer.seal("{\"token\":\"t\"}").expect("seal");
        assert_eq!(ResponseSealer::new("guess").open(&blob), None);
    }

    #[test]
    fn fresh_nonce_per_seal() {
        let sealer = ResponseSealer::new("orchestrator-secret");
        let first = sealer.seal("payload").expect("seal");
        let second = sealer.seal("payload").expect("seal");
        assert_ne!(first, second);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let sealer = ResponseSealer::new("orchestrator-secret");
        assert_eq!(sealer.open(&[0u8; 8]), None);
    }
}
