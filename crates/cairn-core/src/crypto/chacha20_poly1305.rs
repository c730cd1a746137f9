use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use super::CryptoEngine;
use crate::error::{CairnError, Result};

/// ChaCha20-Poly1305 authenticated encryption engine.
pub struct ChaCha20Poly1305Engine {
    cipher: ChaCha20Poly1305,
}

impl ChaCha20Poly1305Engine {
    pub fn new(encryption_key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(encryption_key)),
        }
    }
}

impl CryptoEngine for ChaCha20Poly1305Engine {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
            .map_err(|e| CairnError::Other(format!("ChaCha20-Poly1305 encrypt: {e}")))?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 + 16 {
            return Err(CairnError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CairnError::DecryptionFailed)
    }

    fn is_encrypting(&self) -> bool {
        true
    }
}
