pub mod aes_gcm;
pub mod chacha20_poly1305;
pub mod id;
pub mod key;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

use self::key::MasterKey;

/// Trait for encrypting and decrypting repository objects.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[nonce][ciphertext+tag]`.
    /// `aad` is authenticated but not encrypted (e.g., the type tag byte).
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`.
    /// `aad` must match what was passed during encryption.
    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    fn is_encrypting(&self) -> bool;
}

/// No-encryption engine for unencrypted repositories.
pub struct PlaintextEngine;

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    None,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl EncryptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::Aes256Gcm => "aes256gcm",
            EncryptionMode::Chacha20Poly1305 => "chacha20poly1305",
        }
    }
}

/// Build the engine for `mode`. Encrypted modes need the unwrapped master key.
pub fn engine_for(mode: EncryptionMode, key: Option<&MasterKey>) -> Result<Arc<dyn CryptoEngine>> {
    match (mode, key) {
        (EncryptionMode::None, _) => Ok(Arc::new(PlaintextEngine)),
        (EncryptionMode::Aes256Gcm, Some(key)) => {
            Ok(Arc::new(aes_gcm::Aes256GcmEngine::new(&key.encryption_key)))
        }
        (EncryptionMode::Chacha20Poly1305, Some(key)) => Ok(Arc::new(
            chacha20_poly1305::ChaCha20Poly1305Engine::new(&key.encryption_key),
        )),
        (mode, None) => Err(CairnError::Config(format!(
            "{} repository requires a master key",
            mode.as_str()
        ))),
    }
}
