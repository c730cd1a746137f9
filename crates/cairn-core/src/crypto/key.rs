use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::EncryptionMode;
use crate::config::KdfConfig;
use crate::error::{CairnError, Result};

/// The repository master key. Never stored in plaintext on disk and
/// zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub encryption_key: [u8; 32],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MasterKeyPayload {
    encryption_key: Vec<u8>,
}

/// KDF parameters stored alongside the wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

/// On-disk key object, stored unencrypted under `keys/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub kdf: KdfParams,
    pub mode: EncryptionMode,
    pub nonce: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
    pub created: DateTime<Utc>,
}

impl MasterKey {
    /// Generate a new random master key using OS entropy.
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);
        Self { encryption_key }
    }

    /// Wrap the master key with a passphrase using Argon2id + AES-256-GCM.
    pub fn to_encrypted(
        &self,
        passphrase: &str,
        mode: EncryptionMode,
        cost: &KdfConfig,
    ) -> Result<EncryptedKey> {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: cost.time_cost,
            memory_cost: cost.memory_cost,
            parallelism: cost.parallelism,
            salt,
        };
        let wrapping_key = derive_key_from_passphrase(passphrase, &kdf)?;

        let payload = MasterKeyPayload {
            encryption_key: self.encryption_key.to_vec(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

        // KDF params and cipher mode are bound as AAD so neither can be swapped.
        let aad = key_aad(&kdf, mode)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|e| CairnError::KeyDerivation(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &aad,
                },
            )
            .map_err(|e| CairnError::KeyDerivation(format!("encrypt: {e}")))?;

        Ok(EncryptedKey {
            kdf,
            mode,
            nonce: nonce_bytes.to_vec(),
            encrypted_payload: ciphertext,
            created: Utc::now(),
        })
    }

    /// Unwrap the master key. A wrong passphrase yields `DecryptionFailed`.
    pub fn from_encrypted(encrypted: &EncryptedKey, passphrase: &str) -> Result<Self> {
        if encrypted.kdf.algorithm != "argon2id" {
            return Err(CairnError::KeyDerivation(format!(
                "unsupported kdf '{}'",
                encrypted.kdf.algorithm
            )));
        }
        if encrypted.nonce.len() != 12 {
            return Err(CairnError::DecryptionFailed);
        }
        let wrapping_key = derive_key_from_passphrase(passphrase, &encrypted.kdf)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|_| CairnError::DecryptionFailed)?;
        let aad = key_aad(&encrypted.kdf, encrypted.mode)?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&encrypted.nonce),
                    Payload {
                        msg: encrypted.encrypted_payload.as_ref(),
                        aad: &aad,
                    },
                )
                .map_err(|_| CairnError::DecryptionFailed)?,
        );

        let payload: MasterKeyPayload =
            rmp_serde::from_slice(&plaintext).map_err(|_| CairnError::DecryptionFailed)?;
        if payload.encryption_key.len() != 32 {
            return Err(CairnError::DecryptionFailed);
        }
        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(&payload.encryption_key);
        Ok(Self { encryption_key })
    }
}

fn key_aad(kdf: &KdfParams, mode: EncryptionMode) -> Result<Vec<u8>> {
    let mut aad = rmp_serde::to_vec(kdf)
        .map_err(|e| CairnError::KeyDerivation(format!("serialize kdf aad: {e}")))?;
    aad.extend_from_slice(mode.as_str().as_bytes());
    Ok(aad)
}

/// Derive a 32-byte key from a passphrase using Argon2id.
fn derive_key_from_passphrase(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}
