use std::fmt;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

type Blake2b256 = Blake2b<U32>;

/// A 32-byte content identifier computed as unkeyed BLAKE2b-256.
///
/// Blobs are named by the hash of their plaintext, packs and unpacked
/// objects by the hash of their stored bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub [u8; 32]);

impl Id {
    pub fn compute(data: &[u8]) -> Self {
        let digest = Blake2b256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Id(out)
    }

    /// A random identifier, used for repository ids.
    pub fn random() -> Self {
        let mut out = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Id(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex-encode the full id for use in storage keys.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(CairnError::InvalidFormat(format!(
                "invalid id '{s}': expected 64 hex characters"
            )));
        }
        let bytes =
            hex::decode(s).map_err(|e| CairnError::InvalidFormat(format!("invalid id '{s}': {e}")))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Id(out))
    }

    /// First byte as a two-char hex string, used for the pack shard directory.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}
