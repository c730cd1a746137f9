use crate::blob::BlobType;
use crate::crypto::CryptoEngine;
use crate::error::{CairnError, Result};

/// Domain-separation marker for object identity binding in AEAD AAD.
const OBJECT_CONTEXT_AAD_PREFIX: &[u8] = b"cairn:object-context:v1\0";

/// Object type tags for the repo envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Config = 0,
    DataBlob = 1,
    TreeBlob = 2,
    PackTrailer = 3,
    Index = 4,
    Snapshot = 5,
    Lock = 6,
}

impl ObjectType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Config),
            1 => Ok(Self::DataBlob),
            2 => Ok(Self::TreeBlob),
            3 => Ok(Self::PackTrailer),
            4 => Ok(Self::Index),
            5 => Ok(Self::Snapshot),
            6 => Ok(Self::Lock),
            _ => Err(CairnError::UnknownObjectType(v)),
        }
    }

    pub fn for_blob(blob_type: BlobType) -> Self {
        match blob_type {
            BlobType::Data => Self::DataBlob,
            BlobType::Tree => Self::TreeBlob,
        }
    }
}

fn contextual_aad(tag: u8, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + OBJECT_CONTEXT_AAD_PREFIX.len() + context.len());
    aad.push(tag);
    aad.extend_from_slice(OBJECT_CONTEXT_AAD_PREFIX);
    aad.extend_from_slice(context);
    aad
}

/// Serialize a payload into an encrypted repo object bound to `context`
/// (a blob id, a file-type name, ...).
///
/// Wire format (encrypted): `[1-byte type_tag][12-byte nonce][ciphertext + 16-byte tag]`
///
/// Wire format (plaintext): `[1-byte type_tag][plaintext]`
pub fn pack_object_with_context(
    obj_type: ObjectType,
    context: &[u8],
    plaintext: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let tag = obj_type as u8;
    let encrypted = crypto.encrypt(plaintext, &contextual_aad(tag, context))?;

    let mut out = Vec::with_capacity(1 + encrypted.len());
    out.push(tag);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Decrypt a repo object bound to `context`, ensuring its type tag matches.
///
/// The AEAD check runs before the type comparison, so a tampered tag surfaces
/// as `DecryptionFailed` on encrypted repositories.
pub fn unpack_object_expect_with_context(
    data: &[u8],
    expected_type: ObjectType,
    context: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let (&tag, encrypted) = data
        .split_first()
        .ok_or_else(|| CairnError::InvalidFormat("empty object".into()))?;
    let plaintext = crypto.decrypt(encrypted, &contextual_aad(tag, context))?;
    let obj_type = ObjectType::from_u8(tag)?;
    if obj_type != expected_type {
        return Err(CairnError::InvalidFormat(format!(
            "unexpected object type: expected {expected_type:?}, got {obj_type:?}"
        )));
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes_gcm::Aes256GcmEngine;
    use crate::crypto::PlaintextEngine;

    #[test]
    fn plaintext_envelope_is_tag_plus_payload() {
        let packed =
            pack_object_with_context(ObjectType::Index, b"index", b"abc", &PlaintextEngine)
                .unwrap();
        assert_eq!(packed, vec![4, b'a', b'b', b'c']);
    }

    #[test]
    fn roundtrip_encrypted() {
        let engine = Aes256GcmEngine::new(&[7u8; 32]);
        let packed =
            pack_object_with_context(ObjectType::DataBlob, b"ctx", b"payload", &engine).unwrap();
        let plain =
            unpack_object_expect_with_context(&packed, ObjectType::DataBlob, b"ctx", &engine)
                .unwrap();
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn wrong_context_fails_authentication() {
        let engine = Aes256GcmEngine::new(&[7u8; 32]);
        let packed =
            pack_object_with_context(ObjectType::DataBlob, b"id-a", b"payload", &engine).unwrap();
        let err = unpack_object_expect_with_context(&packed, ObjectType::DataBlob, b"id-b", &engine)
            .unwrap_err();
        assert!(matches!(err, CairnError::DecryptionFailed));
    }

    #[test]
    fn swapped_type_tag_fails_authentication() {
        let engine = Aes256GcmEngine::new(&[7u8; 32]);
        let mut packed =
            pack_object_with_context(ObjectType::DataBlob, b"ctx", b"payload", &engine).unwrap();
        packed[0] = ObjectType::TreeBlob as u8;
        assert!(
            unpack_object_expect_with_context(&packed, ObjectType::TreeBlob, b"ctx", &engine)
                .is_err()
        );
    }

    #[test]
    fn unexpected_type_is_invalid_format() {
        let packed =
            pack_object_with_context(ObjectType::Snapshot, b"", b"x", &PlaintextEngine).unwrap();
        let err =
            unpack_object_expect_with_context(&packed, ObjectType::Index, b"", &PlaintextEngine)
                .unwrap_err();
        assert!(matches!(err, CairnError::InvalidFormat(_)));
    }

    #[test]
    fn empty_and_unknown_tags_are_rejected() {
        assert!(unpack_object_expect_with_context(&[], ObjectType::Index, b"", &PlaintextEngine)
            .is_err());
        assert!(matches!(
            unpack_object_expect_with_context(&[99, 1], ObjectType::Index, b"", &PlaintextEngine),
            Err(CairnError::UnknownObjectType(99))
        ));
    }
}
