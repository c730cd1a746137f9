use std::cell::RefCell;
use std::io::Read;

use crate::config::CompressionAlgorithm;
use crate::error::{CairnError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Upper bound on decompressed output. Blobs are capped well below this, so
/// anything larger is a decompression bomb.
pub const MAX_DECOMPRESS_SIZE: u64 = 32 * 1024 * 1024;

/// Pluggable codec applied to blob plaintext before encryption.
/// The encoded form starts with a 1-byte tag so readers never need config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    pub fn from_algorithm(algorithm: CompressionAlgorithm, zstd_level: i32) -> Self {
        match algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd { level: zstd_level },
        }
    }
}

thread_local! {
    static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
        const { RefCell::new(None) };
}

fn zstd_compress(level: i32, data: &[u8]) -> Result<Vec<u8>> {
    ZSTD_CX.with(|cell| {
        let mut slot = cell.borrow_mut();
        // Lazily init or reinit if the compression level changed.
        if !matches!(slot.as_ref(), Some((l, _)) if *l == level) {
            let cx = zstd::bulk::Compressor::new(level)
                .map_err(|e| CairnError::Other(format!("zstd init: {e}")))?;
            *slot = Some((level, cx));
        }
        let Some((_, cx)) = slot.as_mut() else {
            return Err(CairnError::Other("zstd context unavailable".into()));
        };
        cx.compress(data)
            .map_err(|e| CairnError::Other(format!("zstd compress: {e}")))
    })
}

/// Compress data and prepend the codec tag.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let (tag, body) = match compression {
        Compression::None => (TAG_NONE, None),
        Compression::Lz4 => (TAG_LZ4, Some(lz4_flex::compress_prepend_size(data))),
        Compression::Zstd { level } => (TAG_ZSTD, Some(zstd_compress(level, data)?)),
    };
    let body = body.as_deref().unwrap_or(data);
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_with_hint(data, None)
}

/// Like [`decompress`], with a capacity hint (e.g. the indexed uncompressed
/// length). The hint is capped and never bypasses the size limit.
pub fn decompress_with_hint(data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
    let (&tag, payload) = data
        .split_first()
        .ok_or_else(|| CairnError::Decompression("empty data".into()))?;
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            let size_prefix: [u8; 4] = payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| CairnError::Decompression("lz4: payload too short".into()))?;
            let uncompressed_size = u32::from_le_bytes(size_prefix) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| CairnError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| CairnError::Decompression(format!("zstd init: {e}")))?;
            let capacity = expected_size
                .unwrap_or(0)
                .min(MAX_DECOMPRESS_SIZE as usize);
            let mut output = Vec::with_capacity(capacity);
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| CairnError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        _ => Err(CairnError::UnknownCompressionTag(tag)),
    }
}
