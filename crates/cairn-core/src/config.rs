use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compress::Compression;
use crate::error::{CairnError, Result};

/// Hard upper bound for a pack's target size.
pub const MAX_PACK_SIZE: u32 = 512 * 1024 * 1024;

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 2;

/// Per-session tuning of a repository handle, read from YAML.
///
/// ```yaml
/// pack_size: 33554432
/// upload_concurrency: 4
/// compression:
///   algorithm: zstd
///   zstd_level: 6
/// kdf:
///   time_cost: 3
///   memory_cost: 65536
///   parallelism: 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryOptions {
    /// Target size of a pack before it is sealed and uploaded.
    #[serde(default = "default_pack_size")]
    pub pack_size: u32,
    /// Maximum number of packs uploading in the background at once.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Argon2id cost for newly created keys.
    #[serde(default)]
    pub kdf: KdfConfig,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            pack_size: default_pack_size(),
            upload_concurrency: default_upload_concurrency(),
            compression: CompressionConfig::default(),
            kdf: KdfConfig::default(),
        }
    }
}

impl RepositoryOptions {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let options: RepositoryOptions = serde_yaml::from_str(yaml)
            .map_err(|e| CairnError::Config(format!("invalid options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CairnError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pack_size == 0 {
            return Err(CairnError::Config("pack_size must be greater than 0".into()));
        }
        if self.pack_size > MAX_PACK_SIZE {
            return Err(CairnError::Config(format!(
                "pack_size ({}) exceeds hard limit of 512 MiB",
                self.pack_size
            )));
        }
        if self.upload_concurrency == 0 {
            return Err(CairnError::Config(
                "upload_concurrency must be at least 1".into(),
            ));
        }
        self.compression.validate()?;
        self.kdf.validate()
    }

    pub fn compression(&self) -> Compression {
        Compression::from_algorithm(self.compression.algorithm, self.compression.zstd_level)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            zstd_level: default_zstd_level(),
        }
    }
}

impl CompressionConfig {
    fn validate(&self) -> Result<()> {
        if self.algorithm == CompressionAlgorithm::Zstd && !(1..=22).contains(&self.zstd_level) {
            return Err(CairnError::Config(format!(
                "zstd_level ({}) must be between 1 and 22",
                self.zstd_level
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfConfig {
    #[serde(default = "default_time_cost")]
    pub time_cost: u32,
    /// KiB.
    #[serde(default = "default_memory_cost")]
    pub memory_cost: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            time_cost: default_time_cost(),
            memory_cost: default_memory_cost(),
            parallelism: default_parallelism(),
        }
    }
}

impl KdfConfig {
    fn validate(&self) -> Result<()> {
        argon2::Params::new(self.memory_cost, self.time_cost, self.parallelism, Some(32))
            .map(|_| ())
            .map_err(|e| CairnError::Config(format!("invalid kdf parameters: {e}")))
    }
}

/// Content-defined chunking parameters, persisted in the repository config.
/// The chunker itself lives outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    #[serde(default = "default_avg_size")]
    pub avg_size: u32,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            avg_size: default_avg_size(),
            max_size: default_max_size(),
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(CairnError::Config(format!(
                "chunker sizes must satisfy 0 < min <= avg <= max (got {}/{}/{})",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        Ok(())
    }
}

fn default_pack_size() -> u32 {
    32 * 1024 * 1024 // 32 MiB
}

fn default_upload_concurrency() -> usize {
    DEFAULT_UPLOAD_CONCURRENCY
}

fn default_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Lz4
}

fn default_zstd_level() -> i32 {
    3
}

fn default_time_cost() -> u32 {
    3
}

fn default_memory_cost() -> u32 {
    65536 // 64 MiB
}

fn default_parallelism() -> u32 {
    4
}

fn default_min_size() -> u32 {
    512 * 1024 // 512 KiB
}

fn default_avg_size() -> u32 {
    2 * 1024 * 1024 // 2 MiB
}

fn default_max_size() -> u32 {
    8 * 1024 * 1024 // 8 MiB
}
