pub mod blob;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod repo;
pub mod storage;
pub mod util;

pub use blob::{BlobHandle, BlobType, PackedBlob};
pub use crypto::id::Id;
pub use error::{CairnError, Result};
pub use repo::Repository;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
