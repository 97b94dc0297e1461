//! Layer archives: deterministic zip writing and read-back inspection.

mod inspect;
mod writer;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

pub use inspect::{ArchiveSummary, inspect_archive, inspect_bytes, verify_layout};
pub use writer::{Archiver, archive_bytes};

/// A finished archive on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerArchive {
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256 of the archive bytes
    pub sha256: String,
    pub entries: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
