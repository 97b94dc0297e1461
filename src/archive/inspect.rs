use anyhow::{Context, Result};
use log::debug;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

use super::sha256_hex;
use crate::error::{LayerError, classify};
use crate::install::LAYER_DIR;
use crate::runtime::Runtime;

/// What an existing archive contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    /// Entry names in archive order
    pub entries: Vec<String>,
    /// Distinct first path components, sorted
    pub top_level: Vec<String>,
    pub size: u64,
    pub sha256: String,
}

impl ArchiveSummary {
    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.ends_with('/')).count()
    }
}

/// Reads the entry list of a zip archive.
#[tracing::instrument(skip(runtime))]
pub fn inspect_archive<R: Runtime>(runtime: &R, path: &Path) -> Result<ArchiveSummary> {
    read_summary(runtime, path).map_err(|e| classify(e, LayerError::Archive))
}

fn read_summary<R: Runtime>(runtime: &R, path: &Path) -> Result<ArchiveSummary> {
    let mut reader = runtime
        .open(path)
        .with_context(|| format!("Failed to open archive at {:?}", path))?;

    // ZipArchive needs Seek; Runtime::open only gives Read
    let mut buffer = Vec::new();
    reader
        .read_to_end(&mut buffer)
        .with_context(|| format!("Failed to read archive {:?}", path))?;
    summarize(&buffer, path)
}

/// Summarizes archive bytes already in memory. `path` only labels errors.
pub fn inspect_bytes(bytes: &[u8], path: &Path) -> Result<ArchiveSummary> {
    summarize(bytes, path).map_err(|e| classify(e, LayerError::Archive))
}

fn summarize(bytes: &[u8], path: &Path) -> Result<ArchiveSummary> {
    let size = bytes.len() as u64;
    let sha256 = sha256_hex(bytes);

    let mut archive = ZipArchive::new(std::io::Cursor::new(bytes))
        .with_context(|| format!("{:?} is not a valid zip archive", path))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .with_context(|| format!("Failed to read ZIP entry {}", i))?;
        entries.push(entry.name().to_string());
    }
    let top_level: BTreeSet<String> = entries
        .iter()
        .filter_map(|name| name.split('/').next())
        .filter(|first| !first.is_empty())
        .map(str::to_string)
        .collect();

    debug!("{:?}: {} entries", path, entries.len());
    Ok(ArchiveSummary {
        entries,
        top_level: top_level.into_iter().collect(),
        size,
        sha256,
    })
}

/// Checks that every entry lives under the layer folder, so the runtime
/// finds the packages on its import path.
pub fn verify_layout(summary: &ArchiveSummary) -> Result<()> {
    if summary.entries.is_empty() {
        return Err(LayerError::Validation("archive is empty".to_string()).into());
    }

    let prefix = format!("{}/", LAYER_DIR);
    let misplaced: Vec<&str> = summary
        .entries
        .iter()
        .filter(|e| !e.starts_with(&prefix))
        .map(String::as_str)
        .collect();

    if misplaced.is_empty() {
        return Ok(());
    }

    let shown: Vec<&str> = misplaced.iter().take(5).copied().collect();
    Err(LayerError::Validation(format!(
        "{} entr{} outside '{}': {}{}",
        misplaced.len(),
        if misplaced.len() == 1 { "y is" } else { "ies are" },
        prefix,
        shown.join(", "),
        if misplaced.len() > shown.len() { ", ..." } else { "" }
    ))
    .into())
}
