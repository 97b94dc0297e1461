use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::{LayerArchive, sha256_hex};
use crate::cleanup::{CleanupGuard, SharedCleanupContext};
use crate::error::{LayerError, classify};
use crate::install::{InstallRoot, LAYER_DIR};
use crate::runtime::Runtime;

const DIR_MODE: u32 = 0o755;
const EXECUTABLE_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const SYMLINK_MODE: u32 = 0o777;

/// One zip entry, in archive order.
#[derive(Debug)]
enum Entry {
    Dir { name: String },
    File { name: String, source: PathBuf, mode: u32 },
    /// Stored as a link; `target` is the link text, relative to the link.
    Symlink { name: String, target: String },
}

/// Builds layer archives from an install root.
pub struct Archiver<'a, R: Runtime> {
    runtime: &'a R,
    excludes: Vec<glob::Pattern>,
    cleanup: Option<SharedCleanupContext>,
}

impl<'a, R: Runtime> Archiver<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self {
            runtime,
            excludes: Vec::new(),
            cleanup: None,
        }
    }

    /// Glob patterns matched against paths relative to the layer folder and
    /// against bare file names, e.g. `tests`, `*.dist-info`, `boto3/examples/*`.
    pub fn with_excludes(mut self, patterns: &[String]) -> Result<Self> {
        for pattern in patterns {
            let compiled = glob::Pattern::new(pattern).map_err(|e| {
                LayerError::Validation(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
            self.excludes.push(compiled);
        }
        Ok(self)
    }

    /// Registers the partial output file for removal on Ctrl-C.
    pub fn with_cleanup(mut self, ctx: SharedCleanupContext) -> Self {
        self.cleanup = Some(ctx);
        self
    }

    /// Archives `<root>/python` into `output`.
    ///
    /// The archive only appears at `output` once it is complete.
    #[tracing::instrument(skip(self))]
    pub fn build(&self, root: &InstallRoot, output: &Path) -> Result<LayerArchive> {
        if output.starts_with(root.layer_dir()) {
            return Err(LayerError::Archive(format!(
                "output {:?} must not be inside the layer folder {:?}",
                output,
                root.layer_dir()
            ))
            .into());
        }

        let (bytes, entries) = archive_bytes(self.runtime, root, &self.excludes)
            .map_err(|e| classify(e, LayerError::Archive))?;

        self.write_atomically(output, &bytes)
            .map_err(|e| classify(e, LayerError::Archive))?;

        let archive = LayerArchive {
            path: output.to_path_buf(),
            size: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
            entries,
        };
        info!(
            "Archived {} entries into {:?} ({} bytes, sha256 {})",
            archive.entries, archive.path, archive.size, archive.sha256
        );
        Ok(archive)
    }

    fn write_atomically(&self, output: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            self.runtime.create_dir_all(parent)?;
        }

        let partial = partial_path(output);
        let _guard = self
            .cleanup
            .as_ref()
            .map(|ctx| CleanupGuard::new(ctx, partial.clone()));

        let result = self
            .runtime
            .write(&partial, bytes)
            .and_then(|_| self.runtime.rename(&partial, output))
            .with_context(|| format!("Failed to write archive {:?}", output));

        if result.is_err()
            && self.runtime.exists(&partial)
            && let Err(e) = self.runtime.remove_file(&partial)
        {
            warn!("Failed to remove partial archive {:?}: {}", partial, e);
        }
        result
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

/// Zip bytes for the layer folder of `root`, plus the number of entries.
///
/// Output depends only on the tree's paths, contents and executable bits:
/// entries are sorted, timestamps are pinned to 1980-01-01 and modes are
/// normalized.
pub fn archive_bytes<R: Runtime>(
    runtime: &R,
    root: &InstallRoot,
    excludes: &[glob::Pattern],
) -> Result<(Vec<u8>, usize)> {
    let layer_dir = root.layer_dir();
    if runtime.is_symlink(&layer_dir) {
        return Err(
            LayerError::Archive(format!("{:?} must not be a symbolic link", layer_dir)).into(),
        );
    }
    if !runtime.is_dir(&layer_dir) {
        return Err(LayerError::Archive(format!(
            "{:?} does not exist; run the install stage first",
            layer_dir
        ))
        .into());
    }

    let mut entries = vec![Entry::Dir {
        name: format!("{}/", LAYER_DIR),
    }];
    collect_entries(runtime, &layer_dir, LAYER_DIR, excludes, &mut entries)?;

    if !entries.iter().any(|e| matches!(e, Entry::File { .. })) {
        return Err(LayerError::Archive(format!("nothing to archive in {:?}", layer_dir)).into());
    }

    let base: FileOptions<()> = FileOptions::default().last_modified_time(DateTime::default());
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    for entry in &entries {
        match entry {
            Entry::Dir { name } => {
                debug!("Adding directory {}", name);
                let options = base
                    .compression_method(CompressionMethod::Stored)
                    .unix_permissions(DIR_MODE);
                zip.add_directory(name.as_str(), options)
                    .with_context(|| format!("Failed to add directory {}", name))?;
            }
            Entry::File { name, source, mode } => {
                let options = base
                    .compression_method(CompressionMethod::Deflated)
                    .unix_permissions(*mode);
                zip.start_file(name.as_str(), options)
                    .with_context(|| format!("Failed to add file {}", name))?;
                let mut reader = runtime.open(source)?;
                std::io::copy(&mut reader, &mut zip)
                    .with_context(|| format!("Failed to read {:?}", source))?;
            }
            Entry::Symlink { name, target } => {
                debug!("Adding symlink {} -> {}", name, target);
                let options = base
                    .compression_method(CompressionMethod::Stored)
                    .unix_permissions(SYMLINK_MODE);
                zip.add_symlink(name.as_str(), target.as_str(), options)
                    .with_context(|| format!("Failed to add symlink {}", name))?;
            }
        }
    }

    let cursor = zip.finish().context("Failed to finalize zip archive")?;
    Ok((cursor.into_inner(), entries.len()))
}

fn collect_entries<R: Runtime>(
    runtime: &R,
    dir: &Path,
    prefix: &str,
    excludes: &[glob::Pattern],
    entries: &mut Vec<Entry>,
) -> Result<()> {
    for path in runtime.read_dir(dir)? {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LayerError::Archive(format!("non UTF-8 file name: {:?}", path)))?;
        let archive_name = format!("{}/{}", prefix, name);
        let relative = &archive_name[LAYER_DIR.len() + 1..];

        if excludes
            .iter()
            .any(|p| p.matches(relative) || p.matches(name))
        {
            debug!("Excluding {}", relative);
            continue;
        }

        // Stored as links, never followed
        if runtime.is_symlink(&path) {
            let target = runtime.read_link(&path)?;
            if !link_stays_inside(relative, &target) {
                return Err(LayerError::Archive(format!(
                    "symlink {} points outside the layer folder: {:?}",
                    relative, target
                ))
                .into());
            }
            let target = target.to_str().ok_or_else(|| {
                LayerError::Archive(format!("non UTF-8 symlink target: {:?}", target))
            })?;
            entries.push(Entry::Symlink {
                name: archive_name,
                target: target.to_string(),
            });
            continue;
        }

        if runtime.is_dir(&path) {
            entries.push(Entry::Dir {
                name: format!("{}/", archive_name),
            });
            collect_entries(runtime, &path, &archive_name, excludes, entries)?;
        } else {
            let mode = if runtime.file_mode(&path)? & 0o111 != 0 {
                EXECUTABLE_MODE
            } else {
                FILE_MODE
            };
            entries.push(Entry::File {
                name: archive_name,
                source: path,
                mode,
            });
        }
    }
    Ok(())
}

/// Whether a link at `relative` (inside the layer folder) resolving to
/// `target` stays inside the layer folder, judged on the path text alone.
fn link_stays_inside(relative: &str, target: &Path) -> bool {
    let mut depth = relative.matches('/').count();
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
