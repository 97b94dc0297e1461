//! Installer: materializes a manifest into an install root.
//!
//! Layout of an install root during and after a run:
//!
//! ```text
//! <root>/python/...          installed packages (the layer folder)
//! <root>/.staging/python     backend target while installing
//! <root>/.staging/cache      backend download/build cache
//! ```
//!
//! Packages only reach `<root>/python` through a final rename, and
//! `.staging` is removed whatever the outcome, so a failed or cancelled run
//! leaves the root empty.

mod pip;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use crate::cancel::Cancellation;
use crate::cleanup::{CleanupGuard, SharedCleanupContext};
use crate::error::{LayerError, classify};
use crate::manifest::PackageManifest;
use crate::runtime::Runtime;

pub use pip::PipBackend;

/// Folder name the Lambda Python runtime adds to its import path.
/// Fixed by the consuming runtime, not configurable.
pub const LAYER_DIR: &str = "python";

const STAGING_DIR: &str = ".staging";
const CACHE_DIR: &str = "cache";
const BYTECODE_DIR: &str = "__pycache__";

/// Installs packages into a target directory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageBackend: Send + Sync {
    /// Install every declared package and its dependencies into `target`,
    /// keeping downloads and build artifacts under `cache_dir`.
    async fn install(
        &self,
        manifest: &PackageManifest,
        target: &Path,
        cache_dir: &Path,
    ) -> Result<()>;
}

/// Directory tree owned by one packaging run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRoot {
    base: PathBuf,
}

impl InstallRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    /// `<root>/python`
    pub fn layer_dir(&self) -> PathBuf {
        self.base.join(LAYER_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.base.join(STAGING_DIR)
    }

    fn staged_layer_dir(&self) -> PathBuf {
        self.staging_dir().join(LAYER_DIR)
    }

    fn cache_dir(&self) -> PathBuf {
        self.staging_dir().join(CACHE_DIR)
    }

    /// Empties the root (creating it if needed) so a run starts clean.
    ///
    /// Only entries an earlier run could have left are removed. A root holding
    /// anything else is refused untouched.
    #[tracing::instrument(skip(runtime))]
    pub fn reset<R: Runtime>(&self, runtime: &R) -> Result<()> {
        if runtime.exists(&self.base) {
            if !runtime.is_dir(&self.base) {
                anyhow::bail!("Install root {:?} is not a directory", self.base);
            }
            let entries = runtime.read_dir(&self.base)?;
            if let Some(foreign) = entries.iter().find(|e| !is_owned_entry(e)) {
                return Err(LayerError::Validation(format!(
                    "install root {:?} contains {:?}, which layerpack did not create; \
                     use an empty or dedicated directory",
                    self.base, foreign
                ))
                .into());
            }
            for entry in entries {
                debug!("Clearing {:?}", entry);
                if runtime.is_dir(&entry) {
                    runtime.remove_dir_all(&entry)?;
                } else {
                    runtime.remove_file(&entry)?;
                }
            }
        }
        runtime
            .create_dir_all(&self.base)
            .with_context(|| format!("Failed to create install root {:?}", self.base))
    }
}

fn is_owned_entry(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name == LAYER_DIR || name == STAGING_DIR)
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledTree {
    pub root: PathBuf,
    pub layer_dir: PathBuf,
    pub file_count: usize,
    /// Bytecode caches removed after the backend finished
    pub removed_cache_entries: usize,
}

pub struct Installer<'a, R: Runtime> {
    runtime: &'a R,
    backend: &'a dyn PackageBackend,
    cleanup: Option<SharedCleanupContext>,
}

impl<'a, R: Runtime> Installer<'a, R> {
    pub fn new(runtime: &'a R, backend: &'a dyn PackageBackend) -> Self {
        Self {
            runtime,
            backend,
            cleanup: None,
        }
    }

    /// Registers the staging directory for removal on Ctrl-C.
    pub fn with_cleanup(mut self, ctx: SharedCleanupContext) -> Self {
        self.cleanup = Some(ctx);
        self
    }

    /// Installs `manifest` into `root`, all or nothing.
    #[tracing::instrument(skip(self, manifest, cancel))]
    pub async fn install(
        &self,
        manifest: &PackageManifest,
        root: &InstallRoot,
        cancel: &Cancellation,
    ) -> Result<InstalledTree> {
        if cancel.is_cancelled() {
            return Err(LayerError::Cancelled.into());
        }

        root.reset(self.runtime)
            .map_err(|e| classify(e, LayerError::Resolution))?;

        let staging = root.staging_dir();
        let _guard = self
            .cleanup
            .as_ref()
            .map(|ctx| CleanupGuard::new(ctx, staging.clone()));

        let result = self.install_staged(manifest, root, cancel).await;

        if self.runtime.exists(&staging)
            && let Err(e) = self.runtime.remove_dir_all(&staging)
        {
            warn!("Failed to remove staging directory {:?}: {}", staging, e);
        }

        match result {
            Ok(tree) => {
                info!(
                    "Installed {} package(s), {} file(s) in {:?}",
                    manifest.len(),
                    tree.file_count,
                    tree.layer_dir
                );
                Ok(tree)
            }
            Err(e) => {
                debug!("Install failed, discarding {:?}", root.path());
                if let Err(reset_err) = root.reset(self.runtime) {
                    warn!("Failed to clear install root {:?}: {}", root.path(), reset_err);
                }
                Err(classify(e, LayerError::Resolution))
            }
        }
    }

    async fn install_staged(
        &self,
        manifest: &PackageManifest,
        root: &InstallRoot,
        cancel: &Cancellation,
    ) -> Result<InstalledTree> {
        let staged = root.staged_layer_dir();
        let cache = root.cache_dir();
        self.runtime.create_dir_all(&staged)?;
        self.runtime.create_dir_all(&cache)?;

        info!("Installing {} package(s)...", manifest.len());
        tokio::select! {
            result = self.backend.install(manifest, &staged, &cache) => result?,
            _ = cancel.cancelled() => return Err(LayerError::Cancelled.into()),
        }

        let removed_cache_entries = strip_bytecode(self.runtime, &staged)?;
        if removed_cache_entries > 0 {
            debug!("Removed {} bytecode cache entries", removed_cache_entries);
        }

        let file_count = count_files(self.runtime, &staged)?;
        if file_count == 0 {
            return Err(LayerError::Resolution(
                "the installer completed but produced no files".to_string(),
            )
            .into());
        }

        let layer_dir = root.layer_dir();
        self.runtime
            .rename(&staged, &layer_dir)
            .with_context(|| format!("Failed to move installed packages into {:?}", layer_dir))?;

        Ok(InstalledTree {
            root: root.path().to_path_buf(),
            layer_dir,
            file_count,
            removed_cache_entries,
        })
    }
}

/// Removes `__pycache__` directories and stray `.pyc` files below `dir`.
fn strip_bytecode<R: Runtime>(runtime: &R, dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in runtime.read_dir(dir)? {
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if runtime.is_dir(&entry) && !runtime.is_symlink(&entry) {
            if name == BYTECODE_DIR {
                runtime.remove_dir_all(&entry)?;
                removed += 1;
            } else {
                removed += strip_bytecode(runtime, &entry)?;
            }
        } else if name.ends_with(".pyc") {
            runtime.remove_file(&entry)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn count_files<R: Runtime>(runtime: &R, dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in runtime.read_dir(dir)? {
        if runtime.is_dir(&entry) && !runtime.is_symlink(&entry) {
            count += count_files(runtime, &entry)?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}
