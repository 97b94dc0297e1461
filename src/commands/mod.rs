use anyhow::Result;
use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::{
    cancel::Cancellation,
    cleanup::SharedCleanupContext,
    install::{InstallRoot, PipBackend},
    manifest::{ManifestSource, PackageManifest},
    publish::LayerVersion,
    runtime::Runtime,
    state::PublishLedger,
};

pub mod config;
mod archive;
mod attach;
mod build;
mod check;
mod inspect;
mod install;
mod publish;

pub use archive::archive;
pub use attach::attach;
pub use build::{BuildArgs, build};
pub use check::check;
pub use inspect::inspect;
pub use install::install;
pub use publish::{PublishArgs, publish};

/// Manifest files and inline package declarations, read in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestInput {
    pub files: Vec<PathBuf>,
    pub packages: Vec<String>,
}

impl ManifestInput {
    pub fn read<R: Runtime>(&self, runtime: &R) -> Result<PackageManifest> {
        let mut sources = Vec::with_capacity(self.files.len() + 1);
        for file in &self.files {
            sources.push(ManifestSource::from_file(runtime, file)?);
        }
        if !self.packages.is_empty() {
            sources.push(ManifestSource::inline(&self.packages));
        }
        PackageManifest::from_sources(&sources)
    }
}

/// How packages are installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub root: PathBuf,
    pub python: String,
    pub platform: Option<String>,
    pub python_version: Option<String>,
    pub index_url: Option<String>,
}

impl InstallOptions {
    pub fn install_root(&self) -> InstallRoot {
        InstallRoot::new(&self.root)
    }

    pub fn backend(&self) -> PipBackend {
        PipBackend::new(&self.python)
            .with_platform(self.platform.clone())
            .with_python_version(self.python_version.clone())
            .with_index_url(self.index_url.clone())
    }
}

/// Ledger location: the explicit path, or `~/.layerpack/state.json`.
pub fn ledger_path<R: Runtime>(runtime: &R, state_file: Option<&Path>) -> Result<PathBuf> {
    match state_file {
        Some(path) => Ok(path.to_path_buf()),
        None => PublishLedger::default_path(runtime),
    }
}

/// Records a publish in the ledger. A ledger failure only warns: the
/// version already exists remotely.
pub(crate) fn record_publish<R: Runtime>(
    runtime: &R,
    state_file: Option<&Path>,
    published: &LayerVersion,
    sha256: &str,
) {
    let result = ledger_path(runtime, state_file).and_then(|path| {
        let mut ledger = PublishLedger::load(runtime, &path)?;
        ledger.record(published, sha256, time::OffsetDateTime::now_utc());
        ledger.save(runtime, &path)
    });
    if let Err(e) = result {
        warn!("Publish ledger not updated: {:#}", e);
    }
}

pub(crate) fn print_layer_version(version: &LayerVersion, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(version)?);
    } else {
        println!("Published {}", version.arn);
        println!("   version: {}", version.version);
        println!("   runtimes: {}", version.compatible_runtimes.join(", "));
    }
    Ok(())
}

/// Watches for Ctrl-C. The first signal cancels the run so stages can stop
/// and clean up; a second one removes registered scratch paths and exits.
pub fn spawn_interrupt_handler(
    cancel: Cancellation,
    cleanup: SharedCleanupContext,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nInterrupted, stopping...");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted again, cleaning up...");
            if let Ok(mut ctx) = cleanup.lock() {
                let removed = ctx.cleanup();
                debug!("Removed {} scratch path(s)", removed);
            }
            std::process::exit(130); // Standard exit code for Ctrl-C
        }
    })
}
