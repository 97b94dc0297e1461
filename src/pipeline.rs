//! End-to-end packaging run.
//!
//! ```text
//! Read -> Installed -> Archived -> RoutedDirect | RoutedStaged -> Published
//! ```
//!
//! Any stage may end the run in `Failed(stage)`. Stages are never retried;
//! errors carry the failing stage as context.

use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

use crate::archive::{Archiver, LayerArchive};
use crate::cancel::Cancellation;
use crate::cleanup::SharedCleanupContext;
use crate::error::{LayerError, classify};
use crate::install::{InstallRoot, InstalledTree, Installer, PackageBackend};
use crate::manifest::PackageManifest;
use crate::publish::{self, LayerVersion, PublishOptions, Publisher, staging_key};
use crate::router::{Route, SizeRouter};
use crate::runtime::Runtime;
use crate::state::{LedgerEntry, PublishLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Read,
    Install,
    Archive,
    Route,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Read => "read",
            Stage::Install => "install",
            Stage::Archive => "archive",
            Stage::Route => "route",
            Stage::Publish => "publish",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Read,
    Installed,
    Archived,
    RoutedDirect,
    RoutedStaged,
    Published,
    Failed(Stage),
}

/// Where and how an archive is published.
#[derive(Debug, Clone)]
pub struct PublishTarget {
    pub layer_name: String,
    pub options: PublishOptions,
    pub router: SizeRouter,
    pub staging_bucket: Option<String>,
    pub staging_prefix: String,
}

impl PublishTarget {
    pub fn new(layer_name: impl Into<String>, options: PublishOptions) -> Self {
        Self {
            layer_name: layer_name.into(),
            options,
            router: SizeRouter::default(),
            staging_bucket: None,
            staging_prefix: String::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        publish::validate(&self.layer_name, &self.options)
    }

    /// Picks the route for an archive of `size` bytes. A staged route with no
    /// staging bucket is a validation error.
    pub fn route(&self, size: u64) -> Result<Route> {
        let route = self.router.route(size);
        if route == Route::Staged && self.staging_bucket.is_none() {
            return Err(LayerError::Validation(format!(
                "archive is {} bytes, above the direct upload limit of {} bytes; \
                 configure a staging bucket",
                size,
                self.router.threshold()
            ))
            .into());
        }
        Ok(route)
    }

    /// Publishes `bytes` along `route`, uploading to the staging bucket first
    /// when staged.
    pub async fn publish(
        &self,
        publisher: &Publisher<'_>,
        bytes: Vec<u8>,
        route: Route,
        cancel: &Cancellation,
    ) -> Result<LayerVersion> {
        match (route, &self.staging_bucket) {
            (Route::Staged, Some(bucket)) => {
                let sha256 = crate::archive::sha256_hex(&bytes);
                let key = staging_key(&self.staging_prefix, &self.layer_name, &sha256);
                let blob = publisher.upload_archive(bucket, &key, bytes, cancel).await?;
                publisher
                    .publish_staged(&self.layer_name, &blob, &self.options, cancel)
                    .await
            }
            (Route::Staged, None) => {
                Err(LayerError::Validation("no staging bucket configured".to_string()).into())
            }
            (Route::Direct, _) => {
                publisher
                    .publish_direct(&self.layer_name, &bytes, &self.options, cancel)
                    .await
            }
        }
    }
}

/// Everything a run needs besides the manifest.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub target: PublishTarget,
    pub install_root: InstallRoot,
    pub output: PathBuf,
    pub excludes: Vec<String>,
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Published(LayerVersion),
    /// The archive matched the last recorded publish; nothing was sent
    Unchanged(LedgerEntry),
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub states: Vec<PipelineState>,
    pub installed: InstalledTree,
    pub archive: LayerArchive,
    pub route: Option<Route>,
    pub outcome: Outcome,
}

pub struct Pipeline<'a, R: Runtime> {
    runtime: &'a R,
    backend: &'a dyn PackageBackend,
    publisher: Publisher<'a>,
    ledger_path: Option<PathBuf>,
    cleanup: Option<SharedCleanupContext>,
    states: Vec<PipelineState>,
}

impl<'a, R: Runtime> Pipeline<'a, R> {
    pub fn new(runtime: &'a R, backend: &'a dyn PackageBackend, publisher: Publisher<'a>) -> Self {
        Self {
            runtime,
            backend,
            publisher,
            ledger_path: None,
            cleanup: None,
            states: Vec::new(),
        }
    }

    /// Enables the publish ledger stored at `path`.
    pub fn with_ledger(mut self, path: PathBuf) -> Self {
        self.ledger_path = Some(path);
        self
    }

    pub fn with_cleanup(mut self, ctx: SharedCleanupContext) -> Self {
        self.cleanup = Some(ctx);
        self
    }

    /// States entered so far, including a final `Failed` state.
    pub fn states(&self) -> &[PipelineState] {
        &self.states
    }

    fn enter(&mut self, state: PipelineState) {
        info!("Pipeline state: {:?}", state);
        self.states.push(state);
    }

    fn check<T>(&mut self, stage: Stage, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            self.states.push(PipelineState::Failed(stage));
            e.context(format!("stage '{}' failed", stage))
        })
    }

    fn check_cancelled(&mut self, stage: Stage, cancel: &Cancellation) -> Result<()> {
        let result = if cancel.is_cancelled() {
            Err(LayerError::Cancelled.into())
        } else {
            Ok(())
        };
        self.check(stage, result)
    }

    #[tracing::instrument(skip_all, fields(layer = %config.target.layer_name))]
    pub async fn run(
        &mut self,
        manifest: &PackageManifest,
        config: &PipelineConfig,
        cancel: &Cancellation,
    ) -> Result<PipelineReport> {
        self.states.clear();
        self.enter(PipelineState::Read);

        // Settings are checked before anything is installed or sent
        let validation = config.target.validate();
        self.check(Stage::Read, validation)?;

        let mut ledger = match self.ledger_path.clone() {
            Some(path) => match PublishLedger::load(self.runtime, &path) {
                Ok(ledger) => Some(ledger),
                // Skipping needs the last recorded digest
                Err(e) if config.skip_unchanged => {
                    let failed: Result<PublishLedger> = Err(classify(e, LayerError::Validation));
                    Some(self.check(Stage::Read, failed)?)
                }
                Err(e) => {
                    warn!("Publish ledger ignored for this run: {:#}", e);
                    None
                }
            },
            None => None,
        };

        // Install
        let mut installer = Installer::new(self.runtime, self.backend);
        if let Some(ctx) = &self.cleanup {
            installer = installer.with_cleanup(ctx.clone());
        }
        let installed = installer
            .install(manifest, &config.install_root, cancel)
            .await;
        let installed = self.check(Stage::Install, installed)?;
        self.enter(PipelineState::Installed);

        // Archive
        self.check_cancelled(Stage::Archive, cancel)?;
        let archive = self.build_archive(config);
        let archive = self.check(Stage::Archive, archive)?;
        self.enter(PipelineState::Archived);

        if config.skip_unchanged
            && let Some(entry) = ledger.as_ref().and_then(|l| {
                l.unchanged(
                    &config.target.layer_name,
                    &archive.sha256,
                    &config.target.options.compatible_runtimes,
                )
            })
        {
            info!(
                "Archive unchanged since version {} of '{}', not publishing",
                entry.version, config.target.layer_name
            );
            return Ok(PipelineReport {
                states: self.states.clone(),
                installed,
                archive,
                route: None,
                outcome: Outcome::Unchanged(entry.clone()),
            });
        }

        // Route
        let route = config.target.route(archive.size);
        let route = self.check(Stage::Route, route)?;
        self.enter(match route {
            Route::Direct => PipelineState::RoutedDirect,
            Route::Staged => PipelineState::RoutedStaged,
        });

        // Publish
        let published = self.publish(&config.target, &archive, route, cancel).await;
        let published = self.check(Stage::Publish, published)?;
        self.enter(PipelineState::Published);
        info!(
            "Published {} (version {})",
            published.arn, published.version
        );

        if let (Some(ledger), Some(path)) = (ledger.as_mut(), &self.ledger_path) {
            ledger.record(&published, &archive.sha256, OffsetDateTime::now_utc());
            // The version already exists remotely
            if let Err(e) = ledger.save(self.runtime, path) {
                warn!("{:#}", e);
            }
        }

        Ok(PipelineReport {
            states: self.states.clone(),
            installed,
            archive,
            route: Some(route),
            outcome: Outcome::Published(published),
        })
    }

    fn build_archive(&self, config: &PipelineConfig) -> Result<LayerArchive> {
        let mut archiver = Archiver::new(self.runtime).with_excludes(&config.excludes)?;
        if let Some(ctx) = &self.cleanup {
            archiver = archiver.with_cleanup(ctx.clone());
        }
        archiver.build(&config.install_root, &config.output)
    }

    async fn publish(
        &self,
        target: &PublishTarget,
        archive: &LayerArchive,
        route: Route,
        cancel: &Cancellation,
    ) -> Result<LayerVersion> {
        let bytes = self
            .runtime
            .read(&archive.path)
            .map_err(|e| classify(e, LayerError::Archive))?;
        if crate::archive::sha256_hex(&bytes) != archive.sha256 {
            return Err(LayerError::Archive(format!(
                "{:?} changed on disk after it was built",
                archive.path
            ))
            .into());
        }
        target.publish(&self.publisher, bytes, route, cancel).await
    }
}
