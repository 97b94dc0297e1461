use anyhow::Result;
use log::warn;
use std::path::PathBuf;

use super::{InstallOptions, ManifestInput, config::Config, ledger_path, print_layer_version};
use crate::{
    cancel::Cancellation,
    cleanup::SharedCleanupContext,
    error::{LayerError, classify},
    pipeline::{Outcome, Pipeline, PipelineConfig, PublishTarget},
    publish::{LambdaClient, Publisher, S3BlobStore},
    runtime::Runtime,
};

#[derive(Debug, Clone)]
pub struct BuildArgs {
    pub input: ManifestInput,
    pub install: InstallOptions,
    pub output: PathBuf,
    pub excludes: Vec<String>,
    pub target: PublishTarget,
    pub skip_unchanged: bool,
    pub state_file: Option<PathBuf>,
    pub json: bool,
}

/// Runs the whole pipeline: read, install, archive, route, publish.
#[tracing::instrument(skip(config, cancel, cleanup))]
pub async fn build<R: Runtime>(
    config: Config<R>,
    args: &BuildArgs,
    cancel: &Cancellation,
    cleanup: SharedCleanupContext,
) -> Result<()> {
    let manifest = args.input.read(&config.runtime)?;
    args.target.validate()?;
    // Credentials and region are resolved before installing
    let settings = config.aws_settings()?;

    let service = LambdaClient::new(config.http.clone(), settings.clone());
    let blobs = S3BlobStore::new(config.http.clone(), settings);
    let publisher = Publisher::new(&service).with_blob_store(&blobs);
    let backend = args.install.backend();

    let mut pipeline = Pipeline::new(&config.runtime, &backend, publisher).with_cleanup(cleanup);
    match ledger_path(&config.runtime, args.state_file.as_deref()) {
        Ok(path) => pipeline = pipeline.with_ledger(path),
        Err(e) if args.skip_unchanged => return Err(classify(e, LayerError::Validation)),
        Err(e) => warn!("Publishing without a ledger: {:#}", e),
    }

    let pipeline_config = PipelineConfig {
        target: args.target.clone(),
        install_root: args.install.install_root(),
        output: args.output.clone(),
        excludes: args.excludes.clone(),
        skip_unchanged: args.skip_unchanged,
    };
    println!(
        "Building layer '{}' from {} package(s)",
        args.target.layer_name,
        manifest.len()
    );
    let report = pipeline.run(&manifest, &pipeline_config, cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.outcome)?);
        return Ok(());
    }

    println!(
        "Archived {} file(s) into {} ({} bytes, sha256 {})",
        report.installed.file_count,
        report.archive.path.display(),
        report.archive.size,
        report.archive.sha256
    );
    match &report.outcome {
        Outcome::Published(version) => print_layer_version(version, false),
        Outcome::Unchanged(entry) => {
            println!("Unchanged since version {}: {}", entry.version, entry.arn);
            Ok(())
        }
    }
}
