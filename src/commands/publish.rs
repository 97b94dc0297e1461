use anyhow::Result;
use log::info;
use std::path::PathBuf;

use super::{config::Config, print_layer_version, record_publish};
use crate::{
    archive::{inspect_bytes, verify_layout},
    cancel::Cancellation,
    error::{LayerError, classify},
    pipeline::PublishTarget,
    publish::{LambdaClient, Publisher, S3BlobStore},
    runtime::Runtime,
};

#[derive(Debug, Clone)]
pub struct PublishArgs {
    /// Pre-built layer archive
    pub archive: PathBuf,
    pub target: PublishTarget,
    pub state_file: Option<PathBuf>,
    pub json: bool,
}

/// Publishes a pre-built archive as a new layer version.
#[tracing::instrument(skip(config, cancel))]
pub async fn publish<R: Runtime>(
    config: Config<R>,
    args: &PublishArgs,
    cancel: &Cancellation,
) -> Result<()> {
    args.target.validate()?;

    // Read once: the digest recorded is that of the bytes sent
    let bytes = config
        .runtime
        .read(&args.archive)
        .map_err(|e| classify(e, LayerError::Archive))?;
    let summary = inspect_bytes(&bytes, &args.archive)?;
    verify_layout(&summary)?;
    let route = args.target.route(summary.size)?;
    info!(
        "{:?}: {} bytes, {} upload",
        args.archive, summary.size, route
    );

    let settings = config.aws_settings()?;
    let service = LambdaClient::new(config.http.clone(), settings.clone());
    let blobs = S3BlobStore::new(config.http.clone(), settings);
    let publisher = Publisher::new(&service).with_blob_store(&blobs);

    let version = args.target.publish(&publisher, bytes, route, cancel).await?;

    record_publish(
        &config.runtime,
        args.state_file.as_deref(),
        &version,
        &summary.sha256,
    );
    print_layer_version(&version, args.json)
}
