use anyhow::Result;

use super::{InstallOptions, ManifestInput};
use crate::{
    cancel::Cancellation, cleanup::SharedCleanupContext, install::Installer, runtime::Runtime,
};

/// Installs the manifest into the install root without archiving.
#[tracing::instrument(skip(runtime, cancel, cleanup))]
pub async fn install<R: Runtime>(
    runtime: R,
    input: &ManifestInput,
    options: &InstallOptions,
    cancel: &Cancellation,
    cleanup: SharedCleanupContext,
) -> Result<()> {
    let manifest = input.read(&runtime)?;
    let backend = options.backend();

    println!(
        "Installing {} package(s) with {} into {}",
        manifest.len(),
        backend.python(),
        options.root.display()
    );
    let tree = Installer::new(&runtime, &backend)
        .with_cleanup(cleanup)
        .install(&manifest, &options.install_root(), cancel)
        .await?;

    println!(
        "Installed {} file(s) into {}",
        tree.file_count,
        tree.layer_dir.display()
    );
    Ok(())
}
