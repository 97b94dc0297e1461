use anyhow::Result;
use std::path::Path;

use crate::{
    archive::Archiver, cleanup::SharedCleanupContext, install::InstallRoot, runtime::Runtime,
};

/// Archives an existing install root.
#[tracing::instrument(skip(runtime, cleanup))]
pub fn archive<R: Runtime>(
    runtime: R,
    root: &Path,
    output: &Path,
    excludes: &[String],
    cleanup: SharedCleanupContext,
) -> Result<()> {
    let archive = Archiver::new(&runtime)
        .with_excludes(excludes)?
        .with_cleanup(cleanup)
        .build(&InstallRoot::new(root), output)?;

    println!("Wrote {}", archive.path.display());
    println!("   entries: {}", archive.entries);
    println!("   size: {} bytes", archive.size);
    println!("   sha256: {}", archive.sha256);
    Ok(())
}
