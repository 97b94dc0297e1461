use anyhow::Result;
use log::debug;

use super::ManifestInput;
use crate::runtime::Runtime;

/// Reads and validates the manifest without installing anything.
#[tracing::instrument(skip(runtime))]
pub fn check<R: Runtime>(runtime: R, input: &ManifestInput) -> Result<()> {
    let manifest = input.read(&runtime)?;
    debug!("Manifest has {} requirement(s)", manifest.len());

    for requirement in manifest.requirements() {
        println!("{}", requirement);
    }
    println!("{} package(s) declared", manifest.len());
    Ok(())
}
