use anyhow::Result;
use std::path::Path;

use crate::{
    archive::{inspect_archive, verify_layout},
    router::SizeRouter,
    runtime::Runtime,
};

/// Lists an archive's entries and checks its layout.
#[tracing::instrument(skip(runtime))]
pub fn inspect<R: Runtime>(runtime: R, path: &Path, router: SizeRouter, json: bool) -> Result<()> {
    let summary = inspect_archive(&runtime, path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for entry in &summary.entries {
            println!("{}", entry);
        }
        println!();
        println!("{} entries, {} file(s)", summary.entries.len(), summary.file_count());
        println!("size: {} bytes", summary.size);
        println!("sha256: {}", summary.sha256);
        println!("route: {}", router.route(summary.size));
    }

    verify_layout(&summary)
}
