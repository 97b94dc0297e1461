//! `pip install --target` backend.

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use super::PackageBackend;
use crate::error::LayerError;
use crate::manifest::PackageManifest;

/// Lines of pip's stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Installs packages by running `<python> -m pip install --target ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipBackend {
    python: String,
    platform: Option<String>,
    python_version: Option<String>,
    index_url: Option<String>,
}

impl PipBackend {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            platform: None,
            python_version: None,
            index_url: None,
        }
    }

    /// Target platform tag, e.g. `manylinux2014_x86_64`. Restricts pip to wheels.
    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform;
        self
    }

    /// Target interpreter version, e.g. `3.12`. Restricts pip to wheels.
    pub fn with_python_version(mut self, version: Option<String>) -> Self {
        self.python_version = version;
        self
    }

    pub fn with_index_url(mut self, url: Option<String>) -> Self {
        self.index_url = url;
        self
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    pub fn command_args(
        &self,
        manifest: &PackageManifest,
        target: &Path,
        cache_dir: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-m", "pip", "install", "--target"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(target.as_os_str().to_owned());
        args.push("--cache-dir".into());
        args.push(cache_dir.as_os_str().to_owned());
        for flag in ["--no-compile", "--no-input", "--disable-pip-version-check"] {
            args.push(flag.into());
        }

        if let Some(platform) = &self.platform {
            args.push("--platform".into());
            args.push(platform.into());
            args.push("--implementation".into());
            args.push("cp".into());
        }
        if let Some(version) = &self.python_version {
            args.push("--python-version".into());
            args.push(version.into());
        }
        // pip refuses to build sdists for a foreign platform or interpreter
        if self.platform.is_some() || self.python_version.is_some() {
            args.push("--only-binary=:all:".into());
        }
        if let Some(url) = &self.index_url {
            args.push("--index-url".into());
            args.push(url.into());
        }

        args.extend(manifest.specifiers().into_iter().map(OsString::from));
        args
    }
}

#[async_trait]
impl PackageBackend for PipBackend {
    #[tracing::instrument(skip(self, manifest))]
    async fn install(
        &self,
        manifest: &PackageManifest,
        target: &Path,
        cache_dir: &Path,
    ) -> Result<()> {
        let args = self.command_args(manifest, target, cache_dir);
        debug!("Running {} {:?}", self.python, args);

        let output = Command::new(&self.python)
            .args(&args)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env_remove("PIP_REQUIRE_VIRTUALENV")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                LayerError::Resolution(format!("failed to run '{}': {}", self.python, e))
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(LayerError::Resolution(format!(
            "pip install exited with {}:\n{}",
            output.status,
            tail(&stderr, STDERR_TAIL_LINES)
        ))
        .into())
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
