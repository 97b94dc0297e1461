//! Local record of what was last published per layer name.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::publish::LayerVersion;
use crate::runtime::Runtime;

const STATE_DIR: &str = ".layerpack";
const STATE_FILE: &str = "state.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub version: u64,
    pub sha256: String,
    pub arn: String,
    pub compatible_runtimes: Vec<String>,
    /// RFC 3339
    pub published_at: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishLedger {
    #[serde(default)]
    layers: BTreeMap<String, LedgerEntry>,
}

impl PublishLedger {
    /// `~/.layerpack/state.json`
    pub fn default_path<R: Runtime>(runtime: &R) -> Result<PathBuf> {
        let home = runtime
            .home_dir()
            .context("Could not determine the home directory; pass --state-file")?;
        Ok(home.join(STATE_DIR).join(STATE_FILE))
    }

    /// Loads the ledger, or an empty one if the file does not exist yet.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        if !runtime.exists(path) {
            debug!("No publish ledger at {:?}", path);
            return Ok(Self::default());
        }
        let content = runtime.read_to_string(path)?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse publish ledger {:?}", path))
    }

    #[tracing::instrument(skip(self, runtime))]
    pub fn save<R: Runtime>(&self, runtime: &R, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            runtime.create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        runtime
            .write(&tmp, content.as_bytes())
            .and_then(|_| runtime.rename(&tmp, path))
            .with_context(|| format!("Failed to save publish ledger to {:?}", path))
    }

    pub fn last(&self, layer_name: &str) -> Option<&LedgerEntry> {
        self.layers.get(layer_name)
    }

    /// The recorded entry when the same archive was already published with
    /// the same runtimes.
    pub fn unchanged(
        &self,
        layer_name: &str,
        sha256: &str,
        compatible_runtimes: &[String],
    ) -> Option<&LedgerEntry> {
        self.last(layer_name)
            .filter(|e| e.sha256 == sha256 && e.compatible_runtimes == compatible_runtimes)
    }

    /// Records a successful publish. Returns false, after logging a warning,
    /// when the version does not advance past the recorded one.
    pub fn record(&mut self, published: &LayerVersion, sha256: &str, now: OffsetDateTime) -> bool {
        let advanced = match self.last(&published.layer_name) {
            Some(previous) if published.version <= previous.version => {
                warn!(
                    "Layer '{}' was published as version {}, but version {} was recorded earlier",
                    published.layer_name, published.version, previous.version
                );
                false
            }
            _ => true,
        };

        self.layers.insert(
            published.layer_name.clone(),
            LedgerEntry {
                version: published.version,
                sha256: sha256.to_string(),
                arn: published.arn.clone(),
                compatible_runtimes: published.compatible_runtimes.clone(),
                published_at: now.format(&Rfc3339).unwrap_or_default(),
            },
        );
        advanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::ContentRef;
    use crate::runtime::{MockRuntime, RealRuntime};
    use time::macros::datetime;

    fn version(n: u64) -> LayerVersion {
        LayerVersion {
            layer_name: "deps".to_string(),
            version: n,
            arn: format!("arn:aws:lambda:us-east-1:123:layer:deps:{}", n),
            compatible_runtimes: vec!["python3.12".to_string()],
            content: ContentRef::Inline {
                sha256: "abc".to_string(),
                size: 3,
            },
        }
    }

    #[test]
    fn test_default_path() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_home_dir()
            .returning(|| Some(PathBuf::from("/home/user")));
        assert_eq!(
            PublishLedger::default_path(&runtime).unwrap(),
            PathBuf::from("/home/user/.layerpack/state.json")
        );

        let mut runtime = MockRuntime::new();
        runtime.expect_home_dir().returning(|| None);
        assert!(PublishLedger::default_path(&runtime).is_err());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = PublishLedger::load(&RealRuntime, &dir.path().join("state.json")).unwrap();
        assert_eq!(ledger, PublishLedger::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");

        let mut ledger = PublishLedger::default();
        assert!(ledger.record(&version(3), "sha", datetime!(2024-03-01 08:00:00 UTC)));
        ledger.save(&RealRuntime, &path).unwrap();

        let loaded = PublishLedger::load(&RealRuntime, &path).unwrap();
        let entry = loaded.last("deps").unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.sha256, "sha");
        assert_eq!(entry.published_at, "2024-03-01T08:00:00Z");
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn test_load_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = PublishLedger::load(&RealRuntime, &path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse publish ledger"));
    }

    #[test]
    fn test_unchanged() {
        let mut ledger = PublishLedger::default();
        ledger.record(&version(1), "sha-a", OffsetDateTime::now_utc());
        let runtimes = vec!["python3.12".to_string()];

        assert!(ledger.unchanged("deps", "sha-a", &runtimes).is_some());
        assert!(ledger.unchanged("deps", "sha-b", &runtimes).is_none());
        assert!(
            ledger
                .unchanged("deps", "sha-a", &["python3.11".to_string()])
                .is_none()
        );
        assert!(ledger.unchanged("other", "sha-a", &runtimes).is_none());
    }

    #[test_log::test]
    fn test_record_non_increasing_version_warns() {
        let mut ledger = PublishLedger::default();
        assert!(ledger.record(&version(5), "a", OffsetDateTime::now_utc()));
        assert!(ledger.record(&version(6), "b", OffsetDateTime::now_utc()));
        assert!(!ledger.record(&version(6), "c", OffsetDateTime::now_utc()));
        assert!(!ledger.record(&version(2), "d", OffsetDateTime::now_utc()));

        // The service is authoritative; the latest answer is kept
        assert_eq!(ledger.last("deps").unwrap().version, 2);
    }
}
