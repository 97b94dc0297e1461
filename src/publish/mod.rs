//! Publisher: registers new layer versions with the layer service.
//!
//! Every publish is validated locally first; a request that fails
//! validation never reaches the network. Each successful call creates
//! exactly one new version and nothing is overwritten or deleted.

mod lambda;
mod s3;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cancel::Cancellation;
use crate::error::{LayerError, classify};

pub use lambda::LambdaClient;
pub use s3::{S3BlobStore, staging_key};

/// Runtime identifiers the layer service accepts as compatible runtimes.
pub const KNOWN_RUNTIMES: &[&str] = &[
    "python3.8",
    "python3.9",
    "python3.10",
    "python3.11",
    "python3.12",
    "python3.13",
    "python3.14",
    "nodejs18.x",
    "nodejs20.x",
    "nodejs22.x",
    "java8.al2",
    "java11",
    "java17",
    "java21",
    "dotnet8",
    "ruby3.2",
    "ruby3.3",
    "ruby3.4",
    "provided.al2",
    "provided.al2023",
];

pub const KNOWN_ARCHITECTURES: &[&str] = &["x86_64", "arm64"];

const MAX_LAYER_NAME_LEN: usize = 140;
const MAX_COMPATIBLE_RUNTIMES: usize = 15;
const MAX_DESCRIPTION_LEN: usize = 256;
const MAX_LICENSE_INFO_LEN: usize = 512;

/// Layers a single function may reference.
pub const MAX_FUNCTION_LAYERS: usize = 5;

/// An object in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobReference {
    pub bucket: String,
    pub key: String,
    /// Object version, when the bucket is versioned
    pub version: Option<String>,
}

/// Where a published version's content came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContentRef {
    Inline { sha256: String, size: u64 },
    Blob(BlobReference),
}

/// Archive content as sent to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerContent {
    ZipFile(Vec<u8>),
    S3(BlobReference),
}

/// Settings shared by every publish of a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub compatible_runtimes: Vec<String>,
    pub compatible_architectures: Vec<String>,
    pub description: Option<String>,
    pub license_info: Option<String>,
}

impl PublishOptions {
    pub fn new(compatible_runtimes: Vec<String>) -> Self {
        Self {
            compatible_runtimes,
            ..Default::default()
        }
    }
}

/// One publish call as the service sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub layer_name: String,
    pub content: LayerContent,
    pub options: PublishOptions,
}

/// What the service answered to a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedVersion {
    pub version: u64,
    pub layer_version_arn: String,
    pub compatible_runtimes: Vec<String>,
}

/// A published layer version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerVersion {
    pub layer_name: String,
    pub version: u64,
    pub arn: String,
    pub compatible_runtimes: Vec<String>,
    pub content: ContentRef,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LayerService: Send + Sync {
    /// Creates a new version of the layer. Never retried.
    async fn publish_layer_version(&self, request: &PublishRequest) -> Result<PublishedVersion>;

    /// Layer version ARNs currently attached to a function, in order.
    async fn function_layers(&self, function: &str) -> Result<Vec<String>>;

    async fn set_function_layers(&self, function: &str, layers: &[String]) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<BlobReference>;
}

/// Checks a layer name and publish options without any network call.
pub fn validate(layer_name: &str, options: &PublishOptions) -> Result<()> {
    validate_layer_name(layer_name)?;

    let runtimes = &options.compatible_runtimes;
    if runtimes.is_empty() {
        return invalid("at least one compatible runtime is required".to_string());
    }
    if runtimes.len() > MAX_COMPATIBLE_RUNTIMES {
        return invalid(format!(
            "at most {} compatible runtimes are allowed, got {}",
            MAX_COMPATIBLE_RUNTIMES,
            runtimes.len()
        ));
    }
    check_unique_and_known(runtimes, KNOWN_RUNTIMES, "runtime")?;
    check_unique_and_known(
        &options.compatible_architectures,
        KNOWN_ARCHITECTURES,
        "architecture",
    )?;

    if let Some(description) = &options.description
        && description.chars().count() > MAX_DESCRIPTION_LEN
    {
        return invalid(format!(
            "description is longer than {} characters",
            MAX_DESCRIPTION_LEN
        ));
    }
    if let Some(license) = &options.license_info
        && license.chars().count() > MAX_LICENSE_INFO_LEN
    {
        return invalid(format!(
            "license info is longer than {} characters",
            MAX_LICENSE_INFO_LEN
        ));
    }
    Ok(())
}

pub fn validate_layer_name(layer_name: &str) -> Result<()> {
    let valid = !layer_name.is_empty()
        && layer_name.len() <= MAX_LAYER_NAME_LEN
        && layer_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        invalid(format!(
            "invalid layer name '{}': use 1-{} letters, digits, '-' or '_'",
            layer_name, MAX_LAYER_NAME_LEN
        ))
    }
}

fn check_unique_and_known(values: &[String], known: &[&str], what: &str) -> Result<()> {
    for (i, value) in values.iter().enumerate() {
        if values[..i].contains(value) {
            return invalid(format!("duplicate {} '{}'", what, value));
        }
        if !known.contains(&value.as_str()) {
            return invalid(format!(
                "unknown {} '{}' (expected one of: {})",
                what,
                value,
                known.join(", ")
            ));
        }
    }
    Ok(())
}

fn invalid(message: String) -> Result<()> {
    Err(LayerError::Validation(message).into())
}

/// `arn:aws:lambda:us-east-1:123:layer:deps:7` -> `arn:aws:lambda:us-east-1:123:layer:deps`
pub fn unversioned_layer_arn(arn: &str) -> Option<&str> {
    let (base, version) = arn.rsplit_once(':')?;
    let is_layer = base.starts_with("arn:") && base.contains(":layer:");
    let is_version = !version.is_empty() && version.chars().all(|c| c.is_ascii_digit());
    (is_layer && is_version).then_some(base)
}

pub struct Publisher<'a> {
    service: &'a dyn LayerService,
    blobs: Option<&'a dyn BlobStore>,
}

impl<'a> Publisher<'a> {
    pub fn new(service: &'a dyn LayerService) -> Self {
        Self {
            service,
            blobs: None,
        }
    }

    pub fn with_blob_store(mut self, blobs: &'a dyn BlobStore) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Publishes archive bytes inline.
    #[tracing::instrument(skip(self, archive_bytes, options, cancel))]
    pub async fn publish_direct(
        &self,
        layer_name: &str,
        archive_bytes: &[u8],
        options: &PublishOptions,
        cancel: &Cancellation,
    ) -> Result<LayerVersion> {
        validate(layer_name, options)?;
        let content = ContentRef::Inline {
            sha256: crate::archive::sha256_hex(archive_bytes),
            size: archive_bytes.len() as u64,
        };
        let request = PublishRequest {
            layer_name: layer_name.to_string(),
            content: LayerContent::ZipFile(archive_bytes.to_vec()),
            options: options.clone(),
        };
        self.publish(request, content, cancel).await
    }

    /// Publishes by reference to an archive already in the blob store.
    #[tracing::instrument(skip(self, options, cancel))]
    pub async fn publish_staged(
        &self,
        layer_name: &str,
        blob: &BlobReference,
        options: &PublishOptions,
        cancel: &Cancellation,
    ) -> Result<LayerVersion> {
        validate(layer_name, options)?;
        if blob.bucket.is_empty() || blob.key.is_empty() {
            return Err(LayerError::Validation(
                "blob reference needs both a bucket and a key".to_string(),
            )
            .into());
        }
        let request = PublishRequest {
            layer_name: layer_name.to_string(),
            content: LayerContent::S3(blob.clone()),
            options: options.clone(),
        };
        self.publish(request, ContentRef::Blob(blob.clone()), cancel)
            .await
    }

    /// Uploads an archive to the blob store for a staged publish.
    #[tracing::instrument(skip(self, archive_bytes, cancel))]
    pub async fn upload_archive(
        &self,
        bucket: &str,
        key: &str,
        archive_bytes: Vec<u8>,
        cancel: &Cancellation,
    ) -> Result<BlobReference> {
        let blobs = self.blobs.ok_or_else(|| {
            LayerError::Validation("a staging bucket is required for staged publish".to_string())
        })?;
        if cancel.is_cancelled() {
            return Err(LayerError::Cancelled.into());
        }

        info!(
            "Uploading {} bytes to s3://{}/{}...",
            archive_bytes.len(),
            bucket,
            key
        );
        let blob = tokio::select! {
            result = blobs.upload(bucket, key, archive_bytes) => {
                result.map_err(|e| classify(e, |m| LayerError::publish(m, false)))?
            }
            _ = cancel.cancelled() => return Err(LayerError::Cancelled.into()),
        };
        debug!("Uploaded {:?}", blob);
        Ok(blob)
    }

    async fn publish(
        &self,
        request: PublishRequest,
        content: ContentRef,
        cancel: &Cancellation,
    ) -> Result<LayerVersion> {
        // Last point at which the run can stop without a remote side effect
        if cancel.is_cancelled() {
            return Err(LayerError::Cancelled.into());
        }

        info!("Publishing new version of layer '{}'...", request.layer_name);
        let published = self
            .service
            .publish_layer_version(&request)
            .await
            .map_err(|e| classify(e, |m| LayerError::publish(m, true)))?;

        if published.version == 0 {
            return Err(LayerError::publish(
                format!(
                    "service returned version 0 for layer '{}'",
                    request.layer_name
                ),
                true,
            )
            .into());
        }
        if published.compatible_runtimes != request.options.compatible_runtimes {
            warn!(
                "Service reports compatible runtimes {:?}, requested {:?}",
                published.compatible_runtimes, request.options.compatible_runtimes
            );
        }

        Ok(LayerVersion {
            layer_name: request.layer_name,
            version: published.version,
            arn: published.layer_version_arn,
            compatible_runtimes: published.compatible_runtimes,
            content,
        })
    }

    /// Attaches a layer version to a function, replacing any other version of
    /// the same layer. Returns the function's resulting layer list.
    #[tracing::instrument(skip(self))]
    pub async fn attach(&self, function: &str, layer_version_arn: &str) -> Result<Vec<String>> {
        if function.trim().is_empty() {
            return Err(LayerError::Validation("function name is empty".to_string()).into());
        }
        let base = unversioned_layer_arn(layer_version_arn).ok_or_else(|| {
            LayerError::Validation(format!(
                "'{}' is not a layer version ARN",
                layer_version_arn
            ))
        })?;

        let current = self
            .service
            .function_layers(function)
            .await
            .map_err(|e| classify(e, |m| LayerError::publish(m, false)))?;

        if current.iter().any(|arn| arn == layer_version_arn) {
            info!("{} is already attached to {}", layer_version_arn, function);
            return Ok(current);
        }

        let mut layers = current;
        match layers
            .iter_mut()
            .find(|arn| unversioned_layer_arn(arn) == Some(base))
        {
            Some(existing) => {
                info!("Replacing {} on {}", existing, function);
                *existing = layer_version_arn.to_string();
            }
            None => layers.push(layer_version_arn.to_string()),
        }

        if layers.len() > MAX_FUNCTION_LAYERS {
            return Err(LayerError::Validation(format!(
                "function '{}' would have {} layers; at most {} are allowed",
                function,
                layers.len(),
                MAX_FUNCTION_LAYERS
            ))
            .into());
        }

        self.service
            .set_function_layers(function, &layers)
            .await
            .map_err(|e| classify(e, |m| LayerError::publish(m, true)))?;
        info!("Attached {} to {}", layer_version_arn, function);
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::layer_error;

    const MB: usize = 1024 * 1024;

    fn options(runtimes: &[&str]) -> PublishOptions {
        PublishOptions::new(runtimes.iter().map(|r| r.to_string()).collect())
    }

    fn published(version: u64, runtimes: &[String]) -> PublishedVersion {
        PublishedVersion {
            version,
            layer_version_arn: format!(
                "arn:aws:lambda:us-east-1:123456789012:layer:deps:{}",
                version
            ),
            compatible_runtimes: runtimes.to_vec(),
        }
    }

    fn assert_validation(result: Result<()>, needle: &str) {
        let err = result.unwrap_err();
        assert!(
            matches!(layer_error(&err), Some(LayerError::Validation(_))),
            "{:?}",
            err
        );
        assert!(err.to_string().contains(needle), "{}", err);
    }

    #[test]
    fn test_validate_accepts_typical_options() {
        let mut opts = options(&["python3.11", "python3.12"]);
        opts.compatible_architectures = vec!["x86_64".to_string(), "arm64".to_string()];
        opts.description = Some("numpy + plotly".to_string());
        validate("data-deps_v2", &opts).unwrap();
    }

    #[test]
    fn test_validate_layer_name() {
        let opts = options(&["python3.12"]);
        assert_validation(validate("", &opts), "invalid layer name");
        assert_validation(validate("my layer", &opts), "invalid layer name");
        assert_validation(validate("deps:1", &opts), "invalid layer name");
        assert_validation(validate(&"a".repeat(141), &opts), "invalid layer name");
        validate(&"a".repeat(140), &opts).unwrap();
    }

    #[test]
    fn test_validate_runtimes() {
        assert_validation(validate("deps", &options(&[])), "at least one");
        assert_validation(
            validate("deps", &options(&["python3.12", "python3.12"])),
            "duplicate runtime 'python3.12'",
        );
        assert_validation(
            validate("deps", &options(&["pyhton3.12"])),
            "unknown runtime 'pyhton3.12'",
        );
    }

    #[test]
    fn test_validate_architectures() {
        let mut opts = options(&["python3.12"]);
        opts.compatible_architectures = vec!["aarch64".to_string()];
        assert_validation(validate("deps", &opts), "unknown architecture 'aarch64'");
    }

    #[test]
    fn test_validate_description_length() {
        let mut opts = options(&["python3.12"]);
        opts.description = Some("d".repeat(257));
        assert_validation(validate("deps", &opts), "description");
    }

    #[test]
    fn test_unversioned_layer_arn() {
        assert_eq!(
            unversioned_layer_arn("arn:aws:lambda:us-east-1:123:layer:deps:7"),
            Some("arn:aws:lambda:us-east-1:123:layer:deps")
        );
        assert_eq!(
            unversioned_layer_arn("arn:aws:lambda:us-east-1:123:layer:deps"),
            None
        );
        assert_eq!(
            unversioned_layer_arn("arn:aws:lambda:us-east-1:123:function:f:1"),
            None
        );
        assert_eq!(unversioned_layer_arn("deps:7"), None);
    }

    #[tokio::test]
    async fn test_publish_direct_sends_bytes() {
        let archive = vec![7u8; 12 * MB];
        let expected_len = archive.len();

        let mut service = MockLayerService::new();
        service
            .expect_publish_layer_version()
            .times(1)
            .withf(move |request| {
                request.layer_name == "deps"
                    && matches!(&request.content, LayerContent::ZipFile(bytes) if bytes.len() == expected_len)
            })
            .returning(|request| Ok(published(1, &request.options.compatible_runtimes)));

        let version = Publisher::new(&service)
            .publish_direct(
                "deps",
                &archive,
                &options(&["python3.12"]),
                &Cancellation::new(),
            )
            .await
            .unwrap();

        assert_eq!(version.version, 1);
        assert_eq!(version.compatible_runtimes, vec!["python3.12"]);
        assert_eq!(
            version.content,
            ContentRef::Inline {
                sha256: crate::archive::sha256_hex(&archive),
                size: expected_len as u64,
            }
        );
    }

    #[tokio::test]
    async fn test_publish_staged_sends_reference() {
        let blob = BlobReference {
            bucket: "artifacts".to_string(),
            key: "layers/deps/abc.zip".to_string(),
            version: Some("v1".to_string()),
        };
        let expected = blob.clone();

        let mut service = MockLayerService::new();
        service
            .expect_publish_layer_version()
            .times(1)
            .withf(move |request| request.content == LayerContent::S3(expected.clone()))
            .returning(|request| Ok(published(4, &request.options.compatible_runtimes)));

        let version = Publisher::new(&service)
            .publish_staged(
                "deps",
                &blob,
                &options(&["python3.12"]),
                &Cancellation::new(),
            )
            .await
            .unwrap();

        assert_eq!(version.version, 4);
        assert_eq!(version.content, ContentRef::Blob(blob));
    }

    #[tokio::test]
    async fn test_empty_runtimes_fail_before_network() {
        let mut service = MockLayerService::new();
        service.expect_publish_layer_version().times(0);

        let err = Publisher::new(&service)
            .publish_direct("deps", b"PK", &options(&[]), &Cancellation::new())
            .await
            .unwrap_err();

        assert!(matches!(layer_error(&err), Some(LayerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_publish_sends_nothing() {
        let mut service = MockLayerService::new();
        service.expect_publish_layer_version().times(0);
        let cancel = Cancellation::new();
        cancel.cancel();

        let err = Publisher::new(&service)
            .publish_direct("deps", b"PK", &options(&["python3.12"]), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(layer_error(&err), Some(LayerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_service_failure_is_publish_error() {
        let mut service = MockLayerService::new();
        service
            .expect_publish_layer_version()
            .returning(|_| Err(anyhow::anyhow!("connection closed before message completed")));

        let err = Publisher::new(&service)
            .publish_direct("deps", b"PK", &options(&["python3.12"]), &Cancellation::new())
            .await
            .unwrap_err();

        assert!(matches!(
            layer_error(&err),
            Some(LayerError::Publish {
                ambiguous: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_version_zero_is_rejected() {
        let mut service = MockLayerService::new();
        service
            .expect_publish_layer_version()
            .returning(|request| Ok(published(0, &request.options.compatible_runtimes)));

        let err = Publisher::new(&service)
            .publish_direct("deps", b"PK", &options(&["python3.12"]), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("version 0"));
    }

    #[tokio::test]
    async fn test_upload_requires_blob_store() {
        let service = MockLayerService::new();
        let err = Publisher::new(&service)
            .upload_archive("bucket", "key", vec![1], &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(layer_error(&err), Some(LayerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_upload_archive() {
        let service = MockLayerService::new();
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_upload()
            .times(1)
            .withf(|bucket, key, body| bucket == "artifacts" && key == "k.zip" && body.len() == 3)
            .returning(|bucket, key, _| {
                Ok(BlobReference {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    version: None,
                })
            });

        let blob = Publisher::new(&service)
            .with_blob_store(&blobs)
            .upload_archive("artifacts", "k.zip", vec![1, 2, 3], &Cancellation::new())
            .await
            .unwrap();
        assert_eq!(blob.key, "k.zip");
    }

    struct HangingBlobStore;

    #[async_trait]
    impl BlobStore for HangingBlobStore {
        async fn upload(&self, _: &str, _: &str, _: Vec<u8>) -> Result<BlobReference> {
            std::future::pending::<()>().await;
            anyhow::bail!("unreachable")
        }
    }

    #[tokio::test]
    async fn test_upload_is_cancellable() {
        let service = MockLayerService::new();
        let cancel = Cancellation::new();
        cancel.cancel_after(std::time::Duration::from_millis(20));

        let err = Publisher::new(&service)
            .with_blob_store(&HangingBlobStore)
            .upload_archive("b", "k", vec![0], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(layer_error(&err), Some(LayerError::Cancelled)));
    }

    const DEPS_V3: &str = "arn:aws:lambda:us-east-1:123:layer:deps:3";
    const DEPS_V4: &str = "arn:aws:lambda:us-east-1:123:layer:deps:4";
    const OTHER: &str = "arn:aws:lambda:us-east-1:123:layer:other:1";

    fn service_with_layers(current: Vec<&'static str>) -> MockLayerService {
        let mut service = MockLayerService::new();
        service
            .expect_function_layers()
            .returning(move |_| Ok(current.iter().map(|s| s.to_string()).collect()));
        service
    }

    #[tokio::test]
    async fn test_attach_replaces_same_layer() {
        let mut service = service_with_layers(vec![OTHER, DEPS_V3]);
        service
            .expect_set_function_layers()
            .times(1)
            .withf(|function, layers| function == "api" && layers == [OTHER, DEPS_V4])
            .returning(|_, _| Ok(()));

        let layers = Publisher::new(&service).attach("api", DEPS_V4).await.unwrap();
        assert_eq!(layers, vec![OTHER, DEPS_V4]);
    }

    #[tokio::test]
    async fn test_attach_appends_new_layer() {
        let mut service = service_with_layers(vec![OTHER]);
        service
            .expect_set_function_layers()
            .times(1)
            .withf(|_, layers| layers == [OTHER, DEPS_V4])
            .returning(|_, _| Ok(()));

        Publisher::new(&service).attach("api", DEPS_V4).await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_already_attached_is_noop() {
        let mut service = service_with_layers(vec![DEPS_V4]);
        service.expect_set_function_layers().times(0);

        let layers = Publisher::new(&service).attach("api", DEPS_V4).await.unwrap();
        assert_eq!(layers, vec![DEPS_V4]);
    }

    #[tokio::test]
    async fn test_attach_rejects_sixth_layer() {
        let mut service = service_with_layers(vec![
            "arn:aws:lambda:us-east-1:123:layer:a:1",
            "arn:aws:lambda:us-east-1:123:layer:b:1",
            "arn:aws:lambda:us-east-1:123:layer:c:1",
            "arn:aws:lambda:us-east-1:123:layer:d:1",
            "arn:aws:lambda:us-east-1:123:layer:e:1",
        ]);
        service.expect_set_function_layers().times(0);

        let err = Publisher::new(&service).attach("api", DEPS_V4).await.unwrap_err();
        assert!(matches!(layer_error(&err), Some(LayerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_attach_rejects_non_layer_arn() {
        let mut service = MockLayerService::new();
        service.expect_function_layers().times(0);

        let err = Publisher::new(&service)
            .attach("api", "arn:aws:lambda:us-east-1:123:layer:deps")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a layer version ARN"));
    }
}
