use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use reqwest::Method;
use time::OffsetDateTime;

use super::{BlobReference, BlobStore};
use crate::aws::AwsSettings;
use crate::error::LayerError;
use crate::http::{HttpClient, HttpRequest};

const SERVICE: &str = "s3";
const VERSION_ID_HEADER: &str = "x-amz-version-id";

/// S3 object uploads for staged publishes.
pub struct S3BlobStore {
    http: HttpClient,
    settings: AwsSettings,
}

impl S3BlobStore {
    pub fn new(http: HttpClient, settings: AwsSettings) -> Self {
        Self { http, settings }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[tracing::instrument(skip(self, body), fields(size = body.len()))]
    async fn upload(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<BlobReference> {
        if bucket.is_empty() || key.is_empty() {
            return Err(LayerError::Validation(
                "staging upload needs both a bucket and a key".to_string(),
            )
            .into());
        }

        let mut request = HttpRequest::new(Method::PUT, self.settings.s3_object_url(bucket, key))
            .with_header("content-type", "application/zip")
            .with_body(body);
        self.settings
            .signer(SERVICE)
            .sign(&mut request, OffsetDateTime::now_utc())
            .map_err(|e| LayerError::publish(format!("{:#}", e), false))?;

        // PUT of the same bytes to the same key is idempotent
        let response = self.http.send_idempotent(&request).await?;
        let version = response
            .headers()
            .get(VERSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && *v != "null")
            .map(str::to_string);
        debug!("Stored s3://{}/{} (version {:?})", bucket, key, version);

        Ok(BlobReference {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version,
        })
    }
}

/// Default object key for a staged archive: content-addressed per layer.
pub fn staging_key(prefix: &str, layer_name: &str, sha256: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}.zip", layer_name, sha256)
    } else {
        format!("{}/{}/{}.zip", prefix, layer_name, sha256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::Credentials;
    use crate::error::layer_error;
    use mockito::Matcher;
    use std::time::Duration;

    fn store(endpoint: &str) -> S3BlobStore {
        let settings = AwsSettings {
            region: "eu-west-1".to_string(),
            endpoint: Some(endpoint.to_string()),
            credentials: Credentials {
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: Some("token".to_string()),
            },
        };
        let http =
            HttpClient::new(reqwest::Client::new()).with_retry_delay(Duration::from_millis(1));
        S3BlobStore::new(http, settings)
    }

    #[tokio::test]
    async fn test_upload_returns_version() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/artifacts/layers/deps/abc.zip")
            .match_header(
                "x-amz-content-sha256",
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            )
            .match_header("x-amz-security-token", "token")
            .match_header("content-type", "application/zip")
            .match_header(
                "authorization",
                Matcher::Regex("/eu-west-1/s3/aws4_request".to_string()),
            )
            .match_body("abc")
            .with_status(200)
            .with_header("x-amz-version-id", "3HL4kqtJlcpXroDTDmJ")
            .create_async()
            .await;

        let blob = store(&server.url())
            .upload("artifacts", "layers/deps/abc.zip", b"abc".to_vec())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            blob,
            BlobReference {
                bucket: "artifacts".to_string(),
                key: "layers/deps/abc.zip".to_string(),
                version: Some("3HL4kqtJlcpXroDTDmJ".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_upload_unversioned_bucket() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/artifacts/k.zip")
            .with_status(200)
            .create_async()
            .await;

        let blob = store(&server.url())
            .upload("artifacts", "k.zip", vec![1])
            .await
            .unwrap();
        assert_eq!(blob.version, None);
    }

    #[tokio::test]
    async fn test_upload_retries_transient_failures() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/artifacts/k.zip")
            .with_status(500)
            .with_body("<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>")
            .expect(crate::http::MAX_RETRIES)
            .create_async()
            .await;

        let err = store(&server.url())
            .upload("artifacts", "k.zip", vec![1])
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(err.to_string().contains("We encountered an internal error."));
    }

    #[tokio::test]
    async fn test_upload_access_denied_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/artifacts/k.zip")
            .with_status(403)
            .with_body("<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>")
            .expect(1)
            .create_async()
            .await;

        let err = store(&server.url())
            .upload("artifacts", "k.zip", vec![1])
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(
            layer_error(&err),
            Some(LayerError::Publish {
                ambiguous: false,
                ..
            })
        ));
        assert!(err.to_string().contains("Access Denied"));
    }

    #[tokio::test]
    async fn test_upload_rejects_empty_bucket() {
        let err = store("http://127.0.0.1:9")
            .upload("", "k.zip", vec![1])
            .await
            .unwrap_err();
        assert!(matches!(layer_error(&err), Some(LayerError::Validation(_))));
    }

    #[test]
    fn test_staging_key() {
        assert_eq!(staging_key("", "deps", "ab12"), "deps/ab12.zip");
        assert_eq!(staging_key("layers/", "deps", "ab12"), "layers/deps/ab12.zip");
        assert_eq!(staging_key("/a/b/", "deps", "ab12"), "a/b/deps/ab12.zip");
    }
}
