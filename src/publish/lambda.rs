use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{LayerContent, LayerService, PublishRequest, PublishedVersion};
use crate::aws::{AwsSettings, uri_encode};
use crate::error::LayerError;
use crate::http::{HttpClient, HttpRequest};

const SERVICE: &str = "lambda";
const LAYERS_API_VERSION: &str = "2018-10-31";
const FUNCTIONS_API_VERSION: &str = "2015-03-31";

/// Lambda REST API client.
pub struct LambdaClient {
    http: HttpClient,
    settings: AwsSettings,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PublishLayerVersionBody<'a> {
    content: ContentBody<'a>,
    compatible_runtimes: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    compatible_architectures: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    license_info: Option<&'a str>,
}

fn is_empty(values: &&[String]) -> bool {
    values.is_empty()
}

#[derive(Serialize, Default)]
#[serde(rename_all = "PascalCase")]
struct ContentBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    zip_file: Option<String>,
    #[serde(rename = "S3Bucket", skip_serializing_if = "Option::is_none")]
    s3_bucket: Option<&'a str>,
    #[serde(rename = "S3Key", skip_serializing_if = "Option::is_none")]
    s3_key: Option<&'a str>,
    #[serde(rename = "S3ObjectVersion", skip_serializing_if = "Option::is_none")]
    s3_object_version: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PublishLayerVersionResponse {
    version: u64,
    layer_version_arn: String,
    #[serde(default)]
    compatible_runtimes: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FunctionConfiguration {
    #[serde(default)]
    layers: Vec<FunctionLayer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FunctionLayer {
    arn: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateLayersBody<'a> {
    layers: &'a [String],
}

impl LambdaClient {
    pub fn new(http: HttpClient, settings: AwsSettings) -> Self {
        Self { http, settings }
    }

    fn publish_url(&self, layer_name: &str) -> String {
        format!(
            "{}/{}/layers/{}/versions",
            self.settings.lambda_endpoint(),
            LAYERS_API_VERSION,
            uri_encode(layer_name, true)
        )
    }

    fn configuration_url(&self, function: &str) -> String {
        format!(
            "{}/{}/functions/{}/configuration",
            self.settings.lambda_endpoint(),
            FUNCTIONS_API_VERSION,
            uri_encode(function, true)
        )
    }

    /// Signs `request`. Failing here means nothing was sent.
    fn signed(&self, mut request: HttpRequest) -> Result<HttpRequest> {
        self.settings
            .signer(SERVICE)
            .sign(&mut request, OffsetDateTime::now_utc())
            .map_err(|e| LayerError::publish(format!("{:#}", e), false))?;
        Ok(request)
    }

    fn json_request<T: Serialize>(&self, method: Method, url: String, body: &T) -> Result<HttpRequest> {
        let body = serde_json::to_vec(body)
            .map_err(|e| LayerError::publish(format!("failed to encode request: {}", e), false))?;
        self.signed(
            HttpRequest::new(method, url)
                .with_header("content-type", "application/json")
                .with_body(body),
        )
    }
}

fn publish_body(request: &PublishRequest) -> PublishLayerVersionBody<'_> {
    let content = match &request.content {
        LayerContent::ZipFile(bytes) => ContentBody {
            zip_file: Some(STANDARD.encode(bytes)),
            ..Default::default()
        },
        LayerContent::S3(blob) => ContentBody {
            s3_bucket: Some(&blob.bucket),
            s3_key: Some(&blob.key),
            s3_object_version: blob.version.as_deref(),
            ..Default::default()
        },
    };
    PublishLayerVersionBody {
        content,
        compatible_runtimes: &request.options.compatible_runtimes,
        compatible_architectures: &request.options.compatible_architectures,
        description: request.options.description.as_deref(),
        license_info: request.options.license_info.as_deref(),
    }
}

#[async_trait]
impl LayerService for LambdaClient {
    #[tracing::instrument(skip(self, request), fields(layer = %request.layer_name))]
    async fn publish_layer_version(&self, request: &PublishRequest) -> Result<PublishedVersion> {
        let http_request = self.json_request(
            Method::POST,
            self.publish_url(&request.layer_name),
            &publish_body(request),
        )?;

        let response = self.http.send(&http_request).await?;

        // The version exists once the service answered 2xx, whatever the body says
        let parsed: PublishLayerVersionResponse = response.json().await.map_err(|e| {
            LayerError::publish(format!("unreadable publish response: {}", e), true)
        })?;
        debug!("Published {}", parsed.layer_version_arn);

        Ok(PublishedVersion {
            version: parsed.version,
            layer_version_arn: parsed.layer_version_arn,
            compatible_runtimes: parsed.compatible_runtimes,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn function_layers(&self, function: &str) -> Result<Vec<String>> {
        let request = self.signed(HttpRequest::new(
            Method::GET,
            self.configuration_url(function),
        ))?;
        let response = self.http.send_idempotent(&request).await?;
        let configuration: FunctionConfiguration = response.json().await.map_err(|e| {
            LayerError::publish(format!("unreadable function configuration: {}", e), false)
        })?;
        Ok(configuration.layers.into_iter().map(|l| l.arn).collect())
    }

    #[tracing::instrument(skip(self))]
    async fn set_function_layers(&self, function: &str, layers: &[String]) -> Result<()> {
        let request = self.json_request(
            Method::PUT,
            self.configuration_url(function),
            &UpdateLayersBody { layers },
        )?;
        self.http.send_idempotent(&request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::Credentials;
    use crate::error::layer_error;
    use crate::publish::{BlobReference, PublishOptions};
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    fn client(endpoint: &str) -> LambdaClient {
        let settings = AwsSettings {
            region: "us-east-1".to_string(),
            endpoint: Some(endpoint.to_string()),
            credentials: Credentials {
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
        };
        let http =
            HttpClient::new(reqwest::Client::new()).with_retry_delay(Duration::from_millis(1));
        LambdaClient::new(http, settings)
    }

    fn request(content: LayerContent) -> PublishRequest {
        PublishRequest {
            layer_name: "deps".to_string(),
            content,
            options: PublishOptions {
                compatible_runtimes: vec!["python3.12".to_string()],
                compatible_architectures: vec!["arm64".to_string()],
                description: Some("numpy and plotly".to_string()),
                license_info: None,
            },
        }
    }

    const PUBLISH_RESPONSE: &str = r#"{
        "Version": 3,
        "LayerVersionArn": "arn:aws:lambda:us-east-1:123456789012:layer:deps:3",
        "LayerArn": "arn:aws:lambda:us-east-1:123456789012:layer:deps",
        "CompatibleRuntimes": ["python3.12"],
        "CreatedDate": "2024-03-01T08:00:00.000+0000",
        "Content": {"CodeSize": 3}
    }"#;

    #[test]
    fn test_publish_body_inline() {
        let body = serde_json::to_value(publish_body(&request(LayerContent::ZipFile(
            b"PK\x03".to_vec(),
        ))))
        .unwrap();
        assert_eq!(
            body,
            json!({
                "Content": {"ZipFile": "UEsD"},
                "CompatibleRuntimes": ["python3.12"],
                "CompatibleArchitectures": ["arm64"],
                "Description": "numpy and plotly"
            })
        );
    }

    #[test]
    fn test_publish_body_staged() {
        let body = serde_json::to_value(publish_body(&request(LayerContent::S3(
            BlobReference {
                bucket: "artifacts".to_string(),
                key: "layers/deps.zip".to_string(),
                version: None,
            },
        ))))
        .unwrap();
        assert_eq!(
            body["Content"],
            json!({"S3Bucket": "artifacts", "S3Key": "layers/deps.zip"})
        );
        assert!(body["Content"].get("ZipFile").is_none());
    }

    #[tokio::test]
    async fn test_publish_layer_version() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/2018-10-31/layers/deps/versions")
            .match_header(
                "authorization",
                Matcher::Regex("^AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/".to_string()),
            )
            .match_header("x-amz-date", Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "Content": {"ZipFile": "UEsD"},
                "CompatibleRuntimes": ["python3.12"]
            })))
            .with_status(201)
            .with_body(PUBLISH_RESPONSE)
            .create_async()
            .await;

        let published = client(&server.url())
            .publish_layer_version(&request(LayerContent::ZipFile(b"PK\x03".to_vec())))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(published.version, 3);
        assert_eq!(
            published.layer_version_arn,
            "arn:aws:lambda:us-east-1:123456789012:layer:deps:3"
        );
        assert_eq!(published.compatible_runtimes, vec!["python3.12"]);
    }

    #[tokio::test]
    async fn test_publish_is_sent_once_on_server_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/2018-10-31/layers/deps/versions")
            .with_status(503)
            .with_body(r#"{"Type":"Service","message":"Service unavailable"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server.url())
            .publish_layer_version(&request(LayerContent::ZipFile(vec![1])))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(
            layer_error(&err),
            Some(LayerError::Publish {
                ambiguous: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_publish_rejected_by_quota() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/2018-10-31/layers/deps/versions")
            .with_status(400)
            .with_body(
                r#"{"Type":"User","__type":"CodeStorageExceededException","message":"Code storage limit exceeded."}"#,
            )
            .create_async()
            .await;

        let err = client(&server.url())
            .publish_layer_version(&request(LayerContent::ZipFile(vec![1])))
            .await
            .unwrap_err();

        match layer_error(&err) {
            Some(LayerError::Publish { message, ambiguous }) => {
                assert!(!ambiguous);
                assert!(message.contains("CodeStorageExceededException"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreadable_publish_response_is_ambiguous() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/2018-10-31/layers/deps/versions")
            .with_status(201)
            .with_body("<html>proxy</html>")
            .create_async()
            .await;

        let err = client(&server.url())
            .publish_layer_version(&request(LayerContent::ZipFile(vec![1])))
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
    async fn test_function_layers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/2015-03-31/functions/api/configuration")
            .with_status(200)
            .with_body(
                r#"{"FunctionName":"api","Layers":[{"Arn":"arn:aws:lambda:us-east-1:123:layer:a:1","CodeSize":10}]}"#,
            )
            .create_async()
            .await;

        let layers = client(&server.url()).function_layers("api").await.unwrap();

        mock.assert_async().await;
        assert_eq!(layers, vec!["arn:aws:lambda:us-east-1:123:layer:a:1"]);
    }

    #[tokio::test]
    async fn test_function_without_layers() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/2015-03-31/functions/api/configuration")
            .with_status(200)
            .with_body(r#"{"FunctionName":"api"}"#)
            .create_async()
            .await;

        let layers = client(&server.url()).function_layers("api").await.unwrap();
        assert!(layers.is_empty());
    }

    #[tokio::test]
    async fn test_set_function_layers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/2015-03-31/functions/api/configuration")
            .match_body(Matcher::Json(json!({
                "Layers": ["arn:aws:lambda:us-east-1:123:layer:a:2"]
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        client(&server.url())
            .set_function_layers("api", &["arn:aws:lambda:us-east-1:123:layer:a:2".to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[test]
    fn test_function_arn_is_encoded_in_path() {
        let client = client("http://localhost");
        assert_eq!(
            client.configuration_url("arn:aws:lambda:us-east-1:123:function:api"),
            "http://localhost/2015-03-31/functions/arn%3Aaws%3Alambda%3Aus-east-1%3A123%3Afunction%3Aapi/configuration"
        );
    }
}
