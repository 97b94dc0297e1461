//! AWS credentials, endpoints and request signing.

mod sigv4;

use anyhow::Result;
use log::debug;
use std::fmt;

use crate::error::LayerError;
use crate::runtime::Runtime;

pub use sigv4::{Signer, hmac_sha256, signing_key, uri_encode};

const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
const REGION_VARS: [&str; 2] = ["AWS_REGION", "AWS_DEFAULT_REGION"];
const ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Credentials {
    /// Reads static credentials from the environment.
    pub fn from_runtime<R: Runtime>(runtime: &R) -> Result<Self> {
        let access_key_id = non_empty_var(runtime, ACCESS_KEY_ID);
        let secret_access_key = non_empty_var(runtime, SECRET_ACCESS_KEY);

        match (access_key_id, secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => {
                debug!(
                    "Using AWS access key {}****",
                    access_key_id.chars().take(4).collect::<String>()
                );
                Ok(Self {
                    access_key_id,
                    secret_access_key,
                    session_token: non_empty_var(runtime, SESSION_TOKEN),
                })
            }
            _ => Err(LayerError::Validation(format!(
                "AWS credentials not found: set {} and {}",
                ACCESS_KEY_ID, SECRET_ACCESS_KEY
            ))
            .into()),
        }
    }
}

/// Where and as whom requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    pub region: String,
    /// Overrides every service endpoint, e.g. a local emulator
    pub endpoint: Option<String>,
    pub credentials: Credentials,
}

impl AwsSettings {
    /// Resolves settings from explicit overrides first, then the environment.
    pub fn from_runtime<R: Runtime>(
        runtime: &R,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let region = region
            .filter(|r| !r.is_empty())
            .or_else(|| REGION_VARS.iter().find_map(|v| non_empty_var(runtime, v)))
            .ok_or_else(|| {
                LayerError::Validation(format!(
                    "no AWS region configured: pass --region or set {}",
                    REGION_VARS[0]
                ))
            })?;
        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .or_else(|| non_empty_var(runtime, ENDPOINT_URL))
            .map(|e| e.trim_end_matches('/').to_string());

        Ok(Self {
            region,
            endpoint,
            credentials: Credentials::from_runtime(runtime)?,
        })
    }

    /// Base URL of the layer service.
    pub fn lambda_endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://lambda.{}.amazonaws.com", self.region),
        }
    }

    /// Object URL in the blob store. Custom endpoints use path-style
    /// addressing, AWS uses virtual-hosted style.
    pub fn s3_object_url(&self, bucket: &str, key: &str) -> String {
        let key = uri_encode(key, false);
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint, bucket, key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", bucket, self.region, key),
        }
    }

    pub fn signer<'a>(&'a self, service: &'a str) -> Signer<'a> {
        Signer::new(&self.credentials, &self.region, service)
    }
}

fn non_empty_var<R: Runtime>(runtime: &R, key: &str) -> Option<String> {
    runtime.env_var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::layer_error;
    use crate::runtime::MockRuntime;
    use std::collections::HashMap;

    fn runtime_with_env(vars: &[(&str, &str)]) -> MockRuntime {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut runtime = MockRuntime::new();
        runtime.expect_env_var().returning(move |key| {
            vars.get(key)
                .cloned()
                .ok_or(std::env::VarError::NotPresent)
        });
        runtime
    }

    const KEYS: [(&str, &str); 2] = [
        ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
        ("AWS_SECRET_ACCESS_KEY", "secret"),
    ];

    #[test]
    fn test_credentials_from_env() {
        let runtime = runtime_with_env(&[KEYS[0], KEYS[1], ("AWS_SESSION_TOKEN", "token")]);
        let credentials = Credentials::from_runtime(&runtime).unwrap();
        assert_eq!(credentials.access_key_id, "AKIDEXAMPLE");
        assert_eq!(credentials.session_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_missing_credentials_is_validation_error() {
        let runtime = runtime_with_env(&[KEYS[0], ("AWS_SECRET_ACCESS_KEY", " ")]);
        let err = Credentials::from_runtime(&runtime).unwrap_err();
        assert!(matches!(layer_error(&err), Some(LayerError::Validation(_))));
        assert!(err.to_string().contains("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let credentials = Credentials {
            access_key_id: "AKID".to_string(),
            secret_access_key: "very-secret".to_string(),
            session_token: Some("also-secret".to_string()),
        };
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("AKID"));
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("also-secret"));
    }

    #[test]
    fn test_region_resolution_order() {
        let runtime = runtime_with_env(&[
            KEYS[0],
            KEYS[1],
            ("AWS_REGION", "eu-west-1"),
            ("AWS_DEFAULT_REGION", "us-east-1"),
        ]);
        let settings = AwsSettings::from_runtime(&runtime, None, None).unwrap();
        assert_eq!(settings.region, "eu-west-1");

        let settings =
            AwsSettings::from_runtime(&runtime, Some("ap-south-1".to_string()), None).unwrap();
        assert_eq!(settings.region, "ap-south-1");

        let runtime = runtime_with_env(&[KEYS[0], KEYS[1], ("AWS_DEFAULT_REGION", "us-east-1")]);
        let settings = AwsSettings::from_runtime(&runtime, None, None).unwrap();
        assert_eq!(settings.region, "us-east-1");
    }

    #[test]
    fn test_missing_region_is_validation_error() {
        let runtime = runtime_with_env(&KEYS);
        let err = AwsSettings::from_runtime(&runtime, None, None).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 7);
        assert!(err.to_string().contains("--region"));
    }

    #[test]
    fn test_default_endpoints() {
        let runtime = runtime_with_env(&[KEYS[0], KEYS[1], ("AWS_REGION", "us-east-1")]);
        let settings = AwsSettings::from_runtime(&runtime, None, None).unwrap();

        assert_eq!(
            settings.lambda_endpoint(),
            "https://lambda.us-east-1.amazonaws.com"
        );
        assert_eq!(
            settings.s3_object_url("my-bucket", "layers/deps v1.zip"),
            "https://my-bucket.s3.us-east-1.amazonaws.com/layers/deps%20v1.zip"
        );
    }

    #[test]
    fn test_custom_endpoint_uses_path_style() {
        let runtime = runtime_with_env(&[
            KEYS[0],
            KEYS[1],
            ("AWS_REGION", "us-east-1"),
            ("AWS_ENDPOINT_URL", "http://localhost:4566/"),
        ]);
        let settings = AwsSettings::from_runtime(&runtime, None, None).unwrap();

        assert_eq!(settings.lambda_endpoint(), "http://localhost:4566");
        assert_eq!(
            settings.s3_object_url("bucket", "layers/a.zip"),
            "http://localhost:4566/bucket/layers/a.zip"
        );
    }
}
