use anyhow::Result;
use log::debug;
use reqwest::Client;
use std::time::Duration;

use crate::{aws::AwsSettings, http::HttpClient, runtime::Runtime};

/// Upper bound for a single HTTP request. Inline publishes carry up to
/// 50 MiB of base64, so this is generous.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Region and endpoint overrides from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsOptions {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

pub struct Config<R: Runtime> {
    pub runtime: R,
    pub http: HttpClient,
    aws: AwsOptions,
}

impl<R: Runtime> Config<R> {
    pub fn new(runtime: R, aws: AwsOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            runtime,
            http: HttpClient::new(client),
            aws,
        })
    }

    /// Resolves region, endpoint and credentials. Only commands that talk to
    /// the service call this, so offline commands never need credentials.
    pub fn aws_settings(&self) -> Result<AwsSettings> {
        let settings = AwsSettings::from_runtime(
            &self.runtime,
            self.aws.region.clone(),
            self.aws.endpoint_url.clone(),
        )?;
        debug!(
            "Using region {} (endpoint {:?}), credentials {:?}",
            settings.region, settings.endpoint, settings.credentials
        );
        Ok(settings)
    }
}

pub fn user_agent() -> String {
    format!("layerpack/{}", env!("LAYERPACK_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpRequest;
    use crate::runtime::MockRuntime;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_config_sets_user_agent() {
        let runtime = MockRuntime::new();
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header(
                "user-agent",
                Matcher::Regex("^layerpack/".to_string()),
            )
            .create_async()
            .await;

        let config = Config::new(runtime, AwsOptions::default()).unwrap();
        let request = HttpRequest::new(reqwest::Method::GET, server.url());
        config.http.send(&request).await.unwrap();

        mock.assert_async().await;
    }

    #[test]
    fn test_aws_settings_uses_overrides() {
        let mut runtime = MockRuntime::new();
        runtime.expect_env_var().returning(|key| match key {
            "AWS_ACCESS_KEY_ID" => Ok("AKIDEXAMPLE".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Ok("secret".to_string()),
            "AWS_REGION" => Ok("us-west-2".to_string()),
            _ => Err(std::env::VarError::NotPresent),
        });

        let config = Config::new(
            runtime,
            AwsOptions {
                region: Some("eu-central-1".to_string()),
                endpoint_url: Some("http://localhost:4566/".to_string()),
            },
        )
        .unwrap();
        let settings = config.aws_settings().unwrap();

        assert_eq!(settings.region, "eu-central-1");
        assert_eq!(settings.endpoint.as_deref(), Some("http://localhost:4566"));
    }

    #[test]
    fn test_aws_settings_without_credentials_fails() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_env_var()
            .returning(|_| Err(std::env::VarError::NotPresent));

        let config = Config::new(runtime, AwsOptions::default()).unwrap();
        assert!(config.aws_settings().is_err());
    }
}
