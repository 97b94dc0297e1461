use anyhow::Result;

use super::config::Config;
use crate::{
    publish::{LambdaClient, Publisher},
    runtime::Runtime,
};

/// Attaches a published layer version to a function.
#[tracing::instrument(skip(config))]
pub async fn attach<R: Runtime>(
    config: Config<R>,
    function: &str,
    layer_version_arn: &str,
) -> Result<()> {
    let settings = config.aws_settings()?;
    let service = LambdaClient::new(config.http.clone(), settings);

    let layers = Publisher::new(&service)
        .attach(function, layer_version_arn)
        .await?;

    println!("Layers of {}:", function);
    for arn in layers {
        println!("   {}", arn);
    }
    Ok(())
}
