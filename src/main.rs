use aegis::config::HostConfig;
use aegis::ProtectionLayer;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast: there is no fallback for missing secrets
    let config = match HostConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(?err, "refusing to start without required secrets");
            return Err(err.into());
        }
    };

    let layer = ProtectionLayer::init(config).await?;
    let keys = layer.key_metadata().await;
    let current = keys.iter().find(|meta| meta.is_current);
    info!(
        key_id = current.map(|meta| meta.id.as_str()).unwrap_or_default(),
        "aegis ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    layer.shutdown().await;
    Ok(())
}
