use anyhow::Context;

use tally_api::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tally_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    let app = tally_api::app::build_app(&config).await?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
