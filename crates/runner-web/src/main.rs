use anyhow::{Context, Result};
use clap::Parser;
use runner_web::{Args, Gateway, GatewayConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runner_web=info,librunner=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(&args)?;
    let gateway = Gateway::build(&config)?;

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind web listener on {}", config.listen))?;
    info!(
        workspace_root = %config.workspace_root.display(),
        layout = ?config.layout,
        "runner-web listening on http://{}",
        config.listen
    );

    gateway.serve(listener, shutdown_signal()).await?;
    info!("runner-web stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
