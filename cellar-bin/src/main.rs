use cellar_lib::{serve, CellarContext, DaemonConfig};
use color_eyre::eyre;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const OPERATION_RETENTION: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    let config = DaemonConfig::load()?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        var_dir = %config.var_dir.display(),
        listen = %config.listen_addr(),
        storage = ?config.storage_driver,
        "Starting cellar daemon..."
    );
    let context = CellarContext::new(config).await?;
    info!("CellarContext initialized.");

    if let Err(e) = context.boot().await {
        // Keep serving; the failed containers stay stopped.
        error!("Boot sequence incomplete: {}", e);
    }

    let maintenance = context.spawn_maintenance(MAINTENANCE_INTERVAL, OPERATION_RETENTION);
    serve(context.clone(), shutdown_signal()).await?;
    maintenance.abort();

    info!("Shutting down containers...");
    context.shutdown().await?;
    info!("cellar daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
