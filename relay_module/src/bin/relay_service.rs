use relay_module::service::{run_service, ServiceConfig};
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = ServiceConfig::from_env()?;
    info!("starting relay {} on {}:{}", config.name, config.host, config.port);

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    };
    run_service(config, shutdown)
}
