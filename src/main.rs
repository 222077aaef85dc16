use std::error::Error;

use rivet::config::Config;
use rivet::database::Pool;
use rivet::endpoints;
use rivet::server::{App, Server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::load()?;

    let pool = Pool::new(endpoints::demo_backend(), config.pool.to_pool_config());
    pool.start().await?;

    let app = App::new(endpoints::router()?).with_pool(pool.clone());
    let server = Server::bind(&config.listen).await?.with_limits(config.limits);

    let served = server
        .run_until(app, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await;

    // In-flight leases finish before the pool reports stopped.
    pool.drain().await?;
    info!("pool drained");
    served?;
    Ok(())
}
