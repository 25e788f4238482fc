use tracing::{error, info};

use mailflow::adapters::sqlite::pool;
use mailflow::config::load_config;
use mailflow::processors::subscription::start_renewals;
use mailflow::{logging, JobContext, Result, Runtime};

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(e) = run().await {
        error!("mailflow stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Starting mailflow ...");

    let config = load_config()?;
    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let pool = pool::open(&db_path, config.database.pool_size)?;

    let ctx = JobContext::new(config, pool)?;
    let mut runtime = Runtime::new(ctx);
    runtime.start()?;
    start_renewals(runtime.context()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for running jobs ...");
    runtime.shutdown().await;
    Ok(())
}
