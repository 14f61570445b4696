mod admin;
mod app;
mod config;
mod crawl;
mod db;
mod domain;
mod infrastructure;
mod tasks;

use std::time::Duration;

use anyhow::Result;
use infrastructure::{directories, instance_guard::InstanceGuard, logging, shutdown};

const LOCK_WAIT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let paths = directories::ensure_directories(&config.directories)?;
    logging::init_tracing(&config, &paths)?;

    let _guard = InstanceGuard::acquire(&paths.data_dir, LOCK_WAIT)?;

    let (shutdown, _) = shutdown::Shutdown::new();
    shutdown::install_signal_handlers(shutdown.clone());

    let engine = app::CrawlEngine::initialize(config, paths, shutdown).await?;
    engine.run().await
}
