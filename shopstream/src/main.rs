mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use shopstream_core::{auth::TokenService, logging, Config};
use shopstream_sfu::{SfuManager, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "shopstream", about = "ShopStream real-time media routing engine")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "SHOPSTREAM_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("ShopStream media engine starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Token validation (secret shared with the application layer)
    let tokens = TokenService::new(
        config.auth.token_secret.as_bytes(),
        config.auth.token_ttl_secs,
    );

    // 5. Worker pool: one media worker per CPU core unless overridden
    let workers = config.worker_count();
    info!(workers, "Spawning media workers");
    let pool = Arc::new(WorkerPool::new(workers, config.media.clone())?);

    // 6. Media engine
    let engine = SfuManager::new(pool, &config.media);

    // 7. HTTP server: signaling channel, lifecycle routes, /metrics, /health
    let router = shopstream_api::create_router(Arc::clone(&engine), tokens);
    let result = server::run(&config, router, &engine).await;

    engine.shutdown().await;
    info!("ShopStream media engine stopped");

    // A non-zero exit on worker failure hands recovery to the external
    // supervisor: rooms and connections are rebuilt by reconnecting clients.
    result
}
