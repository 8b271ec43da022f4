//! Headless Tilestream client.
//!
//! Connects, streams the chunks around a fixed player position, and logs
//! progress until interrupted.
//!
//! Run with: `cargo run -p tilestream-client -- --server 127.0.0.1 --port 7777`

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tilestream_client::ClientRuntime;
use tilestream_config::{CliArgs, Config, default_config_dir};
use tilestream_world::ObjectTypeRegistry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir)?;
    config.apply_cli_overrides(&args);
    config.validate()?;

    let log_dir = config_dir.join("logs");
    tilestream_log::init_logging(
        Some(log_dir.as_path()),
        config.debug.log_to_file,
        "tilestream-client.log",
        Some(&config),
    );
    info!(
        "Tilestream client v{} connecting to {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.network.server_address,
        config.network.server_port
    );

    let registry = Arc::new(ObjectTypeRegistry::new());
    let (runtime, handle) = ClientRuntime::connect(config, registry, (0, 0)).await?;

    let reporter = handle.clone();
    tokio::spawn(async move {
        let mut every = tokio::time::interval(Duration::from_secs(5));
        loop {
            every.tick().await;
            let stats = reporter.stats();
            info!(
                "chunks={} objects={} in_flight={} queued={} deltas={}",
                stats.chunks_loaded, stats.objects, stats.in_flight, stats.queued, stats.deltas_applied
            );
        }
    });

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            stopper.shutdown();
        }
    });

    let world = runtime.run().await;
    info!("Client stopped with {} chunk(s) loaded", world.chunk_count());
    drop(handle);
    Ok(())
}
