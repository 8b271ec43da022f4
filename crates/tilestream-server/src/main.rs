//! Tilestream dedicated server.
//!
//! Run with: `cargo run -p tilestream-server -- --port 7777 --seed 42`

use std::sync::Arc;

use clap::Parser;
use tilestream_config::{CliArgs, Config, default_config_dir};
use tilestream_server::ChunkServer;
use tilestream_world::{
    DirWorldStore, MemoryWorldStore, NoiseTerrainGenerator, ObjectTypeRegistry, WorldStore,
};
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
        "tilestream-server.log",
        Some(&config),
    );
    info!(
        "Tilestream server v{} | world {:?} seed {}",
        env!("CARGO_PKG_VERSION"),
        config.world.world_id,
        config.world.seed
    );

    let store: Arc<dyn WorldStore> = match &config.world.data_dir {
        Some(dir) => {
            info!("Persisting chunks under {}", dir.display());
            Arc::new(DirWorldStore::new(dir.clone()))
        }
        None => {
            info!("No data_dir configured, chunks are kept in memory");
            Arc::new(MemoryWorldStore::new())
        }
    };
    let generator = Arc::new(NoiseTerrainGenerator::default());
    let registry = Arc::new(ObjectTypeRegistry::new());

    let server = ChunkServer::new(config, store, generator, registry)?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
