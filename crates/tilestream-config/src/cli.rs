//! Command-line argument parsing shared by the Tilestream binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tilestream command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tilestream", about = "Tile world chunk streaming")]
pub struct CliArgs {
    /// Server address (client) or bind address (server).
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// World seed (server only).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory for persisted chunks (server only).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Generation worker threads (server only).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Maximum outstanding chunk requests (client only).
    #[arg(long)]
    pub max_requests: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    ///
    /// `--server` sets both the bind and the connect address; each binary
    /// only reads the one it needs.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
            self.network.bind_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(seed) = args.seed {
            self.world.seed = seed;
        }
        if let Some(ref dir) = args.data_dir {
            self.world.data_dir = Some(dir.clone());
        }
        if let Some(workers) = args.workers {
            self.streaming.max_generation_workers = workers;
        }
        if let Some(max) = args.max_requests {
            self.streaming.max_concurrent_requests = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
