//! Configuration for the Tilestream server and client.
//!
//! Settings persist to disk as RON files, can be overridden from the command
//! line via clap, and deserialize with defaults for any missing field so old
//! config files keep loading after new options are added.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig, StreamingConfig, WorldConfig, default_config_dir};
pub use error::ConfigError;
