//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration shared by the server and client binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Chunk streaming throttles, timeouts and radii.
    pub streaming: StreamingConfig,
    /// World identity and persistence.
    pub world: WorldConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the server binds to.
    pub bind_address: String,
    /// Address the client connects to.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Maximum number of simultaneous connections (server only).
    pub max_connections: usize,
    /// Largest accepted frame payload in bytes.
    pub max_frame_bytes: u32,
    /// Serialized messages at or above this size are LZ4-compressed.
    pub compression_threshold: usize,
    /// Capacity of the inbound message channel feeding the main loop.
    pub inbound_channel_capacity: usize,
}

/// Chunk streaming configuration.
///
/// Durations are stored in milliseconds so the RON file stays readable; use
/// the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Outstanding chunk requests a client may have in flight.
    pub max_concurrent_requests: usize,
    /// Server generation worker threads.
    pub max_generation_workers: usize,
    /// Timeout for normal and retry requests.
    pub request_timeout_ms: u64,
    /// Timeout for urgent-ring requests.
    pub urgent_request_timeout_ms: u64,
    /// Cached chunk records kept per client before oldest-first eviction.
    pub per_client_cache_max: usize,
    /// Lifetime of a per-client cache record.
    pub cache_ttl_ms: u64,
    /// Objects carried by one `ChunkData` part.
    pub max_objects_per_part: usize,
    /// Chunk radius polled on the tight urgent loop.
    pub urgent_radius: u32,
    /// Chunk radius requested at normal priority.
    pub visible_radius: u32,
    /// Chunk radius requested speculatively.
    pub preload_radius: u32,
    /// Server tick driving world-object delta flushes.
    pub tick_interval_ms: u64,
    /// Interval of the background cache TTL sweep.
    pub cache_sweep_interval_ms: u64,
    /// Interval of the client urgent-ring poll.
    pub urgent_poll_ms: u64,
    /// Interval of the client visible/preload ring poll.
    pub preload_poll_ms: u64,
    /// Interval of the client pending-request timeout sweep.
    pub request_sweep_ms: u64,
}

/// World identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Identifier of the world served.
    pub world_id: String,
    /// Terrain seed.
    pub seed: u64,
    /// Directory for persisted chunks. `None` keeps chunks in memory.
    pub data_dir: Option<PathBuf>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Also write JSON logs to the log directory.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            max_connections: 256,
            max_frame_bytes: 1_048_576,
            compression_threshold: 256,
            inbound_channel_capacity: 1024,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            max_generation_workers: 8,
            request_timeout_ms: 5_000,
            urgent_request_timeout_ms: 1_000,
            per_client_cache_max: 256,
            cache_ttl_ms: 300_000,
            max_objects_per_part: 50,
            urgent_radius: 2,
            visible_radius: 3,
            preload_radius: 5,
            tick_interval_ms: 50,
            cache_sweep_interval_ms: 60_000,
            urgent_poll_ms: 100,
            preload_poll_ms: 500,
            request_sweep_ms: 250,
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            world_id: "overworld".to_string(),
            seed: 42,
            data_dir: None,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl StreamingConfig {
    /// Timeout for normal and retry requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Timeout for urgent-ring requests.
    pub fn urgent_request_timeout(&self) -> Duration {
        Duration::from_millis(self.urgent_request_timeout_ms)
    }

    /// Lifetime of a per-client cache record.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Server tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Cache sweep interval.
    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    /// Urgent-ring poll interval.
    pub fn urgent_poll(&self) -> Duration {
        Duration::from_millis(self.urgent_poll_ms)
    }

    /// Visible/preload ring poll interval.
    pub fn preload_poll(&self) -> Duration {
        Duration::from_millis(self.preload_poll_ms)
    }

    /// Pending-request sweep interval.
    pub fn request_sweep(&self) -> Duration {
        Duration::from_millis(self.request_sweep_ms)
    }

    /// Reject values the streaming layer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_requests",
                reason: "must be at least 1",
            });
        }
        if self.max_generation_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_generation_workers",
                reason: "must be at least 1",
            });
        }
        if self.per_client_cache_max == 0 {
            return Err(ConfigError::Invalid {
                field: "per_client_cache_max",
                reason: "must be at least 1",
            });
        }
        if self.max_objects_per_part == 0 {
            return Err(ConfigError::Invalid {
                field: "max_objects_per_part",
                reason: "must be at least 1",
            });
        }
        if !(self.urgent_radius <= self.visible_radius && self.visible_radius <= self.preload_radius)
        {
            return Err(ConfigError::Invalid {
                field: "urgent_radius",
                reason: "radii must satisfy urgent <= visible <= preload",
            });
        }
        Ok(())
    }
}

/// Platform config directory for Tilestream (e.g. `~/.config/tilestream`).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tilestream")
}

// --- Load / Save / Reload ---

impl Config {
    /// Reject a config the server or client cannot run with, for example
    /// after CLI overrides were applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_frame_bytes",
                reason: "must be at least 1",
            });
        }
        if self.world.world_id.is_empty() {
            return Err(ConfigError::Invalid {
                field: "world_id",
                reason: "must not be empty",
            });
        }
        self.streaming.validate()
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let s = StreamingConfig::default();
        assert_eq!(s.max_concurrent_requests, 8);
        assert_eq!(s.max_generation_workers, 8);
        assert_eq!(s.request_timeout(), Duration::from_millis(5000));
        assert_eq!(s.urgent_request_timeout(), Duration::from_millis(1000));
        assert_eq!(s.per_client_cache_max, 256);
        assert_eq!(s.cache_ttl(), Duration::from_secs(300));
        assert_eq!(s.max_objects_per_part, 50);
        assert_eq!((s.urgent_radius, s.visible_radius, s.preload_radius), (2, 3, 5));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("server_port: 7777"));
        assert!(ron_str.contains("max_objects_per_part: 50"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.streaming, StreamingConfig::default());
        assert_eq!(config.world, WorldConfig::default());
    }

    #[test]
    fn test_partial_streaming_section() {
        let ron_str = "(streaming: (max_concurrent_requests: 4, cache_ttl_ms: 1000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.streaming.max_concurrent_requests, 4);
        assert_eq!(config.streaming.cache_ttl(), Duration::from_secs(1));
        assert_eq!(config.streaming.max_objects_per_part, 50);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let s = StreamingConfig {
            max_generation_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid {
                field: "max_generation_workers",
                ..
            })
        ));
    }

    #[test]
    fn test_inverted_radii_rejected() {
        let s = StreamingConfig {
            urgent_radius: 4,
            visible_radius: 3,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_whole_config_validation_covers_every_section() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.world.world_id.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "world_id", .. })
        ));

        let mut config = Config::default();
        config.streaming.max_concurrent_requests = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "max_concurrent_requests", .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.server_port = 9000;
        config.world.seed = 1234;
        config.streaming.max_objects_per_part = 20;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.streaming.request_timeout_ms = 2_500;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().streaming.request_timeout_ms, 2_500);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}
