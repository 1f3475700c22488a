use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 5454;
pub const DEFAULT_HEARTBEAT_MS: u64 = 50;

/// Startup parameters of the core loop: the UDP port and the sizes of the
/// three thread groups (core fibers, network receive workers, database
/// fibers), plus the target tick period.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CoreConfig {
    pub port: u16,
    pub core_threads: u16,
    pub net_threads: u16,
    pub db_threads: u16,
    pub heartbeat_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            port: DEFAULT_PORT,
            core_threads: 2,
            net_threads: 2,
            db_threads: 2,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
        }
    }
}

impl CoreConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> CoreConfig {
        serdeconv::from_toml_file(path).expect("Error loading core configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.core_threads, 2);
        assert_eq!(config.net_threads, 2);
        assert_eq!(config.db_threads, 2);
        assert_eq!(config.heartbeat_ms, DEFAULT_HEARTBEAT_MS);
    }

    #[test]
    fn test_roundtrip() {
        let config = CoreConfig::default();
        let toml = serdeconv::to_toml_string(&config).unwrap();
        let back: CoreConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(back.port, config.port);
        assert_eq!(back.heartbeat_ms, config.heartbeat_ms);
    }
}
