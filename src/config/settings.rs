use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::modbus::registers::BankLayout;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Client connection settings
    pub client: ClientConfig,

    // Server / simulated device settings
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub target_host: String,          // Server to connect to
    pub target_port: u16,
    pub unit_id: u8,                  // Modbus unit identifier
    pub request_timeout_ms: u64,      // Per-request timeout
    pub poll_interval_ms: u64,        // Default watch interval
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub drift_interval_ms: u64,       // Simulated device update tick
    pub layout: BankLayout,           // Register bank sizes
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientConfig {
                target_host: "127.0.0.1".to_string(),
                target_port: 5020,
                unit_id: 1,
                request_timeout_ms: 1000,
                poll_interval_ms: 1000,
            },
            server: ServerConfig {
                bind_host: "127.0.0.1".to_string(),
                bind_port: 5020,
                drift_interval_ms: 1000,
                layout: BankLayout::default(),
            },
        }
    }
}

impl Config {
    /// Load the config file if given, then apply command line overrides.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(host) = matches.get_one::<String>("host") {
            config.client.target_host = host.clone();
            config.server.bind_host = host.clone();
        }
        if let Some(port) = matches.get_one::<String>("port") {
            let port: u16 = port.parse()?;
            config.client.target_port = port;
            config.server.bind_port = port;
        }
        if let Some(unit) = matches.get_one::<String>("unit") {
            config.client.unit_id = unit.parse()?;
        }
        if let Some(timeout) = matches.get_one::<String>("timeout") {
            config.client.request_timeout_ms = timeout.parse()?;
        }

        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn client_address(&self) -> String {
        format!("{}:{}", self.client.target_host, self.client.target_port)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.bind_host, self.server.bind_port)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.client.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.client.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_device() {
        let config = Config::default();
        assert_eq!(config.client.target_port, 5020);
        assert_eq!(config.client.unit_id, 1);
        assert_eq!(config.client.poll_interval_ms, 1000);
        assert_eq!(config.server.drift_interval_ms, 1000);
        assert_eq!(config.server.layout.coils, 10);
        assert_eq!(config.server.layout.holding_registers, 20);
        assert_eq!(config.client_address(), "127.0.0.1:5020");
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.client.target_host, config.client.target_host);
        assert_eq!(parsed.server.bind_port, config.server.bind_port);
        assert_eq!(parsed.server.layout.input_registers, 20);
    }
}
