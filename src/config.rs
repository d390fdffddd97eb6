//! Host-list configuration consumed by the binary.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HostConfig {
    pub addr: String,
    pub interval_ms: u64,
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub packet_size: usize,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_ttl() -> u32 {
    64
}

impl HostConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    pub hosts: Vec<HostConfig>,
}

impl Config {
    pub async fn load(path: &str) -> Result<Config> {
        if !Path::new(path).exists() {
            return Err(anyhow::anyhow!("config file not found: {}", path));
        }

        let content = fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn load_parses_hosts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"hosts": [
                {{"addr": "192.0.2.1", "interval_ms": 250, "read_timeout_ms": 100, "packet_size": 32, "ttl": 32}},
                {{"addr": "example.com", "interval_ms": 1000, "read_timeout_ms": 500}}
            ]}}"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(config.hosts.len(), 2);

        let first = &config.hosts[0];
        assert_eq!(first.addr, "192.0.2.1");
        assert_eq!(first.interval(), Duration::from_millis(250));
        assert_eq!(first.read_timeout(), Duration::from_millis(100));
        assert_eq!(first.packet_size, 32);
        assert_eq!(first.ttl, 32);

        // omitted fields fall back to defaults
        let second = &config.hosts[1];
        assert_eq!(second.packet_size, 0);
        assert_eq!(second.ttl, 64);
    }

    #[tokio::test]
    async fn load_missing_file_errors() {
        assert!(Config::load("/definitely/not/here.json").await.is_err());
    }
}
