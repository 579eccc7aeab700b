// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::{enums::ServerMode, logger::LoggerConfig},
    pool::PoolOptions,
};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Listen address and deployment mode of the network front end.
    pub server: ServerConfig,
    /// Cache sizing.
    pub storage: StorageConfig,
    /// Worker-pool sizing, used by the `mt_nonblocking` mode.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Log level and destination.
    #[serde(default)]
    pub logger: LoggerConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Address the acceptor binds; port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    pub mode: ServerMode,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StorageConfig {
    /// Cache capacity as the total of key and value bytes over all entries.
    pub max_size: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    /// Steady-state floor of worker threads.
    pub low_watermark: usize,
    /// Burst ceiling of worker threads.
    pub high_watermark: usize,
    /// Bound on queued tasks before events fall back to the acceptor.
    pub max_queue: usize,
    #[serde(with = "serde_millis")]
    /// Idle time after which a worker above the floor exits.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let opts = PoolOptions::default();
        Self {
            low_watermark: opts.low_watermark,
            high_watermark: opts.high_watermark,
            max_queue: opts.max_queue,
            idle_timeout: opts.idle_timeout,
        }
    }
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
            max_queue: self.max_queue,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen: SocketAddr::from(([0, 0, 0, 0], 11211)),
                mode: ServerMode::MtNonblocking,
            },
            storage: StorageConfig {
                max_size: 1024 * 1024,
            },
            pool: PoolConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants across sections.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.storage.max_size >= 1, "storage.max_size must be >= 1");
        ensure!(
            self.pool.low_watermark <= self.pool.high_watermark,
            "pool.low_watermark must not exceed pool.high_watermark"
        );
        ensure!(
            self.pool.high_watermark >= 1,
            "pool.high_watermark must be >= 1"
        );
        ensure!(self.pool.max_queue >= 1, "pool.max_queue must be >= 1");
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).expect("serialize failed");
        let parsed: Config = serde_yaml::from_str(&yaml).expect("parse failed");
        assert_eq!(parsed.server.listen, cfg.server.listen);
        assert_eq!(parsed.server.mode, cfg.server.mode);
        assert_eq!(parsed.storage.max_size, cfg.storage.max_size);
        assert_eq!(parsed.pool.idle_timeout, cfg.pool.idle_timeout);
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let mut cfg = Config {
            pool: PoolConfig {
                low_watermark: 8,
                high_watermark: 2,
                ..PoolConfig::default()
            },
            ..Config::default()
        };
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn test_minimal_yaml_uses_section_defaults() {
        let yaml = "server:\n  listen: \"127.0.0.1:11211\"\n  mode: st_nonblocking\nstorage:\n  max_size: 4096\n";
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse failed");
        assert_eq!(cfg.server.mode, ServerMode::StNonblocking);
        assert_eq!(cfg.storage.max_size, 4096);
        assert_eq!(cfg.pool.max_queue, PoolConfig::default().max_queue);
    }
}
