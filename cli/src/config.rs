// Configuration management for the anoverif CLI
//
// Stored as JSON in:
// - macOS: ~/Library/Application Support/anoverif/config.json
// - Linux: ~/.config/anoverif/config.json
// - Windows: %APPDATA%\anoverif\config.json
//
// Layering: command-line flags > ANON_* environment variables > file > defaults.

use anoverif_core::{JitterDistribution, MixerConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable → config key
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("ANON_PORT", "port"),
    ("ANON_BIND_ADDRESS", "bind_address"),
    ("ANON_BACKEND_URL", "backend_url"),
    ("ANON_HASH_SALT", "hash_salt"),
    ("ANON_MIN_DELAY_MS", "min_delay_ms"),
    ("ANON_MAX_DELAY_MS", "max_delay_ms"),
    ("ANON_BATCH_SIZE", "batch_size"),
    ("ANON_BACKEND_TIMEOUT_MS", "backend_timeout_ms"),
    ("ANON_WAIT_TIMEOUT_MS", "overall_wait_timeout_ms"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the frontend listens on
    pub port: u16,

    /// Address the frontend binds to
    pub bind_address: String,

    /// Verification backend endpoint
    pub backend_url: String,

    /// Maximum concurrently served connections
    pub max_connections: usize,

    /// A connection is closed after this many seconds
    pub connection_timeout_secs: u64,

    /// Mixing engine settings
    pub mixer: MixerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            backend_url: "http://localhost:9090/verify".to_string(),
            max_connections: 1000,
            connection_timeout_secs: 30,
            mixer: MixerConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("anoverif");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Default config file path
    pub fn default_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Resolve an explicit `--config` path or fall back to the default one
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::default_file(),
        }
    }

    /// Load from file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save config to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Apply `ANON_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(var) {
                self.set(key, &value)
                    .with_context(|| format!("Invalid value in {}", var))?;
            }
        }
        Ok(())
    }

    /// Reject settings the server could not run with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be > 0");
        }
        if self.connection_timeout_secs == 0 {
            anyhow::bail!("connection_timeout_secs must be > 0");
        }
        self.socket_addr()?;
        self.mixer.validate().context("Invalid mixer configuration")?;

        // A connection must outlive the longest wait for a verification result
        let connection_ms = self.connection_timeout_secs.saturating_mul(1000);
        if connection_ms <= self.mixer.overall_wait_timeout_ms {
            anyhow::bail!(
                "connection_timeout_secs ({} ms) must exceed overall_wait_timeout_ms ({} ms)",
                connection_ms,
                self.mixer.overall_wait_timeout_ms
            );
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.bind_address, self.port))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "port" => self.port = value.parse().context("Invalid port number")?,
            "bind_address" => self.bind_address = value.to_string(),
            "backend_url" => self.backend_url = value.to_string(),
            "max_connections" => {
                self.max_connections = value.parse().context("Invalid number")?;
            }
            "connection_timeout_secs" => {
                self.connection_timeout_secs = value.parse().context("Invalid number")?;
            }
            "min_delay_ms" => {
                self.mixer.min_delay_ms = value.parse().context("Invalid number")?;
            }
            "max_delay_ms" => {
                self.mixer.max_delay_ms = value.parse().context("Invalid number")?;
            }
            "jitter_distribution" => {
                self.mixer.jitter_distribution = match value {
                    "uniform" => JitterDistribution::Uniform,
                    "exponential" => JitterDistribution::Exponential,
                    _ => anyhow::bail!("Invalid distribution (expected uniform or exponential)"),
                };
            }
            "batch_size" => {
                self.mixer.batch_size = value.parse().context("Invalid number")?;
            }
            "dispatch_workers" => {
                self.mixer.dispatch_workers = value.parse().context("Invalid number")?;
            }
            "hash_salt" => self.mixer.hash_salt = value.to_string(),
            "backend_timeout_ms" => {
                self.mixer.backend_timeout_ms = value.parse().context("Invalid number")?;
            }
            "overall_wait_timeout_ms" => {
                self.mixer.overall_wait_timeout_ms = value.parse().context("Invalid number")?;
            }
            "cache_max_size" => {
                self.mixer.cache_max_size = value.parse().context("Invalid number")?;
            }
            "cache_eviction_block_size" => {
                self.mixer.cache_eviction_block_size = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value. The salt itself is never returned.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "port" => self.port.to_string(),
            "bind_address" => self.bind_address.clone(),
            "backend_url" => self.backend_url.clone(),
            "max_connections" => self.max_connections.to_string(),
            "connection_timeout_secs" => self.connection_timeout_secs.to_string(),
            "min_delay_ms" => self.mixer.min_delay_ms.to_string(),
            "max_delay_ms" => self.mixer.max_delay_ms.to_string(),
            "jitter_distribution" => distribution_name(self.mixer.jitter_distribution).to_string(),
            "batch_size" => self.mixer.batch_size.to_string(),
            "dispatch_workers" => self.mixer.dispatch_workers.to_string(),
            "hash_salt" => salt_status(&self.mixer.hash_salt).to_string(),
            "backend_timeout_ms" => self.mixer.backend_timeout_ms.to_string(),
            "overall_wait_timeout_ms" => self.mixer.overall_wait_timeout_ms.to_string(),
            "cache_max_size" => self.mixer.cache_max_size.to_string(),
            "cache_eviction_block_size" => self.mixer.cache_eviction_block_size.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        const KEYS: &[&str] = &[
            "port",
            "bind_address",
            "backend_url",
            "max_connections",
            "connection_timeout_secs",
            "min_delay_ms",
            "max_delay_ms",
            "jitter_distribution",
            "batch_size",
            "dispatch_workers",
            "hash_salt",
            "backend_timeout_ms",
            "overall_wait_timeout_ms",
            "cache_max_size",
            "cache_eviction_block_size",
        ];
        KEYS.iter()
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }
}

fn distribution_name(distribution: JitterDistribution) -> &'static str {
    match distribution {
        JitterDistribution::Uniform => "uniform",
        JitterDistribution::Exponential => "exponential",
    }
}

fn salt_status(salt: &str) -> &'static str {
    if salt.is_empty() {
        "(not set)"
    } else {
        "(set)"
    }
}
