//! Configuration module for the RPC cache plugin.
//!
//! Loads per-RPC cache definitions from YAML, either given directly or from
//! the file named by the `LCACHE_CONFIG` environment variable.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::cache::{CacheConfig, Encoding};

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "LCACHE_CONFIG";

/// Cache definition for one RPC.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RpcCacheDef {
    /// Cache name, used in flags and monitor reports.
    pub cache_name: String,
    /// The RPC whose responses are cached.
    pub rpc_name: String,
    pub shards: usize,
    /// Entry life window in seconds.
    pub life_window: u64,
    /// Reclamation interval in seconds, `0` disabling reclamation.
    pub clean_window: u64,
    /// Hard memory cap in MiB.
    pub hard_max_cache_size: usize,
    pub serialization: Encoding,
    pub max_entries_in_window: usize,
    pub max_entry_size: usize,
    /// Serve expired responses when the downstream call fails.
    pub allow_use_expired_entry: bool,
    pub stats_enabled: bool,
    pub verbose: bool,
}

impl Default for RpcCacheDef {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            cache_name: String::new(),
            rpc_name: String::new(),
            shards: defaults.shards,
            life_window: defaults.life_window.as_secs(),
            clean_window: defaults.clean_window.as_secs(),
            hard_max_cache_size: defaults.hard_max_cache_size,
            serialization: defaults.encoding,
            max_entries_in_window: defaults.max_entries_in_window,
            max_entry_size: defaults.max_entry_size,
            allow_use_expired_entry: defaults.allow_use_expired_entry,
            stats_enabled: defaults.stats_enabled,
            verbose: defaults.verbose,
        }
    }
}

impl RpcCacheDef {
    /// The cache name, falling back to the RPC name.
    pub fn name(&self) -> &str {
        if self.cache_name.is_empty() {
            &self.rpc_name
        } else {
            &self.cache_name
        }
    }

    /// Build the cache config for this RPC.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default()
            .shards(self.shards)
            .life_window(Duration::from_secs(self.life_window))
            .clean_window(Duration::from_secs(self.clean_window))
            .hard_max_cache_size(self.hard_max_cache_size)
            .max_entries_in_window(self.max_entries_in_window)
            .max_entry_size(self.max_entry_size)
            .allow_use_expired_entry(self.allow_use_expired_entry)
            .stats_enabled(self.stats_enabled)
            .verbose(self.verbose)
            .encoding(self.serialization)
    }
}

/// Plugin configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PluginConfig {
    #[serde(default)]
    pub caches: Vec<RpcCacheDef>,
}

impl PluginConfig {
    /// Parse configuration from YAML text.
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("failed to parse cache config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cache config {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }

    /// Load configuration from the file named by `LCACHE_CONFIG`.
    ///
    /// A `.env` file is honoured. Returns an empty config if the variable is
    /// not set.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        match env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_path(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for def in &self.caches {
            anyhow::ensure!(!def.rpc_name.is_empty(), "cache entry without rpc_name");
            def.cache_config()
                .validate()
                .with_context(|| format!("invalid cache config for {}", def.rpc_name))?;
        }
        Ok(())
    }
}
