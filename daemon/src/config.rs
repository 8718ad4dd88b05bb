//! Daemon configuration

use anyhow::{Result, bail};
use plugind_runtime::{LocalRuntimeConfig, SupervisorConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Gateway configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Plugin runtime configuration
    #[serde(default)]
    pub plugin: PluginConfig,

    /// Media bucket configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and merge configuration from file (incremental update)
    ///
    /// Only non-default values from the new config will overwrite existing values.
    pub async fn load_merge(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let other: DaemonConfig = toml::from_str(&content)?;
        self.merge(other);
        self.validate()
    }

    /// Reject settings the runtime cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.plugin.validate()
    }

    /// Merge another config into this one (incremental)
    ///
    /// Scalar values overwrite if the new value differs from default.
    pub fn merge(&mut self, other: DaemonConfig) {
        // Server
        if other.server.bind != default_bind() {
            self.server.bind = other.server.bind;
        }
        if !other.server.api_key.is_empty() {
            self.server.api_key = other.server.api_key;
        }

        // Plugin runtime
        let plugin = other.plugin;
        if plugin.install_dir != default_install_dir() {
            self.plugin.install_dir = plugin.install_dir;
        }
        if plugin.python_interpreter != default_python_interpreter() {
            self.plugin.python_interpreter = plugin.python_interpreter;
        }
        if plugin.install_timeout_secs != default_install_timeout() {
            self.plugin.install_timeout_secs = plugin.install_timeout_secs;
        }
        if plugin.idle_timeout_secs != default_idle_timeout() {
            self.plugin.idle_timeout_secs = plugin.idle_timeout_secs;
        }
        if plugin.watchdog_interval_secs != default_watchdog_interval() {
            self.plugin.watchdog_interval_secs = plugin.watchdog_interval_secs;
        }
        if plugin.max_captured_bytes != default_max_captured_bytes() {
            self.plugin.max_captured_bytes = plugin.max_captured_bytes;
        }
        if plugin.max_restarts != default_max_restarts() {
            self.plugin.max_restarts = plugin.max_restarts;
        }
        if plugin.health_interval_secs != default_health_interval() {
            self.plugin.health_interval_secs = plugin.health_interval_secs;
        }

        // Media
        if other.media.path != default_media_path() {
            self.media.path = other.media.path;
        }

        // Monitoring
        if other.monitoring.prometheus_bind != default_prometheus_bind() {
            self.monitoring.prometheus_bind = other.monitoring.prometheus_bind;
        }
        if other.monitoring.prometheus_enabled != default_true() {
            self.monitoring.prometheus_enabled = other.monitoring.prometheus_enabled;
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Shared key expected in `X-Api-Key`
    #[serde(default)]
    pub api_key: String,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5002))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: String::new(),
        }
    }
}

/// Plugin runtime configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Directory holding one unpacked bundle per subdirectory
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Base interpreter used to create environments
    #[serde(default = "default_python_interpreter")]
    pub python_interpreter: PathBuf,

    /// Hard limit for one dependency install
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// Install killed after this long without output
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Watchdog poll period
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    /// Diagnostic output retained per install
    #[serde(default = "default_max_captured_bytes")]
    pub max_captured_bytes: usize,

    /// Plugin process restarts before the runtime is failed
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Plugin process liveness poll period
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_python_interpreter() -> PathBuf {
    PathBuf::from("python3")
}

fn default_install_timeout() -> u64 {
    600 // 10 minutes
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_watchdog_interval() -> u64 {
    5
}

fn default_max_captured_bytes() -> usize {
    64 * 1024 // 64KB
}

fn default_max_restarts() -> u32 {
    3
}

fn default_health_interval() -> u64 {
    5
}

impl PluginConfig {
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("install_timeout_secs", self.install_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("watchdog_interval_secs", self.watchdog_interval_secs),
            ("health_interval_secs", self.health_interval_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                bail!("plugin.{name} must be at least 1");
            }
        }
        Ok(())
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            overall_timeout: Duration::from_secs(self.install_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            poll_interval: Duration::from_secs(self.watchdog_interval_secs),
            max_captured_bytes: self.max_captured_bytes,
            ..SupervisorConfig::default()
        }
    }

    /// Runtime settings for a plugin started as `python -m <entrypoint>`
    pub fn runtime(&self, entrypoint: &str) -> LocalRuntimeConfig {
        LocalRuntimeConfig {
            entrypoint: entrypoint.to_string(),
            health_interval: Duration::from_secs(self.health_interval_secs),
            max_restarts: self.max_restarts,
            ..LocalRuntimeConfig::default()
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            python_interpreter: default_python_interpreter(),
            install_timeout_secs: default_install_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            watchdog_interval_secs: default_watchdog_interval(),
            max_captured_bytes: default_max_captured_bytes(),
            max_restarts: default_max_restarts(),
            health_interval_secs: default_health_interval(),
        }
    }
}

/// Media bucket configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_media_path")]
    pub path: PathBuf,
}

fn default_media_path() -> PathBuf {
    PathBuf::from("storage/assets")
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            path: default_media_path(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: default_true(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
