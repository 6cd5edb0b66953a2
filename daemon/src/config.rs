//! Daemon configuration

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Archive tool configuration
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Users allowed to authenticate, keyed by username
    #[serde(default)]
    pub user: HashMap<String, UserConfig>,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid configuration {}", path.display()))
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive.program.as_os_str().is_empty() {
            bail!("archive.program must not be empty");
        }
        if self.user.keys().any(|name| name.is_empty()) {
            bail!("user names must not be empty");
        }
        Ok(())
    }

    /// Socket address to listen on
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            archive: ArchiveConfig::default(),
            user: HashMap::new(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8030
}

/// Archive tool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// `evr` executable, looked up in PATH unless absolute
    #[serde(default = "default_program")]
    pub program: PathBuf,
}

fn default_program() -> PathBuf {
    PathBuf::from("evr")
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
        }
    }
}

/// Credentials of one user
#[derive(Clone, Deserialize)]
pub struct UserConfig {
    pub password: String,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default)]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090)
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: false,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
