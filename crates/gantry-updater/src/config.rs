//! Configuration structures for the update system.
//!
//! Defines which install strategy runs, how often the pipeline is
//! triggered, how versions are compared, and network behavior.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Main update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// URL of the version manifest (JSON)
    #[serde(default)]
    pub manifest_url: Option<String>,

    /// Interval between periodic update checks in minutes
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u32,

    /// Which install strategy applies a verified artifact
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Install without asking the user (silent install)
    #[serde(default)]
    pub auto_install: bool,

    /// How the manifest version is compared with the running version
    #[serde(default)]
    pub version_policy: VersionPolicy,

    /// Installation directory to overwrite (empty = directory of the executable)
    #[serde(default)]
    pub install_dir: Option<PathBuf>,

    /// Feed configuration for the managed updater (delegated strategy)
    #[serde(default)]
    pub feed: Option<FeedConfig>,

    /// External updater program (delegated strategy)
    #[serde(default)]
    pub managed_updater: Option<ManagedUpdaterConfig>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            check_interval_minutes: default_check_interval(),
            strategy: StrategyKind::default(),
            auto_install: false,
            version_policy: VersionPolicy::default(),
            install_dir: None,
            feed: None,
            managed_updater: None,
            network: NetworkConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build configuration from `GANTRY_*` environment variables on top of defaults.
    pub fn load_from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("GANTRY_MANIFEST_URL") {
            config.manifest_url = Some(url);
        }
        if let Ok(strategy) = std::env::var("GANTRY_STRATEGY") {
            match strategy.to_ascii_lowercase().as_str() {
                "manual" => config.strategy = StrategyKind::Manual,
                "delegated" => config.strategy = StrategyKind::Delegated,
                other => tracing::warn!("Ignoring unknown GANTRY_STRATEGY value: {}", other),
            }
        }
        if let Ok(minutes) = std::env::var("GANTRY_CHECK_INTERVAL_MINUTES") {
            if let Ok(value) = minutes.parse::<u32>() {
                config.check_interval_minutes = value;
            }
        }
        if let Ok(flag) = std::env::var("GANTRY_AUTO_INSTALL") {
            config.auto_install = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Ok(dir) = std::env::var("GANTRY_INSTALL_DIR") {
            config.install_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// Check that the configuration can drive a pipeline run.
    pub fn validate(&self) -> Result<(), UpdateError> {
        match &self.manifest_url {
            None => return Err(UpdateError::Config("manifest_url is required".to_string())),
            Some(url) if !(url.starts_with("https://") || url.starts_with("http://")) => {
                return Err(UpdateError::Config(format!(
                    "manifest_url must be an http(s) URL: {}",
                    url
                )));
            }
            Some(_) => {}
        }
        if self.check_interval_minutes == 0 {
            return Err(UpdateError::Config(
                "check_interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.network.timeout_seconds == 0 {
            return Err(UpdateError::Config(
                "network.timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.strategy == StrategyKind::Delegated {
            let feed = self.feed.as_ref().ok_or_else(|| {
                UpdateError::Config("delegated strategy requires a [feed] section".to_string())
            })?;
            feed.validate()?;
        }
        Ok(())
    }

    /// Interval between periodic checks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.check_interval_minutes) * 60)
    }
}

/// Install strategy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Extract the archive and move its entries over the install directory
    #[default]
    Manual,
    /// Hand the artifact to the platform's managed updater
    Delegated,
}

/// Rule deciding whether a manifest version constitutes an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Any version string that differs from the running one is an update
    #[default]
    Exact,
    /// Only a strictly greater semantic version is an update
    Semver,
}

/// Managed updater feed provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedProvider {
    Generic,
    Github,
}

/// Feed consumed by the managed updater capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub provider: FeedProvider,
    /// Base URL (generic provider)
    #[serde(default)]
    pub url: Option<String>,
    /// Repository owner (github provider)
    #[serde(default)]
    pub owner: Option<String>,
    /// Repository name (github provider)
    #[serde(default)]
    pub repo: Option<String>,
    /// Access token for private feeds
    #[serde(default)]
    pub token: Option<String>,
}

impl FeedConfig {
    pub fn validate(&self) -> Result<(), UpdateError> {
        match self.provider {
            FeedProvider::Generic if self.url.is_none() => Err(UpdateError::Config(
                "generic feed requires a url".to_string(),
            )),
            FeedProvider::Github if self.owner.is_none() || self.repo.is_none() => Err(
                UpdateError::Config("github feed requires owner and repo".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Resolve the feed URL handed to the managed updater.
    pub fn feed_url(&self) -> Result<String, UpdateError> {
        self.validate()?;
        match self.provider {
            FeedProvider::Generic => Ok(self.url.clone().unwrap_or_default()),
            FeedProvider::Github => Ok(format!(
                "https://github.com/{}/{}/releases/latest/download",
                self.owner.as_deref().unwrap_or_default(),
                self.repo.as_deref().unwrap_or_default()
            )),
        }
    }
}

/// External program that installs a staged package once the app quits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedUpdaterConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Network configuration for manifest fetches and downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connect and request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Read timeout while streaming a download in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// Maximum retry attempts for transient network failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            read_timeout_seconds: default_read_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            user_agent: default_user_agent(),
        }
    }
}

// Default value functions for serde
fn default_check_interval() -> u32 {
    60
}

fn default_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_user_agent() -> String {
    format!("gantry-updater/{}", env!("CARGO_PKG_VERSION"))
}
