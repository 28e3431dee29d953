//! Configuration management for castwatch

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Stream quality preference, with an ordered fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Best,
    High,
    Medium,
    Low,
}

impl Quality {
    /// The variant name as the capture tool expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Best => "best",
            Quality::High => "high",
            Quality::Medium => "medium",
            Quality::Low => "low",
        }
    }

    /// Qualities to try in order when the requested one is unavailable.
    ///
    /// "best" is not a concrete variant in fallback payloads, so it maps to
    /// the full high → medium → low chain.
    pub fn fallback_order(&self) -> Vec<Quality> {
        match self {
            Quality::Best => vec![Quality::High, Quality::Medium, Quality::Low],
            Quality::High => vec![Quality::High, Quality::Medium, Quality::Low],
            Quality::Medium => vec![Quality::Medium, Quality::Low],
            Quality::Low => vec![Quality::Low],
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Polling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between liveness checks while the target is offline
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds to wait after a session ends before polling again
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Upper bound for the random delay before each probe, to avoid
    /// synchronized polling across many instances
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

fn default_poll_interval() -> u64 {
    15
}

fn default_retry_delay() -> u64 {
    15
}

fn default_jitter_max_ms() -> u64 {
    2000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            retry_delay_secs: default_retry_delay(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

/// Capture process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_quality")]
    pub quality: Quality,
    /// Capture attempts per session before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Kill the capture if the artifact stops growing for this long
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
    /// Kill the capture if the output file never appears within this window
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Time between terminate and kill when stopping the child
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Skip the grace period and artifact preservation on shutdown
    #[serde(default)]
    pub fast_exit: bool,
    /// Ask the capture tool to rewind to the start of the live broadcast
    #[serde(default = "default_live_restart")]
    pub live_restart: bool,
}

fn default_quality() -> Quality {
    Quality::Best
}

fn default_max_retries() -> u32 {
    3
}

fn default_stall_timeout() -> u64 {
    60
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_grace_period() -> u64 {
    5
}

fn default_live_restart() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            max_retries: default_max_retries(),
            stall_timeout_secs: default_stall_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            grace_period_secs: default_grace_period(),
            fast_exit: false,
            live_restart: default_live_restart(),
        }
    }
}

/// Artifact validation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Minimum artifact size in KiB before a capture counts as real
    #[serde(default = "default_min_size_kib")]
    pub min_size_kib: u64,
    /// Minimum probed media duration in seconds
    #[serde(default = "default_min_duration")]
    pub min_duration_secs: f64,
}

fn default_min_size_kib() -> u64 {
    100
}

fn default_min_duration() -> f64 {
    5.0
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_size_kib: default_min_size_kib(),
            min_duration_secs: default_min_duration(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_directory")]
    pub directory: String,
    /// Refuse to start when the save folder's filesystem has less than this
    #[serde(default = "default_min_free_gb")]
    pub min_free_space_gb: f64,
}

fn default_directory() -> String {
    "~/castwatch_recordings".to_string()
}

fn default_min_free_gb() -> f64 {
    1.0
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            min_free_space_gb: default_min_free_gb(),
        }
    }
}

/// Authentication configuration.
///
/// Credentials are never read from the config file, only from the
/// environment, so a shared config.toml stays safe to pass around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Password for private streams (CASTWATCH_STREAM_PASSWORD)
    #[serde(skip)]
    pub stream_password: Option<String>,
    /// Semicolon-separated cookie pairs (CASTWATCH_COOKIES)
    #[serde(skip)]
    pub cookies: Option<String>,
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/101.0.4951.67 Safari/537.36"
        .to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            stream_password: None,
            cookies: None,
        }
    }
}

impl AuthConfig {
    /// Split the cookie string into individual non-empty pairs.
    pub fn cookie_pairs(&self) -> Vec<String> {
        self.cookies
            .as_deref()
            .unwrap_or("")
            .split(';')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Config {
    /// Get the config file path (~/.config/castwatch/config.toml)
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        Ok(config_dir.join("config.toml"))
    }

    /// Get the config directory path (~/.config/castwatch)
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("castwatch"))
    }

    /// Load configuration from file, or return defaults if not found.
    /// Environment credentials are applied on top in both cases.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?
        } else {
            Config::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Pull credentials from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var("CASTWATCH_STREAM_PASSWORD") {
            if !password.is_empty() {
                self.auth.stream_password = Some(password);
            }
        }
        if let Ok(cookies) = std::env::var("CASTWATCH_COOKIES") {
            if !cookies.is_empty() {
                self.auth.cookies = Some(cookies);
            }
        }
    }

    /// Expand ~ in storage directory path
    pub fn storage_directory(&self) -> PathBuf {
        let dir = &self.storage.directory;
        if let Some(stripped) = dir.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        }
        PathBuf::from(dir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.monitor.retry_delay_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.capture.stall_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.capture.startup_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.capture.grace_period_secs)
    }

    pub fn min_artifact_bytes(&self) -> u64 {
        self.validation.min_size_kib * 1024
    }
}
