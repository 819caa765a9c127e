use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::{HEALTH_CHECK_PATH, REGISTRATION_TOPIC};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Upper bound on health checks running at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_check_port")]
    pub check_port: u16,
    #[serde(default = "default_check_path")]
    pub check_path: String,
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_registration_topic")]
    pub registration_topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_check_port() -> u16 {
    80
}

fn default_check_path() -> String {
    HEALTH_CHECK_PATH.to_string()
}

fn default_check_timeout() -> u64 {
    5
}

fn default_window() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/device-healthd/devices.db")
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "device-healthd".to_string()
}

fn default_registration_topic() -> String {
    REGISTRATION_TOPIC.to_string()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_listen() -> String {
    "[::]:8090".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            check_port: default_check_port(),
            check_path: default_check_path(),
            check_timeout_secs: default_check_timeout(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            registration_topic: default_registration_topic(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health.max_concurrent == 0 {
            bail!("health.max_concurrent must be at least 1");
        }
        if self.health.check_timeout_secs == 0 {
            bail!("health.check_timeout_secs must be at least 1");
        }
        if self.dedup.cleanup_interval_secs == 0 {
            bail!("dedup.cleanup_interval_secs must be at least 1");
        }
        Ok(())
    }
}
