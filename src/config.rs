use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gateway::{
    transport::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT},
    GatewayConfig, TransportConfig, DEFAULT_AUTH_EXPIRED_CODE, DEFAULT_REFRESH_PATH,
    DEFAULT_SUCCESS_CODE,
};

const DEFAULT_ENV_PREFIX: &str = "CONFESSIONS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_user_agent() -> String {
    format!("confession-board/{}", crate::VERSION)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    #[serde(default = "default_success_code")]
    pub success_code: i64,
    #[serde(default = "default_auth_expired_code")]
    pub auth_expired_code: i64,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            success_code: default_success_code(),
            auth_expired_code: default_auth_expired_code(),
            refresh_path: default_refresh_path(),
        }
    }
}

fn default_success_code() -> i64 {
    DEFAULT_SUCCESS_CODE
}

fn default_auth_expired_code() -> i64 {
    DEFAULT_AUTH_EXPIRED_CODE
}

fn default_refresh_path() -> String {
    DEFAULT_REFRESH_PATH.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

impl Config {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            base_url: self.api.base_url.clone(),
            user_agent: self.api.user_agent.clone(),
            timeout: self.api.timeout,
            http_client: None,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            success_code: self.gateway.success_code,
            auth_expired_code: self.gateway.auth_expired_code,
            refresh_path: self.gateway.refresh_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

/// Defaults, then the YAML file, then `<PREFIX>_<SECTION>__<KEY>` variables.
pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    let path = options.config_file.or_else(default_config_path);
    if let Some(path) = path {
        if path.exists() {
            cfg = read_config_file(&path)?;
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    for (key, value) in load_env(prefix) {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn load_env(prefix: &str) -> Vec<(String, String)> {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    env::vars()
        .filter_map(|(key, value)| {
            let stripped = key.strip_prefix(&upper_prefix)?;
            Some((stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect()
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.api.timeout = duration;
            }
        }
        "gateway.success_code" => {
            if let Ok(parsed) = value.parse::<i64>() {
                cfg.gateway.success_code = parsed;
            }
        }
        "gateway.auth_expired_code" => {
            if let Ok(parsed) = value.parse::<i64>() {
                cfg.gateway.auth_expired_code = parsed;
            }
        }
        "gateway.refresh_path" => cfg.gateway.refresh_path = value,
        "storage.path" => {
            cfg.storage.path = if value.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }
        "logging.level" => cfg.logging.level = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("confession-board").join("config.yaml"))
}

/// Points the client at another backend, keeping the rest of the file.
pub fn save_server(path: Option<PathBuf>, base_url: &str) -> Result<PathBuf> {
    let base_url = base_url.trim();
    anyhow::ensure!(!base_url.is_empty(), "config: api.base_url is required");
    url::Url::parse(base_url)
        .with_context(|| format!("config: api.base_url {base_url} is not a valid URL"))?;

    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };
    cfg.api.base_url = base_url.to_string();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}
