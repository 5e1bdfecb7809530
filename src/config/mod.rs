use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::{env, fs};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "orderly.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Longest accepted frame, excluding the trailing newline.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            max_frame_bytes: 256_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    /// Cron expression for the snapshot job.
    pub schedule: String,
    /// Cron expression for the age/size report job.
    pub report_schedule: String,
    /// Cron expression for the retention pass.
    pub prune_schedule: String,
    pub retention_days: u32,
    pub name_prefix: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: "0 */5 * * * *".to_string(),
            report_schedule: "0 * * * * *".to_string(),
            prune_schedule: "0 0 * * * *".to_string(),
            retention_days: 7,
            name_prefix: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// `filesystem` or `memory`.
    pub kind: String,
    pub dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: "filesystem".to_string(),
            dir: Some(PathBuf::from("./snapshots")),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub server: ServerConfig,
    pub snapshot: SnapshotConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            snapshot: SnapshotConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("ORDERLY_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = env::var("ORDERLY_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind_addr must be set".into()));
        }
        if self.server.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_frame_bytes must be greater than zero".into(),
            ));
        }

        if self.snapshot.enabled {
            if self.snapshot.retention_days == 0 {
                return Err(ConfigError::Invalid(
                    "snapshot.retention_days must be at least 1".into(),
                ));
            }
            let prefix = Path::new(&self.snapshot.name_prefix);
            if prefix
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(ConfigError::Invalid(
                    "snapshot.name_prefix must be a relative path".into(),
                ));
            }
        }

        match self.storage.kind.as_str() {
            "filesystem" if self.storage.dir.is_none() => Err(ConfigError::Invalid(
                "storage.dir must be set for the filesystem store".into(),
            )),
            "filesystem" | "memory" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "storage.kind `{other}` is not supported"
            ))),
        }
    }
}

/// Resolves the config path: an explicit path wins, then `ORDERLY_CONFIG`,
/// then [`DEFAULT_CONFIG_PATH`].
pub fn config_path(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| env::var("ORDERLY_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let raw: String = fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&raw)?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}
