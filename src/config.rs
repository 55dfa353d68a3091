use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::migrate::{MigrationOptions, DEFAULT_REINDEX_BATCH_SIZE, DEFAULT_VERSION_POLL_INTERVAL};
use crate::retry::{RetryPolicy, DEFAULT_UPGRADE_RETRIES, DEFAULT_UPGRADE_RETRY_DELAY};
use crate::store::DEFAULT_PAGE_SIZE;

/// Names the optional TOML config file.
pub const CONFIG_PATH_VAR: &str = "MIGRATOR_CONFIG";

pub const DEFAULT_DB_PATH: &str = "./data/store.db";
pub const DEFAULT_LOG_FILTER: &str = "info,bucket_migrator=debug";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(AppError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
    /// Daily-rolling log files and crash reports go here when set.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::Compact,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    pub db_path: PathBuf,
    pub version_poll_secs: u64,
    pub upgrade_retries: u32,
    pub upgrade_retry_secs: u64,
    pub reindex_batch_size: u32,
    pub page_size: usize,
    pub log: LogConfig,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            version_poll_secs: DEFAULT_VERSION_POLL_INTERVAL.as_secs(),
            upgrade_retries: DEFAULT_UPGRADE_RETRIES,
            upgrade_retry_secs: DEFAULT_UPGRADE_RETRY_DELAY.as_secs(),
            reindex_batch_size: DEFAULT_REINDEX_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            log: LogConfig::default(),
        }
    }
}

impl MigratorConfig {
    /// `.env`, then the file named by `MIGRATOR_CONFIG`, then `MIGRATOR_*`
    /// environment overrides.
    pub fn load() -> Result<Self, AppError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(AppError::Config(format!(".env: {e}")));
            }
        }

        let mut config = match env_var_nonempty(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(env_var_nonempty)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, AppError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `MIGRATOR_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MIGRATOR_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MIGRATOR_LOG_DIR") {
            self.log.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("MIGRATOR_LOG_FORMAT") {
            self.log.format = v.parse()?;
        }
        if let Some(v) = lookup("MIGRATOR_VERSION_POLL_SECS") {
            self.version_poll_secs = parse_number("MIGRATOR_VERSION_POLL_SECS", &v)?;
        }
        if let Some(v) = lookup("MIGRATOR_UPGRADE_RETRIES") {
            self.upgrade_retries = parse_number("MIGRATOR_UPGRADE_RETRIES", &v)?;
        }
        if let Some(v) = lookup("MIGRATOR_UPGRADE_RETRY_SECS") {
            self.upgrade_retry_secs = parse_number("MIGRATOR_UPGRADE_RETRY_SECS", &v)?;
        }
        if let Some(v) = lookup("MIGRATOR_REINDEX_BATCH") {
            self.reindex_batch_size = parse_number("MIGRATOR_REINDEX_BATCH", &v)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.reindex_batch_size == 0 {
            return Err(AppError::Config("reindex_batch_size must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(AppError::Config("page_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn migration_options(&self) -> MigrationOptions {
        MigrationOptions {
            version_poll_interval: Duration::from_secs(self.version_poll_secs),
            upgrade_retry: RetryPolicy {
                retries: self.upgrade_retries,
                delay: Duration::from_secs(self.upgrade_retry_secs),
            },
            reindex_batch_size: self.reindex_batch_size,
            page_size: self.page_size,
        }
    }
}

/// Value of `key`, ignoring unset and blank variables.
fn env_var_nonempty(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, AppError> {
    raw.parse()
        .map_err(|_| AppError::Config(format!("{key}: '{raw}' is not a valid number")))
}
