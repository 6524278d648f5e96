//! Configuration loader and validator for the bulk sender.
//!
//! Values are layered: command-line flag, then environment variable (both via
//! clap), then the optional YAML file, then built-in defaults.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::db::SqlIdent;
use crate::rate::RateConfig;

pub const DEFAULT_TABLE: &str = "users";
pub const DEFAULT_ID_FIELD: &str = "user_id";
pub const DEFAULT_RATE: u32 = 15;
pub const DEFAULT_CONCURRENCY: usize = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root of the YAML file. Every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub telegram: Telegram,
    pub store: Store,
    pub dispatch: Dispatch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Telegram {
    pub bot_token: Option<String>,
}

/// Where user documents live.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Store {
    pub database_url: Option<String>,
    pub table: Option<String>,
    pub id_field: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Dispatch {
    pub rate: Option<u32>,
    pub concurrency: Option<usize>,
}

/// Values supplied by flags or environment; these win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bot_token: Option<String>,
    pub database_url: Option<String>,
    pub table: Option<String>,
    pub id_field: Option<String>,
    pub rate: Option<u32>,
    pub concurrency: Option<usize>,
}

/// Fully resolved and validated settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bot_token: Option<String>,
    pub database_url: String,
    pub table: SqlIdent,
    pub id_field: SqlIdent,
    pub rate: RateConfig,
}

impl Settings {
    pub fn resolve(file: FileConfig, overrides: Overrides) -> Result<Settings, ConfigError> {
        let bot_token = first_non_empty(overrides.bot_token, file.telegram.bot_token);
        let database_url = first_non_empty(overrides.database_url, file.store.database_url)
            .ok_or(ConfigError::Missing("store connection string (DATABASE_URL)"))?;
        let table = first_non_empty(overrides.table, file.store.table)
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        let id_field = first_non_empty(overrides.id_field, file.store.id_field)
            .unwrap_or_else(|| DEFAULT_ID_FIELD.to_string());

        let table = SqlIdent::parse(&table)
            .ok_or_else(|| ConfigError::Invalid(format!("store.table {table:?} is not a valid identifier")))?;
        let id_field = SqlIdent::parse(&id_field).ok_or_else(|| {
            ConfigError::Invalid(format!("store.id_field {id_field:?} is not a valid identifier"))
        })?;

        let rate = RateConfig::new(
            overrides.rate.or(file.dispatch.rate).unwrap_or(DEFAULT_RATE),
            overrides
                .concurrency
                .or(file.dispatch.concurrency)
                .unwrap_or(DEFAULT_CONCURRENCY),
        );

        Ok(Settings {
            bot_token,
            database_url,
            table,
            id_field,
            rate,
        })
    }

    /// The bot token is only needed once something is actually sent.
    pub fn require_bot_token(&self) -> Result<&str, ConfigError> {
        self.bot_token
            .as_deref()
            .ok_or(ConfigError::Missing("telegram bot token (TELEGRAM_BOT_TOKEN)"))
    }
}

fn first_non_empty(primary: Option<String>, fallback: Option<String>) -> Option<String> {
    primary
        .filter(|v| !v.trim().is_empty())
        .or_else(|| fallback.filter(|v| !v.trim().is_empty()))
        .map(|v| v.trim().to_string())
}

/// Load the YAML file at `path`. A missing file yields the empty config so
/// that environment-only deployments work.
pub fn load(path: Option<&Path>) -> Result<FileConfig, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    let cfg: FileConfig = serde_yaml::from_str(&content)?;
    Ok(cfg)
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"

store:
  database_url: "sqlite://./data/users.db"
  table: "users"
  id_field: "user_id"

dispatch:
  rate: 15
  concurrency: 1
"#
}
