//! TOML configuration, merged from `$HOME/.notesync.conf` then
//! `$PWD/notesync.conf`. Either file may be absent; values from the
//! later file override the earlier one, and built-in defaults fill the
//! rest.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};
use thiserror::Error;

pub const CONFIG_NAME: &str = "notesync.conf";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Read(#[from] io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub private_key: String,
    pub access_token_expiry: String,
    pub refresh_token_expiry: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "notesync.db".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            private_key: "notesync.key".to_string(),
            access_token_expiry: "15m".to_string(),
            refresh_token_expiry: "720h".to_string(),
        }
    }
}

impl AuthConfig {
    pub fn access_expiry(&self) -> Result<Duration, ConfigError> {
        parse_duration("auth.access_token_expiry", &self.access_token_expiry)
    }

    pub fn refresh_expiry(&self) -> Result<Duration, ConfigError> {
        parse_duration("auth.refresh_token_expiry", &self.refresh_token_expiry)
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value)
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))
}

/// Load configuration from the standard locations.
pub fn load() -> Result<Config, ConfigError> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(format!(".{}", CONFIG_NAME)));
    }
    paths.push(PathBuf::from(CONFIG_NAME));
    load_from(&paths)
}

/// Load and merge the given files in order; missing files are skipped.
pub fn load_from(paths: &[PathBuf]) -> Result<Config, ConfigError> {
    let mut merged = toml::Table::new();
    for path in paths {
        if let Some(table) = read_table(path)? {
            merge_tables(&mut merged, table);
        }
    }

    let cfg: Config = toml::Value::Table(merged).try_into()?;
    validate(&cfg)?;
    Ok(cfg)
}

fn read_table(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.parse::<toml::Table>()?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Read(e)),
    }
}

/// Recursive table merge: scalar values from `over` replace those in
/// `base`, nested tables merge key by key.
fn merge_tables(base: &mut toml::Table, over: toml::Table) {
    for (key, value) in over {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(b)), toml::Value::Table(o)) => merge_tables(b, o),
            (_, v) => {
                base.insert(key, v);
            }
        }
    }
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.listen.is_empty() {
        return Err(ConfigError::Invalid("server.listen must not be empty".into()));
    }
    if cfg.database.path.is_empty() {
        return Err(ConfigError::Invalid("database.path must not be empty".into()));
    }
    if cfg.auth.private_key.is_empty() {
        return Err(ConfigError::Invalid("auth.private_key must not be empty".into()));
    }
    cfg.auth.access_expiry()?;
    cfg.auth.refresh_expiry()?;
    Ok(())
}
