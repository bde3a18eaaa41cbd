//! Environment-driven configuration. A `.env` file next to the binary is
//! honored via dotenvy before this module reads anything.

use std::path::PathBuf;

use thiserror::Error;

use crate::sync::paths::SkipOptions;

const DEFAULT_CONCURRENCY: usize = 5;
const DEFAULT_CONFIG_DIR: &str = ".vaultsync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
    #[error("no data directory available for the state database")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub token: String,
    /// Empty string means end-to-end encryption is off.
    pub password: String,
    pub local_root: PathBuf,
    pub db_path: PathBuf,
    pub concurrency: usize,
    /// Files with a comparable size above this are skipped; 0 or negative
    /// disables the policy.
    pub skip_size_larger_than: i64,
    pub sync_underscore_items: bool,
    pub sync_config_dir: bool,
    pub config_dir: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup("VAULTSYNC_BASE_URL")
            .ok_or(ConfigError::MissingVar("VAULTSYNC_BASE_URL"))?;
        let token =
            lookup("VAULTSYNC_TOKEN").ok_or(ConfigError::MissingVar("VAULTSYNC_TOKEN"))?;
        let local_root = lookup("VAULTSYNC_ROOT")
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingVar("VAULTSYNC_ROOT"))?;

        let db_path = match lookup("VAULTSYNC_DB") {
            Some(path) => PathBuf::from(path),
            None => dirs::data_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join("vaultsync")
                .join("vaultsync.db"),
        };

        let concurrency = parse_or("VAULTSYNC_CONCURRENCY", &lookup, DEFAULT_CONCURRENCY)?;
        let skip_size_larger_than = parse_or("VAULTSYNC_SKIP_SIZE_LARGER_THAN", &lookup, 0i64)?;

        Ok(Self {
            base_url,
            token,
            password: lookup("VAULTSYNC_PASSWORD").unwrap_or_default(),
            local_root,
            db_path,
            concurrency,
            skip_size_larger_than,
            sync_underscore_items: bool_or("VAULTSYNC_UNDERSCORE_ITEMS", &lookup, false)?,
            sync_config_dir: bool_or("VAULTSYNC_SYNC_CONFIG_DIR", &lookup, false)?,
            config_dir: lookup("VAULTSYNC_CONFIG_DIR")
                .unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string()),
        })
    }

    pub fn encrypted(&self) -> bool {
        !self.password.is_empty()
    }

    pub fn skip_options(&self) -> SkipOptions {
        SkipOptions {
            sync_config_dir: self.sync_config_dir,
            config_dir: self.config_dir.clone(),
            sync_underscore_items: self.sync_underscore_items,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(default),
    }
}

fn bool_or(
    var: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(var) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { var, value }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env<'a>(pairs: &'a [(&str, &str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn minimal_configuration_uses_defaults() {
        let config = SyncConfig::from_lookup(env(&[
            ("VAULTSYNC_BASE_URL", "https://store.example"),
            ("VAULTSYNC_TOKEN", "tok"),
            ("VAULTSYNC_ROOT", "/vault"),
            ("VAULTSYNC_DB", "/tmp/state.db"),
        ]))
        .unwrap();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.skip_size_larger_than, 0);
        assert!(!config.encrypted());
        assert!(!config.sync_underscore_items);
        assert_eq!(config.config_dir, DEFAULT_CONFIG_DIR);
    }

    #[test]
    fn missing_required_variables_are_reported() {
        let err = SyncConfig::from_lookup(env(&[("VAULTSYNC_TOKEN", "tok")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("VAULTSYNC_BASE_URL")));
    }

    #[test]
    fn parses_numbers_and_booleans() {
        let config = SyncConfig::from_lookup(env(&[
            ("VAULTSYNC_BASE_URL", "https://store.example"),
            ("VAULTSYNC_TOKEN", "tok"),
            ("VAULTSYNC_ROOT", "/vault"),
            ("VAULTSYNC_DB", "/tmp/state.db"),
            ("VAULTSYNC_CONCURRENCY", "1"),
            ("VAULTSYNC_SKIP_SIZE_LARGER_THAN", "1048576"),
            ("VAULTSYNC_UNDERSCORE_ITEMS", "true"),
            ("VAULTSYNC_PASSWORD", "hunter2"),
        ]))
        .unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.skip_size_larger_than, 1_048_576);
        assert!(config.sync_underscore_items);
        assert!(config.encrypted());
    }

    #[test]
    fn rejects_garbage_values() {
        let err = SyncConfig::from_lookup(env(&[
            ("VAULTSYNC_BASE_URL", "https://store.example"),
            ("VAULTSYNC_TOKEN", "tok"),
            ("VAULTSYNC_ROOT", "/vault"),
            ("VAULTSYNC_DB", "/tmp/state.db"),
            ("VAULTSYNC_CONCURRENCY", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "VAULTSYNC_CONCURRENCY",
                ..
            }
        ));
    }
}
