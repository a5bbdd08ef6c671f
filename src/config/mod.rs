//! # Configuration Management Module
//!
//! All gateway configuration is sourced from the process environment, with an
//! optional `DATA_DIR/.env` file (plain `KEY=VALUE` lines) providing defaults
//! for unattended deployments. Precedence: process environment > env file >
//! built-in defaults.
//!
//! ## Recognized keys
//!
//! | key | default | effect |
//! |---|---|---|
//! | `SERIAL_PORT` | `/dev/ttyACM0` | serial endpoint of the radio modem |
//! | `SERIAL_BAUD` | `115200` | modem baud rate |
//! | `DATA_DIR` | `/var/lib/meshnotes` | database + env file directory |
//! | `DRY_RUN` | `false` | skip real HTTPS calls and radio transmissions |
//! | `LOG_LEVEL` | `info` | log verbosity |
//! | `TZ` | unset | display timezone for listings and the "today" boundary |
//! | `DAILY_BROADCAST_ENABLED` | `false` | one gateway advertisement per day |
//! | `POS_GOOD` | `15` | position age (s) below which a fix is "good" |
//! | `POS_MAX` | `60` | maximum acceptable position age (s) |
//! | `OSM_RATE_LIMIT_SECONDS` | `3` | minimum spacing between note uploads |
//! | `WORKER_INTERVAL` | `30` | flush worker period (s) |
//! | `LANGUAGE` | `en` | attribution-line language hint (`en`/`es`) |

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Runtime configuration for the gateway, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub serial_port: String,
    pub serial_baud: u32,
    pub data_dir: PathBuf,
    pub dry_run: bool,
    pub log_level: String,
    pub daily_broadcast_enabled: bool,
    pub pos_good_secs: u64,
    pub pos_max_secs: u64,
    pub osm_rate_limit_secs: u64,
    pub worker_interval_secs: u64,
    pub language: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyACM0".to_string(),
            serial_baud: 115_200,
            data_dir: PathBuf::from("/var/lib/meshnotes"),
            dry_run: false,
            log_level: "info".to_string(),
            daily_broadcast_enabled: false,
            pos_good_secs: 15,
            pos_max_secs: 60,
            osm_rate_limit_secs: 3,
            worker_interval_secs: 30,
            language: "en".to_string(),
        }
    }
}

impl Config {
    /// Resolve configuration from the process environment, consulting
    /// `DATA_DIR/.env` (and `./.env` as a fallback) for keys the environment
    /// does not set.
    pub fn from_env() -> Result<Self> {
        // DATA_DIR itself can only come from the real environment; the env
        // file lives inside it.
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/meshnotes"));

        let mut file_vars = HashMap::new();
        for candidate in [data_dir.join(".env"), PathBuf::from(".env")] {
            if candidate.is_file() {
                file_vars = parse_env_file(&candidate)?;
                break;
            }
        }

        let source = EnvSource { file_vars };
        Self::resolve(data_dir, &source)
    }

    fn resolve(data_dir: PathBuf, source: &EnvSource) -> Result<Self> {
        let defaults = Config::default();
        let cfg = Config {
            serial_port: source.get("SERIAL_PORT").unwrap_or(defaults.serial_port),
            serial_baud: source.get_parsed("SERIAL_BAUD", defaults.serial_baud)?,
            data_dir,
            dry_run: source.get_bool("DRY_RUN", defaults.dry_run),
            log_level: source.get("LOG_LEVEL").unwrap_or(defaults.log_level),
            daily_broadcast_enabled: source
                .get_bool("DAILY_BROADCAST_ENABLED", defaults.daily_broadcast_enabled),
            pos_good_secs: source.get_parsed("POS_GOOD", defaults.pos_good_secs)?,
            pos_max_secs: source.get_parsed("POS_MAX", defaults.pos_max_secs)?,
            osm_rate_limit_secs: source
                .get_parsed("OSM_RATE_LIMIT_SECONDS", defaults.osm_rate_limit_secs)?,
            worker_interval_secs: source
                .get_parsed("WORKER_INTERVAL", defaults.worker_interval_secs)?,
            language: source.get("LANGUAGE").unwrap_or(defaults.language),
        };

        if cfg.pos_good_secs >= cfg.pos_max_secs {
            return Err(anyhow!(
                "POS_GOOD ({}) must be below POS_MAX ({})",
                cfg.pos_good_secs,
                cfg.pos_max_secs
            ));
        }
        Ok(cfg)
    }

    /// Path of the embedded database file under `DATA_DIR`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("meshnotes.db")
    }
}

/// Key lookup that layers the process environment over an env file.
struct EnvSource {
    file_vars: HashMap<String, String>,
}

impl EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        match std::env::var(key) {
            Ok(v) if !v.is_empty() => Some(v),
            _ => self.file_vars.get(key).cloned(),
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            None => default,
        }
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(v) => v
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("invalid value for {}: {}", key, e)),
            None => Ok(default),
        }
    }
}

/// Parse a `KEY=VALUE` env file. Blank lines and `#` comments are skipped;
/// surrounding single or double quotes on values are stripped.
fn parse_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read env file {}: {}", path.display(), e))?;
    let mut vars = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            if !key.is_empty() {
                vars.insert(key.to_string(), value.to_string());
            }
        }
    }
    Ok(vars)
}
