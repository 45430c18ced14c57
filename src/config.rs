//! Process configuration, built from environment variables.
//!
//! A `.env` file in the working directory is loaded first (see `main`);
//! real environment variables take precedence over it.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::album::{self, AlbumConfig, AlbumWindowPolicy};
use crate::pipeline::batch::{self, BatchPacing};

const DEFAULT_DB_PATH: &str = "./data/autoforward.db";

/// Forwarder configuration.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub bot_token: SecretString,
    pub db_path: PathBuf,
    /// Users allowed to run admin commands.
    pub admin_ids: Vec<i64>,
    pub album: AlbumConfig,
    /// Cache task lookups per source chat.
    pub task_cache: bool,
    /// JSON array of task records upserted at startup.
    pub seed_file: Option<PathBuf>,
    /// Directory for daily-rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub batch_pacing: BatchPacing,
}

impl ForwarderConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bot_token = var("TELEGRAM_BOT_TOKEN")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        let db_path = var("FORWARDER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let admin_ids = match var("FORWARDER_ADMIN_IDS") {
            Some(raw) => parse_id_list("FORWARDER_ADMIN_IDS", &raw)?,
            None => Vec::new(),
        };

        let window = parse_millis(&var, "FORWARDER_ALBUM_WINDOW_MS")?.unwrap_or(album::DEFAULT_WINDOW);
        let max_window =
            parse_millis(&var, "FORWARDER_ALBUM_MAX_WINDOW_MS")?.unwrap_or(album::DEFAULT_MAX_WINDOW);
        if window.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "FORWARDER_ALBUM_WINDOW_MS".into(),
                message: "album window must be positive".into(),
            });
        }
        let policy: AlbumWindowPolicy = match var("FORWARDER_ALBUM_POLICY") {
            Some(raw) => raw.parse()?,
            None => AlbumWindowPolicy::default(),
        };

        let task_cache = match var("FORWARDER_TASK_CACHE") {
            Some(raw) => parse_bool("FORWARDER_TASK_CACHE", &raw)?,
            None => true,
        };

        let between = parse_millis(&var, "FORWARDER_BATCH_PACE_MS")?.unwrap_or(batch::DEFAULT_PACE);

        Ok(Self {
            bot_token,
            db_path,
            admin_ids,
            album: AlbumConfig {
                window,
                max_window,
                policy,
            },
            task_cache,
            seed_file: var("FORWARDER_SEED_FILE").map(PathBuf::from),
            log_dir: var("FORWARDER_LOG_DIR").map(PathBuf::from),
            batch_pacing: BatchPacing {
                between,
                // Back off twice as long after a failed copy.
                after_error: between * 2,
            },
        })
    }
}

fn parse_millis(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    var(key)
        .map(|raw| {
            raw.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.into(),
                    message: format!("'{raw}' is not a number of milliseconds: {e}"),
                })
        })
        .transpose()
}

fn parse_id_list(key: &str, raw: &str) -> Result<Vec<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| ConfigError::InvalidValue {
                key: key.into(),
                message: format!("'{s}' is not a numeric user id"),
            })
        })
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.into(),
            message: format!("'{other}' is not a boolean"),
        }),
    }
}
