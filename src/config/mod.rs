//! Configuration management for polyswarm
//!
//! Two layers:
//! - `AppConfig`: process-level settings loaded from `config/*` files and
//!   `POLYSWARM__*` environment variables (after `.env`)
//! - `BotConfig`: per-bot profile, persisted with the bot and hot-reloaded through
//!   partial JSON updates

mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub persistence: PersistenceConfig,
    pub swarm: SwarmConfig,
    /// Profile given to newly registered bots
    #[serde(default)]
    pub bot_defaults: BotConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Default filter when RUST_LOG is unset
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwarmConfig {
    /// Upper bound on waiting for a bot task to wind down
    pub stop_timeout_secs: u64,
    /// First backoff delay after a transient tick error
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
    /// How long fetched candles are shared between bots
    pub candle_cache_ttl_ms: u64,
    /// Restart bots whose persisted status was running
    pub resume_on_start: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            persistence: PersistenceConfig::default(),
            swarm: SwarmConfig::default(),
            bot_defaults: BotConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info,polyswarm=debug".to_string(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 45,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000, // 30s
            candle_cache_ttl_ms: 5_000,
            resume_on_start: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Logging defaults
            .set_default("logging.json", false)?
            .set_default("logging.filter", "info,polyswarm=debug")?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            // Swarm defaults
            .set_default("swarm.stop_timeout_secs", 45)?
            .set_default("swarm.backoff_base_ms", 500)?
            .set_default("swarm.backoff_max_ms", 30_000)?
            .set_default("swarm.candle_cache_ttl_ms", 5_000)?
            .set_default("swarm.resume_on_start", true)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (POLYSWARM__*)
            .add_source(Environment::with_prefix("POLYSWARM").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .bot_defaults
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid bot_defaults: {}", e))?;

        Ok(app_config)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "data_dir={} json_logs={} stop_timeout={}s backoff={}..{}ms mode={:?}",
            self.persistence.data_dir,
            self.logging.json,
            self.swarm.stop_timeout_secs,
            self.swarm.backoff_base_ms,
            self.swarm.backoff_max_ms,
            self.bot_defaults.mode
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

/// A bot's saved profile plus the switch selecting it over the built-in defaults.
///
/// Disabling never discards the profile; re-enabling restores it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfigProfile {
    pub profile: BotConfig,
    pub enabled: bool,
}

impl ConfigProfile {
    pub fn new(profile: BotConfig) -> Self {
        Self {
            profile,
            enabled: true,
        }
    }

    /// Configuration the bot actually runs with
    pub fn effective(&self) -> BotConfig {
        if self.enabled {
            self.profile.clone()
        } else {
            BotConfig {
                mode: self.profile.mode,
                ..BotConfig::default()
            }
        }
    }

    /// Merge a partial JSON object into the saved profile.
    ///
    /// Unknown keys and values that fail validation are rejected and leave the
    /// profile untouched.
    pub fn apply_partial(&mut self, partial: &Value) -> Result<(), String> {
        let mut merged = serde_json::to_value(&self.profile).map_err(|e| e.to_string())?;
        check_known_keys(&merged, partial, "")?;
        merge_json(&mut merged, partial);
        let updated: BotConfig = serde_json::from_value(merged).map_err(|e| e.to_string())?;
        updated.validate()?;
        self.profile = updated;
        Ok(())
    }
}

fn check_known_keys(base: &Value, patch: &Value, path: &str) -> Result<(), String> {
    let Value::Object(patch_map) = patch else {
        return Err(format!("expected an object at '{}'", path));
    };
    let Value::Object(base_map) = base else {
        return Ok(());
    };
    for (key, value) in patch_map {
        let key_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        match base_map.get(key) {
            None => return Err(format!("unknown config key '{}'", key_path)),
            Some(base_value @ Value::Object(_)) => {
                check_known_keys(base_value, value, &key_path)?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Recursive object merge; non-object values replace.
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
