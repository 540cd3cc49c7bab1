//! Configuration management with validation and defaults
//!
//! Sections mirror the deployment surface of the round engine: game rules,
//! phase timing, settlement retry policy, storage, API and monitoring.
//! Files are TOML; `SPINWHEEL_*` environment variables override file values.

use crate::errors::{ConfigurationError, SpinwheelResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinwheelConfig {
    pub game: GameConfig,
    pub timing: TimingConfig,
    pub settlement: SettlementConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// One slot of the wheel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorConfig {
    pub number: u8,
    pub kind: String,
}

/// Betting rules
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub min_bet: u64,
    pub max_bet: u64,
    /// K: wagers allowed per (player, round)
    pub max_wagers_per_player: usize,
    pub payout_multipliers: BTreeMap<String, u32>,
    pub sectors: Vec<SectorConfig>,
    /// Balance given to accounts the in-process ledger has never seen
    pub starting_balance: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        let mut payout_multipliers = BTreeMap::new();
        payout_multipliers.insert("red".to_string(), 2);
        payout_multipliers.insert("black".to_string(), 2);
        payout_multipliers.insert("green".to_string(), 14);

        // 0 is green, odd numbers red, even numbers black
        let sectors = (0u8..15)
            .map(|number| SectorConfig {
                number,
                kind: match number {
                    0 => "green",
                    n if n % 2 == 1 => "red",
                    _ => "black",
                }
                .to_string(),
            })
            .collect();

        Self {
            min_bet: 1,
            max_bet: 1_000,
            max_wagers_per_player: 2,
            payout_multipliers,
            sectors,
            starting_balance: 1_000,
        }
    }
}

/// Phase durations and tick cadence
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub betting_secs: u64,
    pub drawing_secs: u64,
    pub cooldown_secs: u64,
    pub tick_ms: u64,
    /// Upper bound for the wager journal write made during admission
    pub store_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            betting_secs: 25,
            drawing_secs: 5,
            cooldown_secs: 5,
            tick_ms: 1_000,
            store_timeout_ms: 2_000,
        }
    }
}

/// Retry policy for ledger credits and settlement persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/spinwheel_data".to_string(),
            clear_on_start: false,
        }
    }
}

/// HTTP / WebSocket surface
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

/// Logging and history retention
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: String,
    pub log_color: bool,
    /// Number of past outcomes kept in the live snapshot
    pub history_len: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_color: true,
            history_len: 20,
        }
    }
}

impl SpinwheelConfig {
    /// Short phases and retries, clears the database: for local testing
    pub fn fast_testing() -> Self {
        Self {
            timing: TimingConfig {
                betting_secs: 3,
                drawing_secs: 1,
                cooldown_secs: 1,
                tick_ms: 100,
                store_timeout_ms: 500,
            },
            settlement: SettlementConfig {
                max_attempts: 3,
                backoff_base_ms: 1,
                backoff_max_ms: 10,
            },
            storage: StorageConfig {
                clear_on_start: true,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_level: "debug".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Production deployment with persistence and JSON logs
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                data_directory: "./DB/spinwheel_data".to_string(),
                clear_on_start: false, // Production: preserve round history
            },
            monitoring: MonitoringConfig {
                log_format: "json".to_string(),
                log_color: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.game.validate()?;
        self.timing.validate()?;

        if self.settlement.max_attempts == 0 {
            return Err(invalid("settlement.max_attempts", "0", "must be > 0"));
        }
        if self.settlement.backoff_base_ms > self.settlement.backoff_max_ms {
            return Err(ConfigurationError::ValidationFailed(
                "settlement.backoff_base_ms exceeds backoff_max_ms".to_string(),
            ));
        }
        if self.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired(
                "storage.data_directory".to_string(),
            ));
        }
        if self.api.port == 0 {
            return Err(invalid("api.port", "0", "Port cannot be zero"));
        }
        Ok(())
    }

    pub fn betting_duration(&self) -> Duration {
        Duration::from_secs(self.timing.betting_secs)
    }

    pub fn drawing_duration(&self) -> Duration {
        Duration::from_secs(self.timing.drawing_secs)
    }

    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_secs(self.timing.cooldown_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timing.tick_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.store_timeout_ms)
    }
}

impl GameConfig {
    pub fn multiplier(&self, kind: &str) -> Option<u32> {
        self.payout_multipliers.get(kind).copied()
    }

    /// Validates bet bounds and the sector table against the multipliers.
    ///
    /// A kind covering `c` of `n` sectors with multiplier `m` returns `c * m / n`
    /// per unit staked; that must not exceed 1.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.min_bet == 0 {
            return Err(invalid("game.min_bet", "0", "must be > 0"));
        }
        if self.min_bet > self.max_bet {
            return Err(invalid(
                "game.max_bet",
                &self.max_bet.to_string(),
                "must be >= min_bet",
            ));
        }
        if self.max_wagers_per_player == 0 {
            return Err(invalid("game.max_wagers_per_player", "0", "must be > 0"));
        }
        if self.sectors.is_empty() {
            return Err(ConfigurationError::MissingRequired("game.sectors".to_string()));
        }

        let mut seen = BTreeSet::new();
        let mut coverage: BTreeMap<&str, u64> = BTreeMap::new();
        for sector in &self.sectors {
            if !seen.insert(sector.number) {
                return Err(invalid(
                    "game.sectors",
                    &sector.number.to_string(),
                    "duplicate sector number",
                ));
            }
            if !self.payout_multipliers.contains_key(&sector.kind) {
                return Err(invalid(
                    "game.sectors",
                    &sector.kind,
                    "sector kind has no payout multiplier",
                ));
            }
            *coverage.entry(sector.kind.as_str()).or_default() += 1;
        }

        let total = self.sectors.len() as u64;
        for (kind, multiplier) in &self.payout_multipliers {
            if kind.is_empty() || kind.to_lowercase() != *kind {
                return Err(invalid(
                    "game.payout_multipliers",
                    kind,
                    "bet kinds must be non-empty lowercase names",
                ));
            }
            if *multiplier == 0 {
                return Err(invalid("game.payout_multipliers", kind, "multiplier must be > 0"));
            }
            let covered = coverage.get(kind.as_str()).copied().unwrap_or(0);
            if covered == 0 {
                return Err(invalid(
                    "game.payout_multipliers",
                    kind,
                    "bet kind is not on any sector",
                ));
            }
            if covered * u64::from(*multiplier) > total {
                return Err(ConfigurationError::ValidationFailed(format!(
                    "bet kind '{}' pays {}x on {}/{} sectors: expected value exceeds stake",
                    kind, multiplier, covered, total
                )));
            }
        }
        Ok(())
    }
}

impl TimingConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, value) in [
            ("timing.betting_secs", self.betting_secs),
            ("timing.drawing_secs", self.drawing_secs),
            ("timing.cooldown_secs", self.cooldown_secs),
            ("timing.tick_ms", self.tick_ms),
            ("timing.store_timeout_ms", self.store_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "0", "duration must be > 0"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> SpinwheelResult<SpinwheelConfig> {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => SpinwheelConfig::default(),
        };

        apply_env_overrides(&mut config, |key| env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> SpinwheelResult<SpinwheelConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into()
        })
    }

    /// Save configuration to file
    pub fn save(&self, config: &SpinwheelConfig, path: &str) -> SpinwheelResult<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, toml_string).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into()
        })
    }
}

/// Apply `SPINWHEEL_*` overrides; `lookup` abstracts the environment for tests
fn apply_env_overrides<F>(config: &mut SpinwheelConfig, lookup: F) -> SpinwheelResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T, ConfigurationError> {
        raw.parse().map_err(|_| ConfigurationError::InvalidValue {
            field: key.to_string(),
            value: raw,
            reason: "could not parse value".to_string(),
        })
    }

    if let Some(v) = lookup("SPINWHEEL_MIN_BET") {
        config.game.min_bet = parse("SPINWHEEL_MIN_BET", v)?;
    }
    if let Some(v) = lookup("SPINWHEEL_MAX_BET") {
        config.game.max_bet = parse("SPINWHEEL_MAX_BET", v)?;
    }
    if let Some(v) = lookup("SPINWHEEL_MAX_WAGERS_PER_PLAYER") {
        config.game.max_wagers_per_player = parse("SPINWHEEL_MAX_WAGERS_PER_PLAYER", v)?;
    }
    if let Some(v) = lookup("SPINWHEEL_BETTING_SECS") {
        config.timing.betting_secs = parse("SPINWHEEL_BETTING_SECS", v)?;
    }
    if let Some(v) = lookup("SPINWHEEL_DRAWING_SECS") {
        config.timing.drawing_secs = parse("SPINWHEEL_DRAWING_SECS", v)?;
    }
    if let Some(v) = lookup("SPINWHEEL_COOLDOWN_SECS") {
        config.timing.cooldown_secs = parse("SPINWHEEL_COOLDOWN_SECS", v)?;
    }
    if let Some(v) = lookup("SPINWHEEL_DATA_DIR") {
        config.storage.data_directory = v;
    }
    if let Some(v) = lookup("SPINWHEEL_API_HOST") {
        config.api.host = v;
    }
    if let Some(v) = lookup("SPINWHEEL_API_PORT") {
        config.api.port = parse("SPINWHEEL_API_PORT", v)?;
    }
    if let Some(v) = lookup("SPINWHEEL_LOG_LEVEL") {
        config.monitoring.log_level = v;
    }
    if let Some(v) = lookup("SPINWHEEL_LOG_FORMAT") {
        config.monitoring.log_format = v;
    }

    Ok(())
}
