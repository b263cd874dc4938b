//! Configuration management with validation and defaults
//!
//! Values are loaded from an optional TOML file, then overridden by `LOTTERY_*`
//! environment variables, then validated. Loading failures are fatal at startup.

use crate::errors::{ConfigurationError, LotteryResult};
use crate::escrow::types::Token;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Complete configuration for the lottery core
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LotteryConfig {
    pub game: GameSettings,
    pub payment: PaymentSettings,
    pub notification: NotificationSettings,
    pub storage: StorageConfig,
    pub randomness: RandomnessConfig,
    pub monitoring: MonitoringConfig,
}

/// Game engine settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    pub default_max_players: u32,
    pub max_players_limit: u32,
    pub min_players: u32,
    pub join_deadline_minutes: u64,
    /// Delay before start once the roster is full
    pub auto_start_delay_secs: u64,
    pub selection_multiplier: f64,
    pub min_selection_multiplier: f64,
    pub max_selection_multiplier: f64,
    pub survivor_override: Option<u32>,
    /// Pacing between elimination rounds
    pub round_delay_ms: u64,
    pub prize_min: u64,
    pub prize_max: u64,
    /// How long a finished game stays queryable before eviction
    pub retention_minutes: u64,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            default_max_players: 50,
            max_players_limit: 100,
            min_players: 2,
            join_deadline_minutes: 5,
            auto_start_delay_secs: 10,
            selection_multiplier: 2.0,
            min_selection_multiplier: 1.0,
            max_selection_multiplier: 5.0,
            survivor_override: None,
            round_delay_ms: 5_000,
            prize_min: 1_000,
            prize_max: 10_000,
            retention_minutes: 30,
        }
    }
}

/// Payment / escrow settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentSettings {
    pub enabled: bool,
    pub escrow_address: String,
    pub treasury_address: String,
    pub token: Token,
    /// Treasury cut in whole percent (10 = 10%)
    pub treasury_fee_percent: u8,
    pub payment_timeout_minutes: u64,
    pub confirmation_threshold: u32,
    pub confirmation_timeout_secs: u64,
    pub confirmation_poll_ms: u64,
    /// Accepted difference between expected and observed amount, in base units
    pub amount_tolerance: u64,
    pub auto_approve_refunds: bool,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            escrow_address: String::new(),
            treasury_address: String::new(),
            token: Token::sol(),
            treasury_fee_percent: 10,
            payment_timeout_minutes: 10,
            confirmation_threshold: 32,
            confirmation_timeout_secs: 120,
            confirmation_poll_ms: 2_000,
            amount_tolerance: 1_000,
            auto_approve_refunds: false,
        }
    }
}

/// Outbound notification settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Minimum spacing between sends to one chat, and the value backoff resets to
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub max_send_attempts: u32,
    pub join_batch_size: usize,
    pub join_buffer_window_ms: u64,
    /// Seconds-before-start marks that get a countdown message
    pub countdown_marks_secs: Vec<u64>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            backoff_floor_ms: 1_000,
            backoff_ceiling_ms: 60_000,
            max_send_attempts: 5,
            join_batch_size: 5,
            join_buffer_window_ms: 3_000,
            countdown_marks_secs: vec![240, 120, 60, 30],
        }
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub snapshot_interval_secs: u64,
    /// Keep everything in memory (testing only!)
    pub in_memory: bool,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/lottery_data".to_string(),
            snapshot_interval_secs: 30,
            in_memory: false,
            clear_on_start: false,
        }
    }
}

/// Randomness provider configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomnessConfig {
    /// Hex-encoded 32-byte VRF mini secret key
    pub secret_key_hex: Option<String>,
    /// Refuse to start with an ephemeral key
    pub require_secret: bool,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: LogLevel,
    pub log_filter: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_filter: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl LotteryConfig {
    /// Fast timings and in-memory storage for tests and simulations
    pub fn testing() -> Self {
        Self {
            game: GameSettings {
                join_deadline_minutes: 1,
                auto_start_delay_secs: 1,
                round_delay_ms: 10,
                retention_minutes: 1,
                ..Default::default()
            },
            payment: PaymentSettings {
                enabled: true,
                escrow_address: "EscrowTestAddress1111111111111111111111111".to_string(),
                treasury_address: "TreasuryTestAddress111111111111111111111111".to_string(),
                confirmation_threshold: 3,
                confirmation_timeout_secs: 30,
                confirmation_poll_ms: 100,
                amount_tolerance: 0,
                ..Default::default()
            },
            notification: NotificationSettings {
                backoff_floor_ms: 10,
                backoff_ceiling_ms: 1_000,
                join_buffer_window_ms: 100,
                countdown_marks_secs: vec![30],
                ..Default::default()
            },
            storage: StorageConfig {
                in_memory: true,
                clear_on_start: true,
                snapshot_interval_secs: 1,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_level: LogLevel::Debug,
                log_filter: None,
            },
            ..Default::default()
        }
    }

    /// Production deployment: persistent storage and a mandatory VRF key
    pub fn production() -> Self {
        Self {
            payment: PaymentSettings {
                enabled: true,
                ..Default::default()
            },
            randomness: RandomnessConfig {
                secret_key_hex: None,
                require_secret: true,
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let game = &self.game;
        if game.min_players < 2 {
            return Err(ConfigValidationError::InvalidValue(
                "game.min_players must be >= 2".to_string(),
            ));
        }
        if game.default_max_players < game.min_players || game.default_max_players > game.max_players_limit {
            return Err(ConfigValidationError::InvalidValue(format!(
                "game.default_max_players must be within [{}, {}]",
                game.min_players, game.max_players_limit
            )));
        }
        if game.min_selection_multiplier < 1.0 || game.min_selection_multiplier > game.max_selection_multiplier {
            return Err(ConfigValidationError::LogicalInconsistency(
                "selection multiplier bounds must satisfy 1.0 <= min <= max".to_string(),
            ));
        }
        if game.selection_multiplier < game.min_selection_multiplier
            || game.selection_multiplier > game.max_selection_multiplier
        {
            return Err(ConfigValidationError::InvalidValue(
                "game.selection_multiplier is outside its bounds".to_string(),
            ));
        }
        if game.prize_min > game.prize_max {
            return Err(ConfigValidationError::LogicalInconsistency(
                "game.prize_min must not exceed game.prize_max".to_string(),
            ));
        }
        if let Some(survivors) = game.survivor_override {
            if survivors == 0 || survivors >= game.default_max_players {
                return Err(ConfigValidationError::InvalidValue(
                    "game.survivor_override must be in [1, default_max_players)".to_string(),
                ));
            }
        }

        let payment = &self.payment;
        if payment.treasury_fee_percent > 100 {
            return Err(ConfigValidationError::InvalidValue(
                "payment.treasury_fee_percent must be <= 100".to_string(),
            ));
        }
        if payment.enabled {
            if payment.escrow_address.is_empty() {
                return Err(ConfigValidationError::MissingRequired("payment.escrow_address".to_string()));
            }
            if payment.treasury_address.is_empty() {
                return Err(ConfigValidationError::MissingRequired("payment.treasury_address".to_string()));
            }
            if payment.confirmation_threshold == 0 || payment.confirmation_poll_ms == 0 {
                return Err(ConfigValidationError::InvalidValue(
                    "payment confirmation threshold and poll interval must be > 0".to_string(),
                ));
            }
        }

        let notification = &self.notification;
        if notification.backoff_floor_ms == 0 || notification.backoff_floor_ms > notification.backoff_ceiling_ms {
            return Err(ConfigValidationError::LogicalInconsistency(
                "notification backoff must satisfy 0 < floor <= ceiling".to_string(),
            ));
        }
        if notification.join_batch_size == 0 || notification.max_send_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "notification batch size and send attempts must be > 0".to_string(),
            ));
        }

        if self.randomness.require_secret && self.randomness.secret_key_hex.is_none() {
            return Err(ConfigValidationError::MissingRequired("randomness.secret_key_hex".to_string()));
        }

        Ok(())
    }

    pub fn join_deadline(&self) -> Duration {
        Duration::from_secs(self.game.join_deadline_minutes * 60)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment.payment_timeout_minutes * 60)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.storage.snapshot_interval_secs)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    InvalidValue(String),
    LogicalInconsistency(String),
    MissingRequired(String),
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValidationError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigValidationError::LogicalInconsistency(msg) => {
                write!(f, "Configuration logical inconsistency: {}", msg)
            }
            ConfigValidationError::MissingRequired(msg) => write!(f, "Missing required configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

impl From<ConfigValidationError> for ConfigurationError {
    fn from(e: ConfigValidationError) -> Self {
        match e {
            ConfigValidationError::MissingRequired(field) => ConfigurationError::MissingRequired(field),
            other => ConfigurationError::ValidationFailed(other.to_string()),
        }
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
    pub fn load(&self) -> LotteryResult<LotteryConfig> {
        let mut config = match self.config_path {
            Some(ref path) => Self::load_from_file(path)?,
            None => LotteryConfig::default(),
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate().map_err(ConfigurationError::from)?;

        Ok(config)
    }

    fn load_from_file(path: &str) -> LotteryResult<LotteryConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(config: &mut LotteryConfig) -> LotteryResult<()> {
        if let Ok(dir) = env::var("LOTTERY_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Ok(secret) = env::var("LOTTERY_VRF_SECRET") {
            config.randomness.secret_key_hex = Some(secret);
        }
        if let Ok(address) = env::var("LOTTERY_ESCROW_ADDRESS") {
            config.payment.escrow_address = address;
        }
        if let Ok(address) = env::var("LOTTERY_TREASURY_ADDRESS") {
            config.payment.treasury_address = address;
        }
        if let Ok(fee) = env::var("LOTTERY_TREASURY_FEE_PERCENT") {
            config.payment.treasury_fee_percent = parse_env("LOTTERY_TREASURY_FEE_PERCENT", fee)?;
        }
        if let Ok(minutes) = env::var("LOTTERY_JOIN_DEADLINE_MINUTES") {
            config.game.join_deadline_minutes = parse_env("LOTTERY_JOIN_DEADLINE_MINUTES", minutes)?;
        }
        if let Ok(minutes) = env::var("LOTTERY_PAYMENT_TIMEOUT_MINUTES") {
            config.payment.payment_timeout_minutes = parse_env("LOTTERY_PAYMENT_TIMEOUT_MINUTES", minutes)?;
        }
        if let Ok(depth) = env::var("LOTTERY_CONFIRMATION_THRESHOLD") {
            config.payment.confirmation_threshold = parse_env("LOTTERY_CONFIRMATION_THRESHOLD", depth)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: String) -> LotteryResult<T> {
    value.parse().map_err(|_| {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            value,
            reason: "not a valid number".to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LotteryConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config_is_valid() {
        let config = LotteryConfig::testing();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_requires_secret() {
        let config = LotteryConfig::production();
        match config.validate() {
            Err(ConfigValidationError::MissingRequired(field)) => {
                assert_eq!(field, "randomness.secret_key_hex");
            }
            other => panic!("Expected missing secret, got {:?}", other),
        }
    }

    #[test]
    fn test_payments_require_addresses() {
        let mut config = LotteryConfig::default();
        config.payment.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backoff_bounds() {
        let mut config = LotteryConfig::default();
        config.notification.backoff_floor_ms = 5_000;
        config.notification.backoff_ceiling_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_override() {
        let config: LotteryConfig = toml::from_str(
            r#"
            [game]
            default_max_players = 20
            survivor_override = 3

            [payment]
            treasury_fee_percent = 5
            "#,
        )
        .expect("TOML should parse");

        assert_eq!(config.game.default_max_players, 20);
        assert_eq!(config.game.survivor_override, Some(3));
        assert_eq!(config.game.min_players, 2);
        assert_eq!(config.payment.treasury_fee_percent, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_conversions() {
        let config = LotteryConfig::default();
        assert_eq!(config.join_deadline(), Duration::from_secs(300));
        assert_eq!(config.payment_timeout(), Duration::from_secs(600));
    }
}
