//! Configuration module for calsync.
//!
//! Typed runtime settings that map to the YAML configuration file, with
//! loading, validation, defaults, and a builder for programmatic use.
//! Sources, the destination and agents are not part of this file; they live
//! in the state store as the sync configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::FrequencyIntervals;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub relay: RelayConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Controller pass settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on one source pass, in seconds.
    pub pass_timeout_secs: u64,
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// Interval used for `real_time` sources, in seconds.
    pub real_time_interval_secs: u64,
    /// Interval used for `hourly` sources, in seconds.
    pub hourly_interval_secs: u64,
    /// Interval used for `daily` sources, in seconds.
    pub daily_interval_secs: u64,
}

/// In-pass retry of transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per provider call (1 disables retrying).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay_ms: u64,
    /// Cap on any single delay, including provider `retry_after` hints.
    pub max_delay_ms: u64,
}

/// Remote agent channel limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Unconsumed batches kept per source before pushes are refused.
    pub max_pending_batches: usize,
    /// Events accepted in a single push.
    pub max_batch_events: usize,
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database: PathBuf,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/calsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("calsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pass_timeout_secs: 300,
        }
    }
}

impl SyncConfig {
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            real_time_interval_secs: 300,
            hourly_interval_secs: 3_600,
            daily_interval_secs: 86_400,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn real_time_interval(&self) -> Duration {
        Duration::from_secs(self.real_time_interval_secs)
    }

    /// Scheduled interval of every sync frequency
    pub fn frequency_intervals(&self) -> FrequencyIntervals {
        FrequencyIntervals {
            real_time: self.real_time_interval(),
            hourly: Duration::from_secs(self.hourly_interval_secs),
            daily: Duration::from_secs(self.daily_interval_secs),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Caps a provider-supplied delay.
    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.min(Duration::from_millis(self.max_delay_ms))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_pending_batches: 64,
            max_batch_events: 5_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("calsync")
                .join("calsync.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"retry.max_attempts"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        positive(&mut errors, "sync.pass_timeout_secs", self.sync.pass_timeout_secs);

        positive(
            &mut errors,
            "scheduler.tick_interval_secs",
            self.scheduler.tick_interval_secs,
        );
        for (field, seconds) in [
            ("scheduler.real_time_interval_secs", self.scheduler.real_time_interval_secs),
            ("scheduler.hourly_interval_secs", self.scheduler.hourly_interval_secs),
            ("scheduler.daily_interval_secs", self.scheduler.daily_interval_secs),
        ] {
            positive(&mut errors, field, seconds);
            if seconds > 0 && seconds < self.scheduler.tick_interval_secs {
                errors.push(ValidationError {
                    field: field.into(),
                    message: format!(
                        "must not be shorter than the tick interval ({}s)",
                        self.scheduler.tick_interval_secs
                    ),
                });
            }
        }

        positive(&mut errors, "retry.max_attempts", u64::from(self.retry.max_attempts));
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(ValidationError {
                field: "retry.base_delay_ms".into(),
                message: format!(
                    "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            });
        }

        positive(
            &mut errors,
            "relay.max_pending_batches",
            self.relay.max_pending_batches as u64,
        );
        positive(
            &mut errors,
            "relay.max_batch_events",
            self.relay.max_batch_events as u64,
        );

        if self.storage.database.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.database".into(),
                message: "must not be empty".into(),
            });
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust
/// use calsync_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .pass_timeout_secs(60)
///     .retry_max_attempts(5)
///     .logging_level("debug")
///     .build();
/// assert_eq!(config.retry.max_attempts, 5);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn pass_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.sync.pass_timeout_secs = seconds;
        self
    }

    // --- scheduler ---

    pub fn tick_interval_secs(mut self, seconds: u64) -> Self {
        self.config.scheduler.tick_interval_secs = seconds;
        self
    }

    pub fn real_time_interval_secs(mut self, seconds: u64) -> Self {
        self.config.scheduler.real_time_interval_secs = seconds;
        self
    }

    pub fn hourly_interval_secs(mut self, seconds: u64) -> Self {
        self.config.scheduler.hourly_interval_secs = seconds;
        self
    }

    pub fn daily_interval_secs(mut self, seconds: u64) -> Self {
        self.config.scheduler.daily_interval_secs = seconds;
        self
    }

    // --- retry ---

    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_delay_ms = ms;
        self
    }

    // --- relay ---

    pub fn relay_max_pending_batches(mut self, n: usize) -> Self {
        self.config.relay.max_pending_batches = n;
        self
    }

    pub fn relay_max_batch_events(mut self, n: usize) -> Self {
        self.config.relay.max_batch_events = n;
        self
    }

    // --- storage ---

    pub fn database(mut self, path: PathBuf) -> Self {
        self.config.storage.database = path;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.pass_timeout_secs, 300);
        assert_eq!(cfg.scheduler.tick_interval_secs, 30);
        assert_eq!(cfg.scheduler.real_time_interval_secs, 300);
        assert_eq!(cfg.scheduler.hourly_interval_secs, 3_600);
        assert_eq!(cfg.scheduler.daily_interval_secs, 86_400);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.relay.max_pending_batches, 64);
        assert!(cfg.storage.database.ends_with("calsync/calsync.db"));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
sync:
  pass_timeout_secs: 120
scheduler:
  tick_interval_secs: 10
  real_time_interval_secs: 60
  hourly_interval_secs: 1800
  daily_interval_secs: 43200
retry:
  max_attempts: 5
  base_delay_ms: 250
  max_delay_ms: 8000
relay:
  max_pending_batches: 8
  max_batch_events: 100
storage:
  database: /tmp/calsync-test.db
logging:
  level: debug
  json: true
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.pass_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.scheduler.tick_interval(), Duration::from_secs(10));
        assert_eq!(cfg.scheduler.real_time_interval(), Duration::from_secs(60));
        let intervals = cfg.scheduler.frequency_intervals();
        assert_eq!(intervals.hourly, Duration::from_secs(1800));
        assert_eq!(intervals.daily, Duration::from_secs(43_200));
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.relay.max_batch_events, 100);
        assert_eq!(cfg.storage.database, PathBuf::from("/tmp/calsync-test.db"));
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn load_partial_file_keeps_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"retry:\n  max_attempts: 7\n").unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.retry.max_attempts, 7);
        assert_eq!(cfg.retry.base_delay_ms, 1_000);
        assert_eq!(cfg.scheduler.tick_interval_secs, 30);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.sync.pass_timeout_secs, 300);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }

    // -- Validation --

    #[test]
    fn validate_catches_zero_values() {
        let cfg = ConfigBuilder::new()
            .pass_timeout_secs(0)
            .tick_interval_secs(0)
            .retry_max_attempts(0)
            .relay_max_pending_batches(0)
            .build();
        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"sync.pass_timeout_secs".to_string()));
        assert!(fields.contains(&"scheduler.tick_interval_secs".to_string()));
        assert!(fields.contains(&"retry.max_attempts".to_string()));
        assert!(fields.contains(&"relay.max_pending_batches".to_string()));
    }

    #[test]
    fn validate_catches_real_time_shorter_than_tick() {
        let errors = ConfigBuilder::new()
            .tick_interval_secs(60)
            .real_time_interval_secs(30)
            .build()
            .validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "scheduler.real_time_interval_secs"));
    }

    #[test]
    fn validate_catches_bad_hourly_and_daily_intervals() {
        let fields: Vec<String> = ConfigBuilder::new()
            .tick_interval_secs(60)
            .hourly_interval_secs(0)
            .daily_interval_secs(45)
            .build()
            .validate()
            .into_iter()
            .map(|e| e.field)
            .collect();
        assert!(fields.contains(&"scheduler.hourly_interval_secs".to_string()));
        assert!(fields.contains(&"scheduler.daily_interval_secs".to_string()));
        assert!(!fields.contains(&"scheduler.real_time_interval_secs".to_string()));
    }

    #[test]
    fn default_frequency_intervals_match_frequency_names() {
        assert_eq!(
            SchedulerConfig::default().frequency_intervals(),
            FrequencyIntervals::default()
        );
    }

    #[test]
    fn validate_catches_bad_log_level() {
        let result = ConfigBuilder::new().logging_level("verbose").build_validated();
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "logging.level");
    }

    // -- Retry delays --

    #[test]
    fn retry_delay_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(350));
        assert_eq!(retry.clamp(Duration::from_secs(10)), Duration::from_millis(350));
    }
}
