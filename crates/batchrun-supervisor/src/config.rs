//! Supervisor configuration.
//!
//! Every knob has a default; a TOML file can override any subset of them.
//! Durations are written in milliseconds (`*_ms` keys):
//!
//! ```toml
//! max_concurrency = 4
//! heartbeat_timeout_ms = 120000
//!
//! [throttle]
//! cpu_ceiling_percent = 85.0
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Maximum concurrent workers. Defaults to the detected CPU count.
    pub max_concurrency: Option<usize>,

    /// Hard ceiling applied on top of `max_concurrency`.
    pub concurrency_ceiling: usize,

    /// A worker with no output for this long is timed out.
    #[serde(rename = "heartbeat_timeout_ms", with = "duration_ms")]
    pub heartbeat_timeout: Duration,

    /// Time between the cooperative stop signal and the forced kill.
    #[serde(rename = "cancel_grace_ms", with = "duration_ms")]
    pub cancel_grace: Duration,

    /// Upper bound on how long the scheduling loop sleeps between iterations.
    #[serde(rename = "tick_ms", with = "duration_ms")]
    pub tick: Duration,

    /// Number of diagnostic lines kept per attempt.
    pub diagnostic_tail_lines: usize,

    /// Resource throttling thresholds.
    pub throttle: ThrottleConfig,

    /// Retry policy.
    pub retry: RetryConfig,

    /// Extra failure classification rules.
    pub classifier: ClassifierConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            concurrency_ceiling: 16,
            heartbeat_timeout: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(5),
            tick: Duration::from_millis(100),
            diagnostic_tail_lines: 50,
            throttle: ThrottleConfig::default(),
            retry: RetryConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Number of workers that may run at once.
    pub fn effective_concurrency(&self) -> usize {
        let requested = self.max_concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        requested.min(self.concurrency_ceiling).max(1)
    }

    /// Reject configurations the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::Invalid("max_concurrency must be >= 1".into()));
        }
        if self.concurrency_ceiling == 0 {
            return Err(ConfigError::Invalid("concurrency_ceiling must be >= 1".into()));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::Invalid("tick_ms must be > 0".into()));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_timeout_ms must be > 0".into()));
        }
        self.throttle.validate()?;
        self.retry.validate()?;
        self.classifier.validate()?;
        Ok(())
    }
}

/// Resource ceilings above which admission of new workers pauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub cpu_ceiling_percent: f32,
    pub mem_ceiling_percent: f32,

    /// How often the system monitor refreshes its sample.
    #[serde(rename = "sample_interval_ms", with = "duration_ms")]
    pub sample_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cpu_ceiling_percent: 90.0,
            mem_ceiling_percent: 90.0,
            sample_interval: Duration::from_secs(2),
        }
    }
}

impl ThrottleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("cpu_ceiling_percent", self.cpu_ceiling_percent),
            ("mem_ceiling_percent", self.mem_ceiling_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in (0, 100], got {value}"
                )));
            }
        }
        if self.sample_interval.is_zero() {
            return Err(ConfigError::Invalid("sample_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Retry limits and backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts allowed per task, including the first.
    pub max_attempts: u32,

    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,

    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must be >= retry.base_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Additional regex rules for the failure classifier.
///
/// Each list is merged with the built-in rules of the same category.
/// Categories are checked in the order permanent, resource, transient, so a
/// permanent pattern overrides any built-in rule, while a configured
/// transient pattern loses to a built-in resource match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub transient_patterns: Vec<String>,
    pub resource_patterns: Vec<String>,
    pub permanent_patterns: Vec<String>,
}

impl ClassifierConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let groups = [
            ("transient_patterns", &self.transient_patterns),
            ("resource_patterns", &self.resource_patterns),
            ("permanent_patterns", &self.permanent_patterns),
        ];
        for (name, patterns) in groups {
            for pattern in patterns {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!("classifier.{name}: {e}"))
                })?;
            }
        }
        Ok(())
    }
}

/// Serde helper for durations stored as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SupervisorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.effective_concurrency() >= 1);
        assert!(config.effective_concurrency() <= config.concurrency_ceiling);
    }

    #[test]
    fn test_partial_toml_override() {
        let config = SupervisorConfig::from_toml_str(
            r#"
            max_concurrency = 4
            cancel_grace_ms = 250

            [retry]
            max_attempts = 5

            [classifier]
            transient_patterns = ["upstream hiccup"]
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.cancel_grace, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.classifier.transient_patterns, vec!["upstream hiccup"]);
        assert_eq!(config.effective_concurrency(), 4);
    }

    #[test]
    fn test_ceiling_caps_concurrency() {
        let config = SupervisorConfig {
            max_concurrency: Some(64),
            concurrency_ceiling: 8,
            ..SupervisorConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 8);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SupervisorConfig::from_toml_str("max_concurrency = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SupervisorConfig::from_toml_str("[throttle]\ncpu_ceiling_percent = 120.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SupervisorConfig::from_toml_str("[retry]\nmax_attempts = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SupervisorConfig::from_toml_str("max_concurrency = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_classifier_pattern_rejected() {
        let config = SupervisorConfig {
            classifier: ClassifierConfig {
                transient_patterns: vec!["(unclosed".to_string()],
                ..ClassifierConfig::default()
            },
            ..SupervisorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(&err, ConfigError::Invalid(msg) if msg.contains("transient_patterns")));

        assert!(matches!(
            SupervisorConfig::from_toml_str("[classifier]\npermanent_patterns = [\"[a-\"]"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
