use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::Generation;
use crate::ratelimit::ConfigError;

/// Default number of concurrent requests across all devices
const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Default number of successful half-open trials needed to close a circuit
const DEFAULT_CIRCUIT_SUCCESS_THRESHOLD: u32 = 2;

/// Default time a circuit stays open before trial requests are let through
const DEFAULT_CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(30);

/// Limits applied to every device of one [`Generation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    /// Maximum concurrent requests to a single device of this generation
    pub max_concurrent: usize,

    /// Minimum interval between two requests to the same device
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,

    /// Consecutive connectivity failures that open a device's circuit
    pub circuit_threshold: u32,
}

impl GenerationConfig {
    /// Defaults for first generation devices, which handle one request at a
    /// time and need breathing room between requests
    #[must_use]
    pub const fn gen1() -> Self {
        Self {
            max_concurrent: 1,
            min_interval: Duration::from_millis(200),
            circuit_threshold: 3,
        }
    }

    /// Defaults for second generation devices
    #[must_use]
    pub const fn gen2() -> Self {
        Self {
            max_concurrent: 4,
            min_interval: Duration::from_millis(50),
            circuit_threshold: 5,
        }
    }

    fn validate(&self, generation: Generation) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(format!(
                "{generation}.max_concurrent must be at least 1"
            )));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "{generation}.max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.circuit_threshold == 0 {
            return Err(ConfigError::Invalid(format!(
                "{generation}.circuit_threshold must be at least 1"
            )));
        }
        Ok(())
    }
}

/// A `[gen1]`/`[gen2]` table as written in a configuration file, where
/// omitted fields keep the generation's defaults
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerationOverrides {
    max_concurrent: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    min_interval: Option<Duration>,
    circuit_threshold: Option<u32>,
}

impl GenerationOverrides {
    fn apply_to(self, defaults: GenerationConfig) -> GenerationConfig {
        GenerationConfig {
            max_concurrent: self.max_concurrent.unwrap_or(defaults.max_concurrent),
            min_interval: self.min_interval.unwrap_or(defaults.min_interval),
            circuit_threshold: self.circuit_threshold.unwrap_or(defaults.circuit_threshold),
        }
    }
}

fn gen1_limits<'de, D>(deserializer: D) -> Result<GenerationConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = GenerationOverrides::deserialize(deserializer)?;
    Ok(overrides.apply_to(GenerationConfig::gen1()))
}

fn gen2_limits<'de, D>(deserializer: D) -> Result<GenerationConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = GenerationOverrides::deserialize(deserializer)?;
    Ok(overrides.apply_to(GenerationConfig::gen2()))
}

/// Configuration of a [`crate::ratelimit::RateLimiter`].
///
/// Every field has a default, so a configuration file only needs to list
/// the values it changes. This includes the fields of the `[gen1]` and
/// `[gen2]` tables, which fall back to that generation's defaults.
/// Durations use humantime notation (`"250ms"`, `"30s"`).
///
/// ```
/// use fleetgate_lib::ratelimit::Config;
/// use std::time::Duration;
///
/// let config = Config::from_toml_str(
///     r#"
///     max_concurrent = 4
///
///     [gen1]
///     max_concurrent = 1
///     min_interval = "500ms"
///     circuit_threshold = 2
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(config.max_concurrent, 4);
/// assert_eq!(config.gen1.min_interval, Duration::from_millis(500));
/// assert_eq!(config.gen2, Config::default().gen2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Maximum concurrent requests across all devices
    pub max_concurrent: usize,

    /// Consecutive successful half-open trials that close a circuit
    pub circuit_success_threshold: u32,

    /// How long a circuit stays open before trial requests are admitted
    #[serde(with = "humantime_serde")]
    pub circuit_open_duration: Duration,

    /// Upper bound on admissions per half-open period.
    ///
    /// `None` lets every request through while half-open.
    pub half_open_max_trials: Option<u32>,

    /// Limits for first generation devices
    #[serde(deserialize_with = "gen1_limits")]
    pub gen1: GenerationConfig,

    /// Limits for second generation devices
    #[serde(deserialize_with = "gen2_limits")]
    pub gen2: GenerationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            circuit_success_threshold: DEFAULT_CIRCUIT_SUCCESS_THRESHOLD,
            circuit_open_duration: DEFAULT_CIRCUIT_OPEN_DURATION,
            half_open_max_trials: None,
            gen1: GenerationConfig::gen1(),
            gen2: GenerationConfig::gen2(),
        }
    }
}

impl Config {
    /// Parse a configuration from TOML
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid TOML, contains unknown keys,
    /// or describes an unusable limiter (see [`Config::validate`])
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its contents are
    /// rejected by [`Config::from_toml_str`]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check that the configuration describes a limiter that can admit
    /// requests.
    ///
    /// Zero concurrency would block every caller forever and a zero threshold
    /// would open or close circuits without any evidence, so both are rejected.
    /// Concurrency limits must also fit into a [`Semaphore`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.circuit_success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_success_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_trials == Some(0) {
            return Err(ConfigError::Invalid(
                "half_open_max_trials must be at least 1 when set".to_string(),
            ));
        }
        self.gen1.validate(Generation::Gen1)?;
        self.gen2.validate(Generation::Gen2)
    }

    /// The limits that apply to devices of the given generation
    #[must_use]
    pub const fn for_generation(&self, generation: Generation) -> &GenerationConfig {
        match generation {
            Generation::Gen1 => &self.gen1,
            Generation::Gen2 => &self.gen2,
        }
    }

    /// Set the global concurrency limit
    #[must_use]
    pub const fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the number of half-open successes that close a circuit
    #[must_use]
    pub const fn with_circuit_success_threshold(mut self, threshold: u32) -> Self {
        self.circuit_success_threshold = threshold;
        self
    }

    /// Set how long an open circuit rejects requests
    #[must_use]
    pub const fn with_circuit_open_duration(mut self, duration: Duration) -> Self {
        self.circuit_open_duration = duration;
        self
    }

    /// Limit how many requests are admitted per half-open period
    #[must_use]
    pub const fn with_half_open_max_trials(mut self, trials: Option<u32>) -> Self {
        self.half_open_max_trials = trials;
        self
    }

    /// Replace the limits for one generation
    #[must_use]
    pub const fn with_generation(
        mut self,
        generation: Generation,
        limits: GenerationConfig,
    ) -> Self {
        match generation {
            Generation::Gen1 => self.gen1 = limits,
            Generation::Gen2 => self.gen2 = limits,
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.circuit_success_threshold, 2);
        assert_eq!(config.circuit_open_duration, Duration::from_secs(30));
        assert_eq!(config.half_open_max_trials, None);
        assert_eq!(config.gen1.max_concurrent, 1);
        assert_eq!(config.gen2.max_concurrent, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_generation() {
        let config = Config::default().with_generation(
            Generation::Gen2,
            GenerationConfig {
                max_concurrent: 2,
                min_interval: Duration::ZERO,
                circuit_threshold: 9,
            },
        );
        assert_eq!(config.for_generation(Generation::Gen1), &GenerationConfig::gen1());
        assert_eq!(config.for_generation(Generation::Gen2).circuit_threshold, 9);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default()
            .with_max_concurrent(3)
            .with_circuit_open_duration(Duration::from_millis(1500))
            .with_half_open_max_trials(Some(1));

        let toml = toml::to_string(&config).unwrap();
        let deserialized = Config::from_toml_str(&toml).unwrap();

        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::from_toml_str(r#"circuit_open_duration = "2m""#).unwrap();
        assert_eq!(config.circuit_open_duration, Duration::from_secs(120));
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.gen1, GenerationConfig::gen1());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = Config::from_toml_str("max_concurent = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let err = Config::from_toml_str("[gen2]\nmax_concurrent = 0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: gen2.max_concurrent must be at least 1"
        );
    }

    #[test]
    fn test_partial_generation_table_uses_its_defaults() {
        let config = Config::from_toml_str(
            r#"
            [gen1]
            min_interval = "1s"

            [gen2]
            circuit_threshold = 7
            "#,
        )
        .unwrap();
        assert_eq!(
            config.gen1,
            GenerationConfig {
                min_interval: Duration::from_secs(1),
                ..GenerationConfig::gen1()
            }
        );
        assert_eq!(
            config.gen2,
            GenerationConfig {
                circuit_threshold: 7,
                ..GenerationConfig::gen2()
            }
        );
    }

    #[test]
    fn test_unknown_generation_key_is_rejected() {
        let err = Config::from_toml_str("[gen1]\nmax_concurent = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_concurrency_beyond_semaphore_capacity_is_rejected() {
        let too_many = Semaphore::MAX_PERMITS + 1;

        let err = Config::from_toml_str(&format!("max_concurrent = {too_many}")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = Config::default().with_generation(
            Generation::Gen2,
            GenerationConfig {
                max_concurrent: too_many,
                ..GenerationConfig::gen2()
            },
        );
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "Invalid configuration: gen2.max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )
        );

        let config = Config::default().with_max_concurrent(Semaphore::MAX_PERMITS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_half_open_trials_is_rejected() {
        let config = Config::default().with_half_open_max_trials(Some(0));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent = 2\ncircuit_success_threshold = 1").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.circuit_success_threshold, 1);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/fleetgate.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/fleetgate.toml"));
    }
}
