//! Agent configuration parsed from the `-agentpath` options string.
//!
//! Options are `key=value` pairs separated by commas:
//!
//! ```text
//! -agentpath:libprobe_agent.so=log_level=debug,app_name=Orders,circuit_breaker.memory_threshold=15,include=com/acme/;org/acme/
//! ```
//!
//! Dotted keys address nested sections. `include` and `exclude` take
//! `;`-separated internal-name prefixes. Unknown keys are rejected.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("option `{0}` has no value")]
    MissingValue(String),
    #[error("option `{0}` given more than once")]
    DuplicateKey(String),
    #[error("option `{key}` must be between {min} and {max}, got {value}")]
    OutOfRange { key: &'static str, value: u64, min: u64, max: u64 },
    #[error("invalid options: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Thresholds for the GC circuit breaker. Changeable at runtime through
/// [`crate::circuit_breaker::CircuitBreakerService::config_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Trip only when free heap is at or below this percentage.
    pub memory_threshold: u32,
    /// Trip only when old-generation GC time is at or above this percentage.
    pub gc_cpu_threshold: u32,
    /// Probe creations per thread between two breaker checks.
    pub sampling_rate: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { enabled: true, memory_threshold: 20, gc_cpu_threshold: 10, sampling_rate: 1000 }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("circuit_breaker.memory_threshold", self.memory_threshold.into(), 1, 100)?;
        check_range("circuit_breaker.gc_cpu_threshold", self.gc_cpu_threshold.into(), 1, 100)?;
        check_range("circuit_breaker.sampling_rate", self.sampling_rate, 1, u64::MAX)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// `tracing` filter directive, e.g. `info` or `jvmti_probes=debug`.
    pub log_level: String,
    pub app_name: String,
    pub circuit_breaker: CircuitBreakerConfig,
    pub harvest_period_secs: u64,
    /// Class-name prefixes always inspected, even from the bootstrap loader.
    pub include: Vec<String>,
    /// Class-name prefixes never inspected.
    pub exclude: Vec<String>,
    /// Retransform loaded classes when rules change.
    pub retransform: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_name: "My Application".to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
            harvest_period_secs: 60,
            include: Vec::new(),
            exclude: Vec::new(),
            retransform: true,
        }
    }
}

const STRING_KEYS: &[&str] = &["log_level", "app_name"];
const LIST_KEYS: &[&str] = &["include", "exclude"];

impl AgentConfig {
    /// Parses an options string. An empty string yields the defaults.
    pub fn from_options(options: &str) -> Result<Self, ConfigError> {
        let mut root = Map::new();
        for pair in options.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, raw) = match pair.split_once('=') {
                Some((key, raw)) => (key.trim(), raw.trim()),
                None => return Err(ConfigError::MissingValue(pair.to_string())),
            };
            let value = if STRING_KEYS.contains(&key) {
                Value::String(raw.to_string())
            } else if LIST_KEYS.contains(&key) {
                Value::Array(
                    raw.split(';')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                )
            } else {
                scalar(raw)
            };
            insert_dotted(&mut root, key, value)?;
        }

        let config: AgentConfig = serde_json::from_value(Value::Object(root))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        check_range("harvest_period_secs", self.harvest_period_secs, 1, 3600)?;
        Ok(())
    }

    pub fn harvest_period(&self) -> Duration {
        Duration::from_secs(self.harvest_period_secs)
    }
}

fn check_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { key, value, min, max })
    }
}

fn scalar(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match raw.parse::<u64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(raw.to_string()),
        },
    }
}

fn insert_dotted(root: &mut Map<String, Value>, key: &str, value: Value) -> Result<(), ConfigError> {
    let mut parts = key.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            if current.contains_key(part) {
                return Err(ConfigError::DuplicateKey(key.to_string()));
            }
            current.insert(part.to_string(), value);
            return Ok(());
        }
        let entry = current.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => return Err(ConfigError::DuplicateKey(key.to_string())),
        };
    }
    Ok(())
}
