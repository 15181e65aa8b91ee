//! Environment-backed configuration for `chat-smoke`.

use std::{env, error::Error, fmt};

use chat_core::{EngineConfig, RateCategory, types::validate_poll_rate};

const DEFAULT_PASS: &str = "smoke-pass";
const DEFAULT_USER: &str = "smoke";
const DEFAULT_CHANNEL: &str = "0000";
const DEFAULT_CYCLES: u32 = 3;

/// Runtime configuration for one smoke run.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Pass exchanged for the chat token.
    pub pass: String,
    /// Account user that sends the smoke messages.
    pub user: String,
    /// Channel the user joins and posts into.
    pub channel: String,
    /// Poll cycles to observe before shutting down.
    pub cycles: u32,
    /// Engine tuning (poll rate and rate-limit intervals).
    pub engine: EngineConfig,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let pass = optional_trimmed_env("MUDCHAT_PASSWORD", &mut lookup)
            .unwrap_or_else(|| DEFAULT_PASS.to_owned());
        let user = optional_trimmed_env("MUDCHAT_USER", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER.to_owned());
        let channel = optional_trimmed_env("MUDCHAT_CHANNEL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_owned());

        let cycles = parse_optional::<u32, _>("MUDCHAT_SMOKE_CYCLES", &mut lookup)?
            .unwrap_or(DEFAULT_CYCLES);
        if cycles == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MUDCHAT_SMOKE_CYCLES".to_owned(),
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let mut engine = EngineConfig::default();
        if let Some(poll_rate_ms) = parse_optional::<u64, _>("MUDCHAT_POLL_RATE_MS", &mut lookup)? {
            validate_poll_rate(poll_rate_ms).map_err(|err| ConfigError::InvalidValue {
                key: "MUDCHAT_POLL_RATE_MS".to_owned(),
                value: poll_rate_ms.to_string(),
                reason: err.message,
            })?;
            engine.poll_rate_ms = poll_rate_ms;
        }
        if let Some(interval_ms) = parse_optional::<u64, _>("MUDCHAT_RATE_DEFAULT_MS", &mut lookup)?
        {
            engine.default_rate_interval_ms = interval_ms;
        }
        for category in RateCategory::ALL {
            let key = format!("MUDCHAT_RATE_{}_MS", category.config_key());
            if let Some(interval_ms) = parse_optional::<u64, _>(&key, &mut lookup)? {
                engine.rate_intervals_ms.insert(category, interval_ms);
            }
        }

        Ok(Self {
            pass,
            user,
            channel,
            cycles,
            engine,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key: key.to_owned(),
            value,
            reason: err.to_string(),
        })
}
