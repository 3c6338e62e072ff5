//! Configuration value parsing and validation helpers

use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_workers must be a positive integer, got {0}")]
    InvalidWorkerCount(i64),

    #[error("pool.max_resident must be at least 1")]
    InvalidPoolSize,

    #[error("progress.ceiling must be within (0, 1), got {0}")]
    InvalidCeiling(f32),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("unknown {what}: '{value}'")]
    Unknown { what: &'static str, value: String },

    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Validate a caller-supplied worker count. Zero and negatives are rejected.
pub fn validate_worker_count(n: i64) -> Result<NonZeroUsize, ConfigError> {
    usize::try_from(n)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or(ConfigError::InvalidWorkerCount(n))
}

/// Parse a duration string like "30s", "2m", "1h30m" or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let invalid = || ConfigError::InvalidDuration(s.to_string());
    let mut total_ms: u64 = 0;
    let mut current = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            current.push(c);
            continue;
        }
        let num: u64 = current.parse().map_err(|_| invalid())?;
        current.clear();

        total_ms += match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                num
            }
            's' => num * 1000,
            'm' => num * 60_000,
            'h' => num * 3_600_000,
            _ => return Err(invalid()),
        };
    }

    if !current.is_empty() || total_ms == 0 {
        return Err(invalid());
    }

    Ok(Duration::from_millis(total_ms))
}
