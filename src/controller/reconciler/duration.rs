//! # Duration Parsing
//!
//! Parses Go-style duration strings used by the operator configuration,
//! e.g. `"300s"`, `"5m"`, `"1h30m"`, `"1.5h"`, `"250ms"`.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static SEGMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+(?:\.\d+)?|\.\d+)(?P<unit>ns|us|µs|μs|ms|s|m|h)")
        .expect("duration segment regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    #[error("duration string cannot be empty")]
    Empty,
    #[error("invalid duration '{0}'")]
    Invalid(String),
    #[error("missing unit in duration '{0}'")]
    MissingUnit(String),
    #[error("duration '{0}' must not be negative")]
    Negative(String),
}

/// Parse a Go-style duration string into a [`Duration`]
///
/// A bare `"0"` is accepted; every other value needs units.
///
/// # Errors
///
/// Returns [`DurationError`] for empty, negative, unit-less or malformed input.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }
    if trimmed.starts_with('-') {
        return Err(DurationError::Negative(trimmed.to_string()));
    }
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if unsigned == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = unsigned;
    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let captures = SEGMENT_REGEX.captures(rest).ok_or_else(|| {
            if rest.chars().all(|c| c.is_ascii_digit() || c == '.') {
                DurationError::MissingUnit(trimmed.to_string())
            } else {
                DurationError::Invalid(trimmed.to_string())
            }
        })?;
        let number: f64 = captures["number"]
            .parse()
            .map_err(|_| DurationError::Invalid(trimmed.to_string()))?;
        let unit_nanos = match &captures["unit"] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(DurationError::Invalid(trimmed.to_string())),
        };
        total_nanos += number * unit_nanos;
        rest = &rest[captures[0].len()..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(DurationError::Invalid(trimmed.to_string()));
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "finite, non-negative and range-checked above"
    )]
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
