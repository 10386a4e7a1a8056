// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::time::Duration;

/// Represents the timeout budget for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeoutValue {
    Finite(Duration),
    Infinite,
}

impl LockTimeoutValue {
    /// Fail immediately after a single attempt.
    pub const NO_WAIT: LockTimeoutValue = LockTimeoutValue::Finite(Duration::ZERO);

    pub const fn from_secs(seconds: u64) -> Self {
        Self::Finite(Duration::from_secs(seconds))
    }

    /// Converts a `timeout_seconds` style option: `None` waits forever and
    /// negative or non-finite values are treated as zero. Values too large for
    /// a `Duration` wait forever.
    pub fn from_seconds(seconds: Option<f64>) -> Self {
        match seconds {
            None => LockTimeoutValue::Infinite,
            Some(value) if value.is_finite() && value > 0.0 => {
                Duration::try_from_secs_f64(value)
                    .map(LockTimeoutValue::Finite)
                    .unwrap_or(LockTimeoutValue::Infinite)
            }
            Some(_) => LockTimeoutValue::NO_WAIT,
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            LockTimeoutValue::Finite(duration) => *duration,
            LockTimeoutValue::Infinite => Duration::MAX,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, LockTimeoutValue::Infinite)
    }

    pub fn is_no_wait(&self) -> bool {
        matches!(self, LockTimeoutValue::Finite(duration) if duration.is_zero())
    }
}

impl fmt::Display for LockTimeoutValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTimeoutValue::Infinite => f.write_str("infinite"),
            LockTimeoutValue::Finite(duration) => write!(f, "{}s", duration.as_secs_f64()),
        }
    }
}

/// Error produced when parsing a timeout value fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeoutParseError {
    message: String,
}

impl fmt::Display for LockTimeoutParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LockTimeoutParseError {}

impl LockTimeoutParseError {
    fn invalid_value(value: &str) -> Self {
        Self {
            message: format!(
                "Lock timeout value '{value}' is invalid. Use a non-negative number of seconds \
                 or the word 'infinite'."
            ),
        }
    }
}

/// Parses a timeout value originating from configuration or the environment.
pub fn parse_timeout(value: &str) -> Result<LockTimeoutValue, LockTimeoutParseError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("infinite") {
        return Ok(LockTimeoutValue::Infinite);
    }

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(LockTimeoutValue::from_secs(seconds));
    }

    match trimmed.parse::<f64>() {
        Ok(seconds) if seconds >= 0.0 => Duration::try_from_secs_f64(seconds)
            .map(LockTimeoutValue::Finite)
            .map_err(|_| LockTimeoutParseError::invalid_value(trimmed)),
        _ => Err(LockTimeoutParseError::invalid_value(trimmed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_numeric_values() {
        assert_eq!(parse_timeout("42").unwrap(), LockTimeoutValue::from_secs(42));
        assert_eq!(parse_timeout("0").unwrap(), LockTimeoutValue::NO_WAIT);
        assert_eq!(
            parse_timeout("0.5").unwrap(),
            LockTimeoutValue::Finite(Duration::from_millis(500))
        );
    }

    #[test]
    fn parse_infinite_keyword() {
        assert_eq!(parse_timeout("infinite").unwrap(), LockTimeoutValue::Infinite);
        assert_eq!(parse_timeout(" Infinite ").unwrap(), LockTimeoutValue::Infinite);
    }

    #[test]
    fn parse_rejects_invalid_input() {
        let err = parse_timeout("abc").unwrap_err();
        assert!(err.to_string().contains("or the word 'infinite'"));
        assert!(parse_timeout("-3").is_err());
        assert!(parse_timeout("NaN").is_err());
    }

    #[test]
    fn parse_rejects_values_beyond_duration_range() {
        let err = parse_timeout("1e30").unwrap_err();
        assert!(err.to_string().contains("'1e30'"));
        assert!(parse_timeout("inf").is_err());
    }

    #[test]
    fn from_seconds_maps_nil_to_infinite() {
        assert_eq!(LockTimeoutValue::from_seconds(None), LockTimeoutValue::Infinite);
        assert!(LockTimeoutValue::from_seconds(Some(0.0)).is_no_wait());
        assert!(LockTimeoutValue::from_seconds(Some(-1.0)).is_no_wait());
        assert_eq!(
            LockTimeoutValue::from_seconds(Some(2.0)),
            LockTimeoutValue::from_secs(2)
        );
    }

    #[test]
    fn from_seconds_saturates_huge_values_to_infinite() {
        assert_eq!(
            LockTimeoutValue::from_seconds(Some(1e30)),
            LockTimeoutValue::Infinite
        );
        assert!(LockTimeoutValue::from_seconds(Some(f64::INFINITY)).is_no_wait());
    }
}
