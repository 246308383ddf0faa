//! Compound duration strings such as `10ms`, `1s500ms` or `1.5h`
//!
//! Grammar:
//!
//! ```text
//! duration := term+
//! term     := number unit
//! number   := digits ( "." digits? )? | "." digits
//! unit     := "h" | "m" | "s" | "ms" | "us"
//! ```
//!
//! Repeated units add up. Values are kept at microsecond precision.

use crate::error::ValidationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

static WHOLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:\d+(?:\.\d*)?|\.\d+)(?:h|ms|us|m|s))+$").expect("duration grammar")
});

static TERM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(h|ms|us|m|s)").expect("duration term"));

const MICROS_PER_MS: u64 = 1_000;
const MICROS_PER_SEC: u64 = 1_000_000;
const MICROS_PER_MIN: u64 = 60 * MICROS_PER_SEC;
const MICROS_PER_HOUR: u64 = 60 * MICROS_PER_MIN;

/// A duration parsed from a compound unit string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CompoundDuration(Duration);

impl CompoundDuration {
    /// Build from a whole number of microseconds
    #[inline]
    #[must_use]
    pub fn from_micros(micros: u64) -> Self {
        Self(Duration::from_micros(micros))
    }

    /// Seconds as a float, the unit rules and log documents use
    #[inline]
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    /// The underlying [`Duration`]
    #[inline]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Whether the duration is zero
    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    fn total_micros(&self) -> u64 {
        u64::try_from(self.0.as_micros()).unwrap_or(u64::MAX)
    }
}

impl FromStr for CompoundDuration {
    type Err = ValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if !WHOLE.is_match(trimmed) {
            return Err(ValidationError::InvalidDuration {
                input: input.to_string(),
                reason: "expected one or more <number><h|m|s|ms|us> terms".to_string(),
            });
        }

        let mut micros = 0f64;
        for caps in TERM.captures_iter(trimmed) {
            let value: f64 = caps[1].parse().map_err(|_| ValidationError::InvalidDuration {
                input: input.to_string(),
                reason: format!("bad number '{}'", &caps[1]),
            })?;
            #[allow(clippy::cast_precision_loss)]
            let scale = match &caps[2] {
                "h" => MICROS_PER_HOUR,
                "m" => MICROS_PER_MIN,
                "s" => MICROS_PER_SEC,
                "ms" => MICROS_PER_MS,
                _ => 1,
            } as f64;
            micros += value * scale;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(Self::from_micros(micros.round() as u64))
    }
}

impl fmt::Display for CompoundDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.total_micros();
        if rest == 0 {
            return f.write_str("0s");
        }
        for (scale, unit) in [
            (MICROS_PER_HOUR, "h"),
            (MICROS_PER_MIN, "m"),
            (MICROS_PER_SEC, "s"),
            (MICROS_PER_MS, "ms"),
            (1, "us"),
        ] {
            let count = rest / scale;
            if count > 0 {
                write!(f, "{count}{unit}")?;
                rest %= scale;
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for CompoundDuration {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompoundDuration> for String {
    fn from(value: CompoundDuration) -> Self {
        value.to_string()
    }
}

impl From<Duration> for CompoundDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: &str) -> f64 {
        s.parse::<CompoundDuration>().unwrap().as_secs_f64()
    }

    #[test]
    fn parses_single_units() {
        assert!((secs("100ms") - 0.1).abs() < 1e-9);
        assert!((secs("1s") - 1.0).abs() < 1e-9);
        assert!((secs("5m") - 300.0).abs() < 1e-9);
        assert!((secs("3h") - 10_800.0).abs() < 1e-9);
        assert!((secs("250us") - 0.000_25).abs() < 1e-12);
    }

    #[test]
    fn parses_compound_and_fractional() {
        assert!((secs("1s500ms") - 1.5).abs() < 1e-9);
        assert!((secs("1m30s") - 90.0).abs() < 1e-9);
        assert!((secs("1.5s") - 1.5).abs() < 1e-9);
        assert!((secs(".5s") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn repeated_units_accumulate() {
        assert!((secs("1s1s") - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "10", "ms", "10x", "1s 500ms", "-1s", "1.2.3s"] {
            assert!(bad.parse::<CompoundDuration>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn formats_canonically() {
        assert_eq!(CompoundDuration::from_micros(1_500_000).to_string(), "1s500ms");
        assert_eq!(CompoundDuration::from_micros(0).to_string(), "0s");
        assert_eq!(CompoundDuration::from_micros(3_723_000_001).to_string(), "1h2m3s1us");
    }

    #[test]
    fn deserializes_from_json_string() {
        let d: CompoundDuration = serde_json::from_str("\"2s\"").unwrap();
        assert_eq!(d.as_duration(), Duration::from_secs(2));
        assert!(serde_json::from_str::<CompoundDuration>("\"soon\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_format_then_parse_is_identity(micros in 0u64..1_000_000_000_000) {
            let d = CompoundDuration::from_micros(micros);
            let parsed: CompoundDuration = d.to_string().parse().unwrap();
            prop_assert_eq!(parsed, d);
        }

        #[test]
        fn prop_parse_then_format_is_canonical(h in 0u64..5, m in 0u64..60, s in 0u64..60, ms in 0u64..1000) {
            let text = format!("{h}h{m}m{s}s{ms}ms");
            let d: CompoundDuration = text.parse().unwrap();
            let again: CompoundDuration = d.to_string().parse().unwrap();
            prop_assert_eq!(again, d);
            prop_assert_eq!(d.as_duration(), Duration::from_millis(((h * 60 + m) * 60 + s) * 1000 + ms));
        }
    }
}
