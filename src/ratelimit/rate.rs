//! Rate definitions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WindowError;

/// Period unit used by the formatted rate notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodUnit {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl PeriodUnit {
    /// Get the duration of this period.
    pub fn duration(&self) -> Duration {
        match self {
            PeriodUnit::Second => Duration::from_secs(1),
            PeriodUnit::Minute => Duration::from_secs(60),
            PeriodUnit::Hour => Duration::from_secs(3600),
            PeriodUnit::Day => Duration::from_secs(86400),
        }
    }

    /// Parse the single-letter unit (`S`, `M`, `H`, `D`).
    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter.to_ascii_uppercase().as_str() {
            "S" => Some(PeriodUnit::Second),
            "M" => Some(PeriodUnit::Minute),
            "H" => Some(PeriodUnit::Hour),
            "D" => Some(PeriodUnit::Day),
            _ => None,
        }
    }

    fn letter(&self) -> char {
        match self {
            PeriodUnit::Second => 'S',
            PeriodUnit::Minute => 'M',
            PeriodUnit::Hour => 'H',
            PeriodUnit::Day => 'D',
        }
    }

    fn from_duration(period: Duration) -> Option<Self> {
        [
            PeriodUnit::Second,
            PeriodUnit::Minute,
            PeriodUnit::Hour,
            PeriodUnit::Day,
        ]
        .into_iter()
        .find(|unit| unit.duration() == period)
    }
}

/// The number of events allowed per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate {
    /// Events allowed per window
    pub limit: u64,
    /// Window length
    pub period: Duration,
}

impl Rate {
    /// Create a rate. The period must be non-zero.
    pub fn new(limit: u64, period: Duration) -> crate::error::Result<Self> {
        if period.is_zero() {
            return Err(WindowError::Config("rate period must be non-zero".to_string()));
        }
        Ok(Self { limit, period })
    }

    /// A rate of `limit` events per `unit`.
    pub fn per(limit: u64, unit: PeriodUnit) -> Self {
        Self {
            limit,
            period: unit.duration(),
        }
    }
}

impl FromStr for Rate {
    type Err = WindowError;

    /// Parse the `<limit>-<unit>` notation, e.g. `5-M` or `1000-h`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WindowError::Config(format!("incorrect rate format {s:?}"));

        let (limit, unit) = s.trim().split_once('-').ok_or_else(invalid)?;
        let limit: u64 = limit.parse().map_err(|_| invalid())?;
        let unit = PeriodUnit::from_letter(unit).ok_or_else(invalid)?;

        Ok(Rate::per(limit, unit))
    }
}

impl TryFrom<String> for Rate {
    type Error = WindowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rate> for String {
    fn from(rate: Rate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match PeriodUnit::from_duration(self.period) {
            Some(unit) => write!(f, "{}-{}", self.limit, unit.letter()),
            None => write!(f, "{} per {:?}", self.limit, self.period),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_unit_duration() {
        assert_eq!(PeriodUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(PeriodUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(PeriodUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(PeriodUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_formatted_rate() {
        let rate: Rate = "5-M".parse().unwrap();
        assert_eq!(rate.limit, 5);
        assert_eq!(rate.period, Duration::from_secs(60));

        let rate: Rate = "1000-h".parse().unwrap();
        assert_eq!(rate, Rate::per(1000, PeriodUnit::Hour));
    }

    #[test]
    fn test_parse_rejects_malformed_rates() {
        for input in ["", "5", "5-", "-M", "five-M", "5-W", "5-M-S"] {
            assert!(input.parse::<Rate>().is_err(), "{input:?} should not parse");
        }
    }

    #[test]
    fn test_new_rejects_zero_period() {
        assert!(Rate::new(10, Duration::ZERO).is_err());
        assert!(Rate::new(10, Duration::from_millis(250)).is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(Rate::per(5, PeriodUnit::Minute).to_string(), "5-M");
        let custom = Rate::new(3, Duration::from_millis(1500)).unwrap();
        assert_eq!(custom.to_string(), "3 per 1.5s");
    }

    #[test]
    fn test_deserialize_from_string() {
        let rate: Rate = serde_yaml::from_str("\"10-S\"").unwrap();
        assert_eq!(rate, Rate::per(10, PeriodUnit::Second));
        assert!(serde_yaml::from_str::<Rate>("\"10-X\"").is_err());
    }
}
