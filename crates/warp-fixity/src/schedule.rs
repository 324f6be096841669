//! Periodic re-check scheduling
//!
//! A record is due when periodic checking is enabled and its last check is
//! at or before the *threshold*: `now` minus the configured interval. The
//! threshold is computed once per [`SchedulingPass`] and reused for every
//! record the pass looks at.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{FixityRecord, Timestamp, NEVER};

/// Unit of a [`RelativeDuration`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    /// Seconds
    Second,
    /// Minutes
    Minute,
    /// Hours
    Hour,
    /// Days
    Day,
    /// Weeks
    Week,
    /// Calendar months
    Month,
    /// Calendar years
    Year,
}

impl DurationUnit {
    fn parse(unit: &str) -> Option<Self> {
        let unit = unit.trim().to_ascii_lowercase();
        let unit = match unit.as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => Self::Second,
            "m" | "min" | "mins" | "minute" | "minutes" => Self::Minute,
            "h" | "hr" | "hrs" | "hour" | "hours" => Self::Hour,
            "d" | "day" | "days" => Self::Day,
            "w" | "wk" | "wks" | "week" | "weeks" => Self::Week,
            "mo" | "mon" | "month" | "months" => Self::Month,
            "y" | "yr" | "yrs" | "year" | "years" => Self::Year,
            _ => return None,
        };
        Some(unit)
    }

    fn seconds(self) -> Option<i64> {
        match self {
            Self::Second => Some(1),
            Self::Minute => Some(60),
            Self::Hour => Some(3_600),
            Self::Day => Some(86_400),
            Self::Week => Some(604_800),
            Self::Month | Self::Year => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

/// Interval such as `"-1 month"` or `"30 days"`, always applied backwards
/// from the current time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeDuration {
    amount: u32,
    unit: DurationUnit,
}

impl RelativeDuration {
    /// Create a duration of `amount` units
    pub fn new(amount: u32, unit: DurationUnit) -> Self {
        Self { amount, unit }
    }

    /// Number of units
    pub fn amount(&self) -> u32 {
        self.amount
    }

    /// Unit
    pub fn unit(&self) -> DurationUnit {
        self.unit
    }

    /// The instant this duration before `now`
    pub fn before(&self, now: Timestamp) -> Result<Timestamp> {
        if let Some(unit_secs) = self.unit.seconds() {
            return now
                .checked_sub(i64::from(self.amount) * unit_secs)
                .ok_or_else(|| Error::Config(format!("interval '{self}' underflows")));
        }

        let months = match self.unit {
            DurationUnit::Year => self.amount.checked_mul(12),
            _ => Some(self.amount),
        }
        .ok_or_else(|| Error::Config(format!("interval '{self}' is too large")))?;

        DateTime::<Utc>::from_timestamp(now, 0)
            .and_then(|at| at.checked_sub_months(Months::new(months)))
            .map(|at| at.timestamp())
            .ok_or_else(|| Error::Config(format!("interval '{self}' is out of range")))
    }
}

impl Default for RelativeDuration {
    fn default() -> Self {
        Self::new(1, DurationUnit::Month)
    }
}

impl fmt::Display for RelativeDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = if self.amount == 1 { "" } else { "s" };
        write!(f, "-{} {}{plural}", self.amount, self.unit.name())
    }
}

impl FromStr for RelativeDuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid relative duration '{s}'"));

        let body = s.trim();
        let body = body
            .strip_prefix('-')
            .or_else(|| body.strip_prefix('+'))
            .unwrap_or(body)
            .trim_start();
        let digits = body.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u32 = body[..digits].parse().map_err(|_| invalid())?;
        let unit = DurationUnit::parse(&body[digits..]).ok_or_else(invalid)?;
        Ok(Self::new(amount, unit))
    }
}

/// Decides when records are due for a re-check
#[derive(Debug, Clone, Default)]
pub struct SchedulingPolicy {
    interval: RelativeDuration,
}

impl SchedulingPolicy {
    /// Create a policy re-checking every `interval`
    pub fn new(interval: RelativeDuration) -> Self {
        Self { interval }
    }

    /// Configured interval
    pub fn interval(&self) -> RelativeDuration {
        self.interval
    }

    /// Timestamp at or before which a previous check is stale
    pub fn threshold(&self, now: Timestamp) -> Result<Timestamp> {
        self.interval.before(now)
    }

    /// Compute the threshold once for a scheduling pass at `now`
    pub fn pass(&self, now: Timestamp) -> Result<SchedulingPass> {
        Ok(SchedulingPass {
            now,
            threshold: self.threshold(now)?,
        })
    }

    /// Whether `record` is due against `threshold`
    pub fn is_due(record: &FixityRecord, threshold: Timestamp) -> bool {
        record.periodic()
            && (record.performed_at() == NEVER || record.performed_at() <= threshold)
    }
}

/// Threshold fixed for one scheduling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingPass {
    /// When the pass started
    pub now: Timestamp,
    /// Stale boundary for the pass
    pub threshold: Timestamp,
}

impl SchedulingPass {
    /// Whether `record` is due in this pass
    pub fn is_due(&self, record: &FixityRecord) -> bool {
        SchedulingPolicy::is_due(record, self.threshold)
    }

    /// When `record` next becomes due, `None` if it is not periodic
    pub fn next_run_at(&self, record: &FixityRecord) -> Option<Timestamp> {
        if !record.periodic() {
            return None;
        }
        if record.performed_at() == NEVER {
            return Some(self.now);
        }
        Some(record.performed_at() + (self.now - self.threshold))
    }

    /// Whether a check of `record` should run now. Checks completed after the
    /// threshold are skipped unless forced.
    pub fn should_check(&self, record: &FixityRecord, force: bool) -> bool {
        force || record.performed_at() <= self.threshold
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::tests::record;
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: due exactly when last performed at or before the threshold
        #[test]
        fn due_boundary(threshold in 1i64..4_000_000_000, amount in 1u32..400) {
            let pass = SchedulingPass { now: threshold + i64::from(amount) * 86_400, threshold };
            prop_assert!(pass.is_due(&record(true, threshold - 1)));
            prop_assert!(pass.is_due(&record(true, threshold)));
            prop_assert!(!pass.is_due(&record(true, threshold + 1)));
            prop_assert!(!pass.is_due(&record(false, threshold - 1)));
        }

        /// Property: the threshold never lies after now
        #[test]
        fn threshold_is_in_the_past(now in 1_000_000_000i64..4_000_000_000, amount in 0u32..120) {
            for unit in [DurationUnit::Second, DurationUnit::Day, DurationUnit::Month, DurationUnit::Year] {
                let policy = SchedulingPolicy::new(RelativeDuration::new(amount, unit));
                prop_assert!(policy.threshold(now).unwrap() <= now);
            }
        }
    }
}
