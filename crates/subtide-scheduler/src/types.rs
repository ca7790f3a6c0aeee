//! Scheduler types: run cadences, outcomes, configuration.

use std::time::Duration;

use crate::SchedulerError;

/// Units accepted in a cadence string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl FrequencyUnit {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "second" | "seconds" => Some(Self::Seconds),
            "minute" | "minutes" => Some(Self::Minutes),
            "hour" | "hours" => Some(Self::Hours),
            "day" | "days" => Some(Self::Days),
            "week" | "weeks" => Some(Self::Weeks),
            _ => None,
        }
    }

    /// Length of one unit in seconds.
    fn seconds(self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3600,
            Self::Days => 86400,
            Self::Weeks => 604800,
        }
    }
}

/// A resolved run cadence: run every `count` `unit`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frequency {
    pub count: u32,
    pub unit: FrequencyUnit,
}

impl Frequency {
    /// Parse a cadence string of the form `"<kind> <count> <unit>"`
    /// (e.g. `"interval 6 hours"`).
    ///
    /// `"never"` and a count of zero both resolve to `None`, meaning
    /// "not auto-scheduled".
    pub fn parse(s: &str) -> Result<Option<Frequency>, SchedulerError> {
        let s = s.trim();
        if s == "never" {
            return Ok(None);
        }

        let invalid = |reason: &str| SchedulerError::InvalidFrequency {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split_whitespace().collect();
        let [_kind, count, unit] = parts.as_slice() else {
            return Err(invalid("expected \"<kind> <count> <unit>\""));
        };

        let count: u32 = count.parse().map_err(|_| invalid("count is not a number"))?;
        let unit = FrequencyUnit::parse(unit).ok_or_else(|| invalid("unrecognized unit"))?;

        if count == 0 {
            return Ok(None);
        }
        Ok(Some(Frequency { count, unit }))
    }

    /// The cadence as a time span.
    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.unit.seconds() * i64::from(self.count))
    }
}

/// Result of a `run_task` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `prepare` and `run` both succeeded.
    Completed,
    /// `prepare` or `run` failed; finalization still ran.
    Failed,
    /// The task was already running; nothing happened.
    Skipped,
}

/// One-time substitution of a renamed recurring task.
///
/// The first time `task` comes due with `key` not yet applied, the
/// scheduler runs `legacy` in its place, immediately, and marks `key` so
/// the substitution never recurs.
#[derive(Debug, Clone)]
pub struct MigrationRule {
    /// Name the periodic loop watches for.
    pub task: String,
    /// Predecessor substituted for the single migration run.
    pub legacy: String,
    /// Durable key marking the substitution as applied.
    pub key: String,
}

/// Timing knobs for the two scheduler loops.
///
/// `spawn_delay` is an admission-control throttle bounding how many task
/// starts can burst at once; it is not a correctness requirement.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay before either loop does its first pass.
    pub startup_delay: Duration,
    /// Sleep between loop passes.
    pub poll_interval: Duration,
    /// Sleep between consecutive task spawns within one pass.
    pub spawn_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            spawn_delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // === Unit Tests ===

    #[test]
    fn parse_interval() {
        let frequency = Frequency::parse("interval 6 hours").unwrap().unwrap();
        assert_eq!(frequency.count, 6);
        assert_eq!(frequency.unit, FrequencyUnit::Hours);
        assert_eq!(frequency.as_duration(), chrono::Duration::hours(6));
    }

    #[test]
    fn parse_singular_unit() {
        let frequency = Frequency::parse("interval 1 day").unwrap().unwrap();
        assert_eq!(frequency.as_duration(), chrono::Duration::days(1));
    }

    #[test]
    fn parse_never() {
        assert_eq!(Frequency::parse("never").unwrap(), None);
        assert_eq!(Frequency::parse("  never  ").unwrap(), None);
    }

    #[test]
    fn parse_zero_count_means_never() {
        assert_eq!(Frequency::parse("interval 0 hours").unwrap(), None);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Frequency::parse("").is_err());
        assert!(Frequency::parse("interval").is_err());
        assert!(Frequency::parse("interval 6").is_err());
        assert!(Frequency::parse("interval six hours").is_err());
        assert!(Frequency::parse("interval 6 fortnights").is_err());
        assert!(Frequency::parse("interval 6 hours extra").is_err());
    }

    #[test]
    fn default_config_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.startup_delay, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.spawn_delay, Duration::from_secs(5));
    }

    // === Property-Based Tests ===

    fn unit_strategy() -> impl Strategy<Value = (&'static str, i64)> {
        prop_oneof![
            Just(("seconds", 1i64)),
            Just(("minutes", 60)),
            Just(("hours", 3600)),
            Just(("days", 86400)),
            Just(("weeks", 604800)),
        ]
    }

    proptest! {
        // Every well-formed cadence string parses, and its duration is
        // proportional to the count
        #[test]
        fn well_formed_cadence_parses((unit, unit_secs) in unit_strategy(), count in 1u32..10_000) {
            let input = format!("interval {} {}", count, unit);
            let frequency = Frequency::parse(&input).unwrap().unwrap();

            prop_assert_eq!(frequency.count, count);
            prop_assert_eq!(
                frequency.as_duration().num_seconds(),
                unit_secs * i64::from(count)
            );
        }

        // Duration is always positive for a parsed cadence
        #[test]
        fn parsed_cadence_is_positive((unit, _) in unit_strategy(), count in 1u32..10_000) {
            let input = format!("interval {} {}", count, unit);
            let frequency = Frequency::parse(&input).unwrap().unwrap();

            prop_assert!(frequency.as_duration() > chrono::Duration::zero());
        }
    }
}
