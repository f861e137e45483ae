//! Cron based rescheduling of synchronizations.
//!
//! Besides standard cron expressions (with optional seconds field) and the `@hourly`-style
//! descriptors, the `@every <duration>` shorthand is supported, e.g. `@every 1s` or `@every 5m`.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use croner::{Cron, errors::CronError};
use snafu::{ResultExt, Snafu, ensure};

const EVERY_PREFIX: &str = "@every";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse cron expression {expression:?}"))]
    InvalidCronExpression {
        source: CronError,
        expression: String,
    },

    #[snafu(display("failed to parse interval of {expression:?}"))]
    InvalidInterval {
        source: humantime::DurationError,
        expression: String,
    },

    #[snafu(display("interval of {expression:?} must not be zero"))]
    ZeroInterval { expression: String },

    #[snafu(display("cron expression {expression:?} has no upcoming occurrence"))]
    NoUpcomingOccurrence {
        source: CronError,
        expression: String,
    },
}

/// A parsed schedule.
pub struct Schedule {
    expression: String,
    kind: ScheduleKind,
}

enum ScheduleKind {
    Cron(Cron),
    Every(Duration),
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schedule").field(&self.expression).finish()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, Error> {
        let trimmed = expression.trim();

        let kind = match trimmed.strip_prefix(EVERY_PREFIX) {
            Some(interval) if interval.starts_with(char::is_whitespace) => {
                let interval =
                    humantime::parse_duration(interval.trim()).context(InvalidIntervalSnafu {
                        expression,
                    })?;
                ensure!(!interval.is_zero(), ZeroIntervalSnafu { expression });
                ScheduleKind::Every(interval)
            }
            _ => ScheduleKind::Cron(
                Cron::new(trimmed)
                    .with_seconds_optional()
                    .parse()
                    .context(InvalidCronExpressionSnafu { expression })?,
            ),
        };

        Ok(Self {
            expression: expression.to_owned(),
            kind,
        })
    }

    /// Returns the time until the next run strictly after `now`.
    pub fn next_run(&self, now: DateTime<Utc>) -> Result<Duration, Error> {
        match &self.kind {
            ScheduleKind::Every(interval) => Ok(*interval),
            ScheduleKind::Cron(cron) => {
                let next = cron
                    .find_next_occurrence(&now, false)
                    .context(NoUpcomingOccurrenceSnafu {
                        expression: &self.expression,
                    })?;
                Ok((next - now).to_std().unwrap_or_default())
            }
        }
    }
}

/// Parses `expression` and returns the time until its next run strictly after `now`.
pub fn next_run(expression: &str, now: DateTime<Utc>) -> Result<Duration, Error> {
    Schedule::parse(expression)?.next_run(now)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, hour, minute, second)
            .unwrap()
    }

    #[rstest]
    #[case::every_second("@every 1s", at(12, 0, 0), Duration::from_secs(1))]
    #[case::every_minutes("@every 5m", at(12, 0, 0), Duration::from_secs(300))]
    #[case::every_compound("@every 1h 30m", at(12, 0, 0), Duration::from_secs(5400))]
    #[case::every_quarter_hour("*/15 * * * *", at(12, 7, 0), Duration::from_secs(8 * 60))]
    #[case::exact_match_is_skipped("0 * * * *", at(12, 0, 0), Duration::from_secs(3600))]
    #[case::with_seconds("30 * * * * *", at(12, 0, 10), Duration::from_secs(20))]
    #[case::hourly("@hourly", at(12, 59, 0), Duration::from_secs(60))]
    #[case::daily("@daily", at(23, 0, 0), Duration::from_secs(3600))]
    fn next_run_is_strictly_after_now(
        #[case] expression: &str,
        #[case] now: DateTime<Utc>,
        #[case] expected: Duration,
    ) {
        assert_eq!(next_run(expression, now).unwrap(), expected);
    }

    #[rstest]
    #[case::garbage("every now and then")]
    #[case::too_few_fields("* *")]
    #[case::out_of_range("61 * * * *")]
    #[case::bad_interval("@every soon")]
    #[case::zero_interval("@every 0s")]
    fn malformed_schedules_are_rejected(#[case] expression: &str) {
        assert!(Schedule::parse(expression).is_err());
    }

    #[test]
    fn display_keeps_expression() {
        let schedule = Schedule::parse("@every 10m").unwrap();
        assert_eq!(schedule.to_string(), "@every 10m");
    }
}
