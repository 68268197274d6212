//! Cron expression + time zone validation for scheduled routes.
//!
//! Job schedules use the five-field unix syntax
//! (`minute hour day-of-month month day-of-week`). Everything is checked
//! locally so a bad schedule fails before the scheduler is contacted.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::errors::TaskError;

const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A validated cron schedule bound to a time zone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    time_zone: Tz,
    inner: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str, time_zone: &str) -> anyhow::Result<Self> {
        let time_zone = parse_time_zone(time_zone)?;
        let inner = parse_cron(expression)?;
        Ok(Self {
            expression: expression.trim().to_string(),
            time_zone,
            inner,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    /// Next tick strictly after `after`, evaluated in the schedule's zone.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner
            .after(&after.with_timezone(&self.time_zone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub fn validate_schedule(expression: &str, time_zone: &str) -> anyhow::Result<()> {
    CronSchedule::parse(expression, time_zone).map(|_| ())
}

pub fn parse_time_zone(time_zone: &str) -> anyhow::Result<Tz> {
    Tz::from_str(time_zone.trim()).map_err(|_| {
        TaskError::schedule_validation(format!("Invalid timezone: '{time_zone}'")).into_anyhow()
    })
}

fn invalid_cron(expression: &str, reason: impl std::fmt::Display) -> anyhow::Error {
    TaskError::schedule_validation(format!("Invalid cron expression '{expression}': {reason}"))
        .into_anyhow()
}

fn parse_cron(expression: &str) -> anyhow::Result<cron::Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid_cron(
            expression,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }

    let dow = unix_day_of_week(fields[4]).map_err(|reason| invalid_cron(expression, reason))?;
    // The cron crate wants a leading seconds field.
    let six_field = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    );

    cron::Schedule::from_str(&six_field).map_err(|e| invalid_cron(expression, e))
}

/// Unix day-of-week numbers run 0-7 with both 0 and 7 meaning Sunday, while
/// the cron crate numbers days from 1. Rewrite numbers as day names.
fn unix_day_of_week(field: &str) -> Result<String, String> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };

        let range = match range.split_once('-') {
            Some((start, end)) => {
                let start = day_name(start)?;
                match (end.trim().parse::<u32>(), step) {
                    // `1-7` style ranges wrap past Saturday.
                    (Ok(7), None) if start != "SUN" => format!("{start}-SAT,SUN"),
                    (Ok(7), None) => "SUN-SAT".to_string(),
                    _ => format!("{start}-{}", day_name(end)?),
                }
            }
            None => day_name(range)?,
        };

        parts.push(match step {
            Some(step) => format!("{range}/{step}"),
            None => range,
        });
    }
    Ok(parts.join(","))
}

fn day_name(token: &str) -> Result<String, String> {
    let token = token.trim();
    match token.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(DOW_NAMES[n % 7].to_string()),
        Ok(n) => Err(format!("day of week {n} is out of range")),
        Err(_) => Ok(token.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use chrono::TimeZone;

    fn message(err: anyhow::Error) -> String {
        let task = TaskError::from_anyhow(&err).expect("task error");
        assert_eq!(task.kind, ErrorKind::ScheduleValidation);
        task.message.clone()
    }

    #[test]
    fn accepts_common_expressions() {
        for (expr, tz) in [
            ("0 * * * *", "UTC"),
            ("*/5 * * * *", "UTC"),
            ("0 0 * * *", "America/New_York"),
            ("0 9-17 * * 1-5", "Asia/Tokyo"),
            ("*/5 * * * *", "Asia/Kolkata"),
            ("30 6 * * 0", "Europe/Berlin"),
            ("0 12 * * 1-7", "UTC"),
        ] {
            validate_schedule(expr, tz).unwrap_or_else(|e| panic!("{expr} in {tz}: {e}"));
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["invalid", "not-a-cron", "* * * *", "60 * * * *", "* 24 * * *", "* * * * 9"] {
            let err = validate_schedule(expr, "UTC").unwrap_err();
            assert!(
                message(err).starts_with("Invalid cron expression"),
                "{expr} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_unknown_time_zones() {
        let err = validate_schedule("0 * * * *", "Invalid/Timezone").unwrap_err();
        assert!(message(err).starts_with("Invalid timezone"));
    }

    #[test]
    fn weekday_numbers_follow_unix_convention() {
        // 2024-01-06 is a Saturday; the next 1-5 tick is Monday 09:00.
        let schedule = CronSchedule::parse("0 9 * * 1-5", "UTC").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(after),
            Some(Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn next_tick_is_evaluated_in_the_time_zone() {
        let schedule = CronSchedule::parse("0 0 * * *", "Asia/Kolkata").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // Midnight in Kolkata is 18:30 UTC the previous day.
        assert_eq!(
            schedule.next_after(after),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 18, 30, 0).unwrap())
        );
    }
}
