// Trigger engine: next fire time calculation for cron, interval and date triggers
//
// Everything here is pure. The reference time is always passed in, so the same
// inputs give the same answer.

use crate::errors::ScheduleError;
use crate::models::{CronFields, Trigger};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// How far ahead a cron trigger may look before it is declared unsatisfiable
pub const CRON_LOOKAHEAD_YEARS: i32 = 5;

/// Upper bound on the interval length, keeps grid arithmetic inside i64 nanoseconds
pub const MAX_INTERVAL_SECONDS: u64 = 10 * 366 * 24 * 3600;

/// ScheduleTrigger computes fire times for a trigger
pub trait ScheduleTrigger {
    /// Earliest fire time strictly after `after`, or `None` once exhausted
    fn next_fire(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError>;

    /// Check the trigger arguments and return the first fire after `now`
    fn validate(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_fire(now)?.ok_or(ScheduleError::Exhausted)
    }
}

impl ScheduleTrigger for Trigger {
    fn next_fire(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Trigger::Cron {
                fields,
                timezone,
                end_date,
            } => calculate_cron_next_fire(fields, *timezone, *end_date, after),

            Trigger::Interval {
                every_seconds,
                start_date,
                end_date,
            } => calculate_interval_next_fire(*every_seconds, *start_date, *end_date, after),

            Trigger::Date { run_at } => Ok((*run_at > after).then_some(*run_at)),
        }
    }
}

/// Parse crontab fields into an evaluable schedule
///
/// Weekday numbers follow crontab (0 and 7 are Sunday) and are rewritten to
/// the 1-7 numbering the `cron` crate expects.
pub fn parse_cron_fields(fields: &CronFields) -> Result<CronSchedule, ScheduleError> {
    let day_of_week = translate_day_of_week(&fields.day_of_week).map_err(|reason| {
        ScheduleError::InvalidCronExpression {
            expression: fields.to_string(),
            reason,
        }
    })?;

    let expression = format!(
        "0 {} {} {} {} {}",
        fields.minute, fields.hour, fields.day, fields.month, day_of_week
    );

    CronSchedule::from_str(&expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: fields.to_string(),
        reason: e.to_string(),
    })
}

fn calculate_cron_next_fire(
    fields: &CronFields,
    timezone: Tz,
    end_date: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron_fields(fields)?;

    let reference_in_tz = after.with_timezone(&timezone);
    let next = schedule
        .after(&reference_in_tz)
        .next()
        .map(|dt| dt.with_timezone(&Utc));

    let no_match = || ScheduleError::NoFutureMatch {
        expression: fields.to_string(),
        lookahead_years: CRON_LOOKAHEAD_YEARS,
    };

    let next = next.ok_or_else(no_match)?;

    if end_date.is_some_and(|end| next > end) {
        return Ok(None);
    }

    let horizon = after
        .checked_add_months(chrono::Months::new(12 * CRON_LOOKAHEAD_YEARS as u32))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if next > horizon {
        return Err(no_match());
    }

    Ok(Some(next))
}

/// Interval fires sit on the grid `start_date + k * every`
///
/// Without an anchor the grid starts at `after` itself.
fn calculate_interval_next_fire(
    every_seconds: u64,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    if every_seconds == 0 {
        return Err(ScheduleError::InvalidInterval(
            "every_seconds must be greater than 0".to_string(),
        ));
    }
    if every_seconds > MAX_INTERVAL_SECONDS {
        return Err(ScheduleError::InvalidInterval(format!(
            "every_seconds must not exceed {}",
            MAX_INTERVAL_SECONDS
        )));
    }

    let every = Duration::seconds(every_seconds as i64);

    let next = match start_date {
        None => after + every,
        Some(anchor) if after < anchor => anchor,
        Some(anchor) => {
            let too_far = || {
                ScheduleError::InvalidConfiguration(
                    "interval anchor too far in the past".to_string(),
                )
            };
            let every_ns = every_seconds as i64 * 1_000_000_000;
            let elapsed_ns = (after - anchor).num_nanoseconds().ok_or_else(too_far)?;
            let offset_ns = (elapsed_ns / every_ns + 1)
                .checked_mul(every_ns)
                .ok_or_else(too_far)?;
            anchor
                .checked_add_signed(Duration::nanoseconds(offset_ns))
                .ok_or_else(too_far)?
        }
    };

    if end_date.is_some_and(|end| next > end) {
        return Ok(None);
    }

    Ok(Some(next))
}

fn weekday_ordinal(token: &str) -> Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return match n {
            0..=7 => Ok(n % 7 + 1),
            _ => Err(format!("day of week {} out of range 0-7", n)),
        };
    }
    let ordinal = match token.to_ascii_lowercase().as_str() {
        "sun" | "sunday" => 1,
        "mon" | "monday" => 2,
        "tue" | "tuesday" => 3,
        "wed" | "wednesday" => 4,
        "thu" | "thursday" => 5,
        "fri" | "friday" => 6,
        "sat" | "saturday" => 7,
        _ => return Err(format!("unknown day of week '{}'", token)),
    };
    Ok(ordinal)
}

fn translate_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

        if range == "*" || range == "?" {
            items.push(format!("{}{}", range, suffix));
            continue;
        }

        match range.split_once('-') {
            None => items.push(format!("{}{}", weekday_ordinal(range)?, suffix)),
            Some((start, end)) => {
                let start_ord = weekday_ordinal(start)?;
                let end_ord = weekday_ordinal(end)?;
                if start_ord <= end_ord {
                    items.push(format!("{}-{}{}", start_ord, end_ord, suffix));
                } else if end.trim() == "7" && step.is_none() {
                    // "1-7" style ranges end on Sunday, which wraps to ordinal 1
                    items.push(format!("{}-7", start_ord));
                    items.push("1".to_string());
                } else {
                    return Err(format!("day of week range '{}' wraps around", range));
                }
            }
        }
    }

    Ok(items.join(","))
}

/// Fire times that came due between a job's stored next fire time and `now`
#[derive(Debug, Clone)]
pub struct Backlog {
    /// Due fire times in ascending order, all `<= now`
    pub due: Vec<DateTime<Utc>>,
    /// True when the walk stopped at its bound and fires were skipped
    pub truncated: bool,
    /// First fire strictly after `now`
    pub next: Result<Option<DateTime<Utc>>, ScheduleError>,
}

/// Walk forward from `first` collecting every fire `<= now`
///
/// Each step is computed from the fire before it, so a job keeps its phase
/// however late the walk happens. At most `limit` fires are collected; past
/// that the remainder is skipped and `next` is taken from `now`.
pub fn backlog(trigger: &Trigger, first: DateTime<Utc>, now: DateTime<Utc>, limit: usize) -> Backlog {
    let mut due = Vec::new();
    let mut current = first;

    while current <= now {
        if due.len() >= limit.max(1) {
            return Backlog {
                due,
                truncated: true,
                next: trigger.next_fire(now),
            };
        }
        due.push(current);
        match trigger.next_fire(current) {
            Ok(Some(next)) => current = next,
            other => {
                return Backlog {
                    due,
                    truncated: false,
                    next: other,
                }
            }
        }
    }

    Backlog {
        due,
        truncated: false,
        next: Ok(Some(current)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_parse_valid_cron_fields() {
        let fields = CronFields::from_expression("*/15 9-17 * * mon-fri").unwrap();
        assert!(parse_cron_fields(&fields).is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_fields() {
        let fields = CronFields::from_expression("61 * * * *").unwrap();
        assert!(parse_cron_fields(&fields).is_err());

        let fields = CronFields::from_expression("0 0 * * funday").unwrap();
        assert!(parse_cron_fields(&fields).is_err());
    }

    #[test]
    fn test_cron_next_fire_is_strictly_after() {
        let trigger = Trigger::cron("30 2 * * *").unwrap();
        let after = utc(2024, 3, 10, 2, 30, 0);
        let next = trigger.next_fire(after).unwrap().unwrap();
        assert_eq!(next, utc(2024, 3, 11, 2, 30, 0));
    }

    #[test]
    fn test_cron_weekday_uses_crontab_numbering() {
        // 2024-01-01 is a Monday
        let after = utc(2024, 1, 1, 12, 0, 0);

        let sunday = Trigger::cron("0 0 * * 0").unwrap();
        let next = sunday.next_fire(after).unwrap().unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next, utc(2024, 1, 7, 0, 0, 0));

        let sunday_as_seven = Trigger::cron("0 0 * * 7").unwrap();
        assert_eq!(sunday_as_seven.next_fire(after).unwrap(), Some(next));

        let weekdays = Trigger::cron("0 9 * * 1-5").unwrap();
        let next = weekdays.next_fire(utc(2024, 1, 5, 10, 0, 0)).unwrap().unwrap();
        assert_eq!(next, utc(2024, 1, 8, 9, 0, 0));
        assert_eq!(next.weekday(), Weekday::Mon);

        let whole_week = Trigger::cron("0 9 * * 1-7").unwrap();
        let next = whole_week.next_fire(utc(2024, 1, 6, 10, 0, 0)).unwrap().unwrap();
        assert_eq!(next, utc(2024, 1, 7, 9, 0, 0));
    }

    #[test]
    fn test_cron_handles_leap_day() {
        let trigger = Trigger::cron("0 0 29 2 *").unwrap();
        let next = trigger.next_fire(utc(2024, 3, 1, 0, 0, 0)).unwrap().unwrap();
        assert_eq!(next, utc(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn test_cron_handles_short_months() {
        let trigger = Trigger::cron("0 0 31 * *").unwrap();
        let next = trigger.next_fire(utc(2024, 4, 1, 0, 0, 0)).unwrap().unwrap();
        assert_eq!(next, utc(2024, 5, 31, 0, 0, 0));
    }

    #[test]
    fn test_cron_without_future_match_fails_fast() {
        let trigger = Trigger::cron("0 0 30 2 *").unwrap();
        let err = trigger.next_fire(utc(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, ScheduleError::NoFutureMatch { .. }));
    }

    #[test]
    fn test_cron_respects_timezone() {
        let trigger = Trigger::Cron {
            fields: CronFields::from_expression("0 9 * * *").unwrap(),
            timezone: chrono_tz::Asia::Ho_Chi_Minh,
            end_date: None,
        };
        let next = trigger.next_fire(utc(2024, 6, 1, 0, 0, 0)).unwrap().unwrap();
        // 09:00 at UTC+7
        assert_eq!(next, utc(2024, 6, 1, 2, 0, 0));
    }

    #[test]
    fn test_cron_with_end_date() {
        let trigger = Trigger::Cron {
            fields: CronFields::from_expression("0 12 * * *").unwrap(),
            timezone: chrono_tz::UTC,
            end_date: Some(utc(2024, 1, 1, 0, 0, 0)),
        };
        assert_eq!(trigger.next_fire(utc(2024, 1, 2, 0, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_interval_without_anchor_adds_duration() {
        let trigger = Trigger::interval(90);
        let after = utc(2024, 1, 1, 0, 0, 0);
        assert_eq!(trigger.next_fire(after).unwrap(), Some(after + Duration::seconds(90)));
    }

    #[test]
    fn test_interval_stays_on_anchor_grid() {
        let anchor = utc(2024, 1, 1, 0, 0, 10);
        let trigger = Trigger::Interval {
            every_seconds: 10,
            start_date: Some(anchor),
            end_date: None,
        };
        assert_eq!(trigger.next_fire(utc(2024, 1, 1, 0, 0, 0)).unwrap(), Some(anchor));
        assert_eq!(trigger.next_fire(anchor).unwrap(), Some(utc(2024, 1, 1, 0, 0, 20)));
        assert_eq!(
            trigger.next_fire(utc(2024, 1, 1, 0, 0, 27)).unwrap(),
            Some(utc(2024, 1, 1, 0, 0, 30))
        );
    }

    #[test]
    fn test_interval_grid_overflow_is_rejected() {
        let after = utc(2300, 1, 1, 0, 0, 0);
        // 29 whole periods fit in i64 nanoseconds, the 30th does not
        let trigger = Trigger::Interval {
            every_seconds: MAX_INTERVAL_SECONDS,
            start_date: Some(after - Duration::seconds(9_200_000_000)),
            end_date: None,
        };
        assert!(matches!(
            trigger.next_fire(after),
            Err(ScheduleError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_interval_rejects_zero() {
        let trigger = Trigger::interval(0);
        assert!(matches!(
            trigger.next_fire(Utc::now()),
            Err(ScheduleError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_interval_end_date_exhausts() {
        let anchor = utc(2024, 1, 1, 0, 0, 0);
        let trigger = Trigger::Interval {
            every_seconds: 60,
            start_date: Some(anchor),
            end_date: Some(utc(2024, 1, 1, 0, 1, 30)),
        };
        assert_eq!(
            trigger.next_fire(anchor).unwrap(),
            Some(utc(2024, 1, 1, 0, 1, 0))
        );
        assert_eq!(trigger.next_fire(utc(2024, 1, 1, 0, 1, 0)).unwrap(), None);
    }

    #[test]
    fn test_date_fires_once() {
        let run_at = utc(2024, 5, 1, 8, 0, 0);
        let trigger = Trigger::date(run_at);
        assert_eq!(trigger.next_fire(utc(2024, 5, 1, 7, 0, 0)).unwrap(), Some(run_at));
        assert_eq!(trigger.next_fire(run_at).unwrap(), None);
        assert!(matches!(
            trigger.validate(utc(2024, 6, 1, 0, 0, 0)),
            Err(ScheduleError::Exhausted)
        ));
    }

    #[test]
    fn test_backlog_walks_in_phase() {
        let anchor = utc(2024, 1, 1, 0, 0, 10);
        let trigger = Trigger::Interval {
            every_seconds: 10,
            start_date: Some(anchor),
            end_date: None,
        };
        let walk = backlog(&trigger, anchor, utc(2024, 1, 1, 0, 0, 27), 1000);
        assert_eq!(walk.due, vec![anchor, utc(2024, 1, 1, 0, 0, 20)]);
        assert!(!walk.truncated);
        assert_eq!(walk.next.unwrap(), Some(utc(2024, 1, 1, 0, 0, 30)));
    }

    #[test]
    fn test_backlog_is_bounded() {
        let anchor = utc(2024, 1, 1, 0, 0, 0);
        let trigger = Trigger::Interval {
            every_seconds: 1,
            start_date: Some(anchor),
            end_date: None,
        };
        let now = utc(2024, 1, 2, 0, 0, 0);
        let walk = backlog(&trigger, anchor, now, 5);
        assert_eq!(walk.due.len(), 5);
        assert!(walk.truncated);
        assert_eq!(walk.next.unwrap(), Some(now + Duration::seconds(1)));
    }

    #[test]
    fn test_backlog_of_date_trigger_ends_exhausted() {
        let run_at = utc(2024, 5, 1, 8, 0, 0);
        let walk = backlog(&Trigger::date(run_at), run_at, utc(2024, 5, 1, 9, 0, 0), 10);
        assert_eq!(walk.due, vec![run_at]);
        assert_eq!(walk.next.unwrap(), None);
    }

    #[test]
    fn test_cron_results_are_whole_minutes() {
        let trigger = Trigger::cron("*/7 * * * *").unwrap();
        let next = trigger.next_fire(utc(2024, 1, 1, 0, 3, 41)).unwrap().unwrap();
        assert_eq!(next.second(), 0);
        assert_eq!(next.minute() % 7, 0);
    }
}
