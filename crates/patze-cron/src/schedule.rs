//! Schedule evaluation: one-shot instants, fixed periods, and five-field
//! cron expressions at minute resolution.

use chrono::{DateTime, Datelike, Timelike, Utc};
use patze_proto::TaskSchedule;

pub const MIN_EVERY_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("cron expression must have five fields")]
    WrongFieldCount,
    #[error("cron field '{0}' is malformed")]
    BadField(String),
    #[error("cron value {0} is out of range")]
    OutOfRange(u32),
    #[error("'every' period must be at least {MIN_EVERY_MS}ms")]
    PeriodTooShort,
}

/// One parsed cron field: the set of matching values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    values: Vec<u32>,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// A five-field cron expression: minute, hour, day-of-month, month,
/// day-of-week (0 or 7 = Sunday).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::WrongFieldCount);
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_dow_field(fields[4])?,
        })
    }

    /// Whether the expression matches the given instant's minute.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<Field, ScheduleError> {
    let mut values = Vec::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| ScheduleError::BadField(part.to_string()))?;
                if step == 0 {
                    return Err(ScheduleError::BadField(part.to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| ScheduleError::BadField(part.to_string()))?;
            let b: u32 = b.parse().map_err(|_| ScheduleError::BadField(part.to_string()))?;
            (a, b)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| ScheduleError::BadField(part.to_string()))?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            return Err(ScheduleError::OutOfRange(hi.max(lo)));
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    values.sort_unstable();
    values.dedup();
    Ok(Field { values })
}

fn parse_dow_field(raw: &str) -> Result<Field, ScheduleError> {
    // Accept 0-7 with 7 folded onto Sunday.
    let mut field = parse_field(raw, 0, 7)?;
    if field.values.contains(&7) {
        field.values.retain(|v| *v != 7);
        if !field.values.contains(&0) {
            field.values.insert(0, 0);
        }
    }
    Ok(field)
}

/// Validate a schedule at task-creation time.
pub fn validate_schedule(schedule: &TaskSchedule) -> Result<(), ScheduleError> {
    match schedule {
        TaskSchedule::At { .. } => Ok(()),
        TaskSchedule::Every { every_ms } => {
            if *every_ms < MIN_EVERY_MS {
                Err(ScheduleError::PeriodTooShort)
            } else {
                Ok(())
            }
        }
        TaskSchedule::Cron { expr } => CronExpr::parse(expr).map(|_| ()),
    }
}

/// Whether a task is due at `now` given when it last ran.
pub fn is_due(schedule: &TaskSchedule, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match schedule {
        TaskSchedule::At { at } => last_run_at.is_none() && now >= *at,
        TaskSchedule::Every { every_ms } => match last_run_at {
            None => true,
            Some(last) => {
                now.signed_duration_since(last).num_milliseconds() >= *every_ms as i64
            }
        },
        TaskSchedule::Cron { expr } => {
            let Ok(parsed) = CronExpr::parse(expr) else {
                return false;
            };
            if !parsed.matches(now) {
                return false;
            }
            // At most one firing per matching minute.
            match last_run_at {
                None => true,
                Some(last) => now.signed_duration_since(last).num_seconds() >= 60
                    || last.minute() != now.minute(),
            }
        }
    }
}
