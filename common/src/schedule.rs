// Cron expression parsing and next fire time calculation
//
// Accepts standard five-field expressions (`m h dom mon dow`) as well as the
// six- and seven-field Quartz forms with seconds (and years). Five-field
// expressions fire at second zero and number weekdays 0-7 with Sunday as 0 or
// 7; the Quartz forms use 1-7 with Sunday as 1. Evaluation is calendar-aware
// in the configured timezone, so weekly and monthly schedules fire correctly.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::errors::ValidationError;

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ValidationError> {
    let normalized = normalize_expression(expression)?;

    CronSchedule::from_str(&normalized).map_err(|e| ValidationError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Prepend a seconds field to five-field expressions and renumber their weekdays
fn normalize_expression(expression: &str) -> Result<String, ValidationError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = posix_day_of_week(expression, fields[4])?;
            Ok(format!("0 {} {}", fields[..4].join(" "), day_of_week))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ValidationError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 5, 6 or 7 fields, found {}", n),
        }),
    }
}

/// Rewrite a numeric POSIX day-of-week field (Sunday = 0 or 7) as an explicit
/// list in the cron crate's numbering (Sunday = 1). Wildcards and day names
/// mean the same in both and pass through unchanged.
fn posix_day_of_week(expression: &str, field: &str) -> Result<String, ValidationError> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let invalid = |reason: String| ValidationError::InvalidCronExpression {
        expression: expression.to_string(),
        reason,
    };
    let day = |token: &str| -> Result<u32, ValidationError> {
        match token.parse::<u32>() {
            Ok(day) if day <= 7 => Ok(day),
            _ => Err(invalid(format!("day of week '{}' is not in 0-7", token))),
        }
    };

    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => match step.parse::<u32>() {
                Ok(step) if step > 0 => (range, step),
                _ => return Err(invalid(format!("invalid step in '{}'", part))),
            },
            None => (part, 1),
        };

        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((first, last)) => (day(first)?, day(last)?),
            // `n/step` runs from n to the end of the week
            None if part.contains('/') => (day(range)?, 6),
            None => {
                let single = day(range)?;
                (single, single)
            }
        };
        if first > last {
            return Err(invalid(format!("descending day-of-week range '{}'", range)));
        }

        days.extend((first..=last).step_by(step as usize).map(|d| d % 7 + 1));
    }

    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// Next fire time strictly after `after`, evaluated in `timezone`
pub fn next_fire_time(
    schedule: &CronSchedule,
    timezone: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let reference_in_tz = after.with_timezone(&timezone);
    schedule
        .after(&reference_in_tz)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Parse a timezone name such as `UTC` or `Asia/Ho_Chi_Minh`
pub fn parse_timezone(name: &str) -> Result<Tz, ValidationError> {
    Tz::from_str(name.trim()).map_err(|e| ValidationError::InvalidFieldValue {
        field: "timezone".to_string(),
        reason: e.to_string(),
    })
}
