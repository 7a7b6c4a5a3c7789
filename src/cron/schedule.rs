//! Schedule specs and next-run computation.
//!
//! All times are Unix epoch milliseconds. `next_run_at` is a pure function of
//! the schedule and the current time; nothing here reads the clock.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronSchedule {
    /// Fire once at an absolute time.
    At {
        #[serde(rename = "atMs")]
        at_ms: i64,
    },
    /// Fire on a fixed interval counted from an anchor.
    Every {
        #[serde(rename = "everyMs")]
        every_ms: i64,
        #[serde(rename = "anchorMs")]
        anchor_ms: i64,
    },
    /// Fire on a 5-field cron expression evaluated in a timezone.
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

impl CronSchedule {
    /// The string tag used in the persisted `kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            CronSchedule::At { .. } => "at",
            CronSchedule::Every { .. } => "every",
            CronSchedule::Cron { .. } => "cron",
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, CronSchedule::At { .. })
    }

    /// Check the schedule is evaluable (valid interval, expression, timezone).
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            CronSchedule::At { .. } => Ok(()),
            CronSchedule::Every { every_ms, .. } => {
                if *every_ms <= 0 {
                    Err(ScheduleError::InvalidInterval(format!(
                        "interval must be positive, got {every_ms}ms"
                    )))
                } else {
                    Ok(())
                }
            }
            CronSchedule::Cron { expr, tz } => {
                parse_cron(expr)?;
                resolve_tz(tz.as_deref())?;
                Ok(())
            }
        }
    }
}

/// Compute the next run time for `schedule` at `now_ms`.
///
/// - `at`: the target time if it is still in the future, else `None`.
/// - `every`: the smallest `anchor + k * interval` with `k >= 1` that is
///   `>= now`; `anchor` itself if `now` precedes it. Missed intervals are
///   counted, not replayed.
/// - `cron`: the next matching instant strictly after `now` in the schedule's
///   timezone (UTC when unset).
pub fn next_run_at(schedule: &CronSchedule, now_ms: i64) -> Option<i64> {
    match schedule {
        CronSchedule::At { at_ms } => (*at_ms > now_ms).then_some(*at_ms),
        CronSchedule::Every {
            every_ms,
            anchor_ms,
        } => {
            if *every_ms <= 0 {
                return None;
            }
            if now_ms < *anchor_ms {
                return Some(*anchor_ms);
            }
            let elapsed = now_ms - anchor_ms;
            let intervals = ((elapsed + every_ms - 1) / every_ms).max(1);
            anchor_ms.checked_add(intervals.checked_mul(*every_ms)?)
        }
        CronSchedule::Cron { expr, tz } => {
            let parsed = parse_cron(expr).ok()?;
            let tz = resolve_tz(tz.as_deref()).ok()?;
            let now = Utc.timestamp_millis_opt(now_ms).single()?.with_timezone(&tz);
            parsed.after(&now).next().map(|dt| dt.timestamp_millis())
        }
    }
}

/// Resolve an IANA timezone name, defaulting to UTC.
pub fn resolve_tz(tz: Option<&str>) -> Result<Tz, ScheduleError> {
    match tz {
        None => Ok(chrono_tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| ScheduleError::UnknownTimezone(name.to_string())),
    }
}

/// Parse a standard 5-field cron expression (minute hour dom month dow).
///
/// The `cron` crate wants a leading seconds field and numbers weekdays from
/// Sunday = 1, so the expression is rewritten before parsing: seconds are
/// pinned to 0 and numeric weekdays (0-7, Sunday = 0 or 7) become names.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: format!("expected 5 fields, got {}", fields.len()),
        });
    }

    let dow = translate_weekdays(fields[4]).map_err(|reason| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason,
    })?;
    let full = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    );

    cron::Schedule::from_str(&full).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

const WEEKDAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

fn translate_weekdays(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = range
                .split('-')
                .map(weekday_token)
                .collect::<Result<Vec<_>, _>>()?
                .join("-");
            Ok(match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(items.join(","))
}

fn weekday_token(token: &str) -> Result<String, String> {
    if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
        let n: usize = token
            .parse()
            .map_err(|_| format!("bad weekday '{token}'"))?;
        WEEKDAY_NAMES
            .get(n)
            .map(|name| name.to_string())
            .ok_or_else(|| format!("weekday out of range: {n}"))
    } else {
        Ok(token.to_string())
    }
}
