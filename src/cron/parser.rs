//! Free-text schedule parsing.
//!
//! Accepts three families of input and normalizes each into a
//! [`CronSchedule`] plus a human-readable description:
//! - intervals: `every 5 minutes`, `every hour`
//! - 5-field cron expressions: `*/15 9-17 * * 1-5`
//! - date/time phrases: `in 20 minutes`, `tomorrow at 9am`, `at 17:30`,
//!   `2026-11-02 08:00`, RFC 3339 timestamps
//!
//! Calendar phrases such as `every day at 9:00` or `every monday at 10am`
//! become cron expressions in the parser's timezone.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;

use super::schedule::{CronSchedule, parse_cron};
use crate::error::ScheduleError;

static EVERY_INTERVAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^every\s+(?:(\d+)\s*)?([a-z]+)$").expect("valid regex")
});

static EVERY_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:every\s+([a-z]+)|daily)\s+at\s+(.+)$").expect("valid regex")
});

static IN_RELATIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^in\s+(\d+)\s*([a-z]+)$").expect("valid regex"));

static DAY_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(today|tomorrow)\s*)?(?:at\s+)?(.+)?$").expect("valid regex")
});

static CLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$").expect("valid regex")
});

static CRON_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-z*/,\-?]+$").expect("valid regex"));

/// Hour used when a day is named without a time ("tomorrow").
const DEFAULT_HOUR: u32 = 9;

/// A normalized schedule with its display text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSchedule {
    pub schedule: CronSchedule,
    pub text: String,
}

/// Parses user-provided schedule text relative to a timezone.
#[derive(Debug, Clone)]
pub struct ScheduleParser {
    tz: Tz,
}

impl Default for ScheduleParser {
    fn default() -> Self {
        Self::new(chrono_tz::UTC)
    }
}

impl ScheduleParser {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Parse `input` into a schedule, evaluated at `now_ms`.
    pub fn parse(&self, input: &str, now_ms: i64) -> Result<ParsedSchedule, ScheduleError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(ScheduleError::Unrecognized(input.to_string()));
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return self.one_shot(dt.with_timezone(&Utc), now_ms, input);
        }

        let text = raw.to_lowercase();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

        if let Some(parsed) = self.parse_every_at(&text)? {
            return Ok(parsed);
        }
        if let Some(parsed) = self.parse_every_interval(&text, now_ms)? {
            return Ok(parsed);
        }
        if let Some(parsed) = self.parse_cron_expr(raw)? {
            return Ok(parsed);
        }
        if let Some(at) = self.parse_relative(&text, now_ms)? {
            return self.one_shot(at, now_ms, input);
        }
        if let Some(at) = self.parse_absolute(&text)? {
            return self.one_shot(at, now_ms, input);
        }
        if let Some(at) = self.parse_day_at(&text, now_ms)? {
            return self.one_shot(at, now_ms, input);
        }

        Err(ScheduleError::Unrecognized(input.to_string()))
    }

    fn parse_every_interval(
        &self,
        text: &str,
        now_ms: i64,
    ) -> Result<Option<ParsedSchedule>, ScheduleError> {
        let Some(caps) = EVERY_INTERVAL.captures(text) else {
            return Ok(None);
        };
        let Some(unit_ms) = unit_millis(&caps[2]) else {
            return Ok(None);
        };
        let count: i64 = match caps.get(1) {
            Some(n) => n
                .as_str()
                .parse()
                .map_err(|_| ScheduleError::InvalidInterval(text.to_string()))?,
            None => 1,
        };
        if count == 0 {
            return Err(ScheduleError::InvalidInterval(text.to_string()));
        }

        let every_ms = count
            .checked_mul(unit_ms)
            .ok_or_else(|| ScheduleError::InvalidInterval(text.to_string()))?;
        Ok(Some(ParsedSchedule {
            schedule: CronSchedule::Every {
                every_ms,
                anchor_ms: now_ms,
            },
            text: describe_interval(every_ms),
        }))
    }

    fn parse_every_at(&self, text: &str) -> Result<Option<ParsedSchedule>, ScheduleError> {
        let Some(caps) = EVERY_AT.captures(text) else {
            return Ok(None);
        };
        let (dow, label) = match caps.get(1).map(|m| m.as_str()) {
            None | Some("day") => ("*", "every day".to_string()),
            Some("weekday") => ("1-5", "every weekday".to_string()),
            Some(day) => match weekday_number(day) {
                Some(n) => (n, format!("every {day}")),
                None => return Ok(None),
            },
        };
        let Some(time) = parse_clock(caps[2].trim()) else {
            return Err(ScheduleError::Unrecognized(text.to_string()));
        };

        let expr = format!("{} {} * * {}", time.minute(), time.hour(), dow);
        parse_cron(&expr)?;
        Ok(Some(ParsedSchedule {
            text: format!("{label} at {} {}", time.format("%H:%M"), self.tz.name()),
            schedule: CronSchedule::Cron {
                expr,
                tz: self.tz_field(),
            },
        }))
    }

    fn parse_cron_expr(&self, raw: &str) -> Result<Option<ParsedSchedule>, ScheduleError> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        let looks_like_cron = fields.len() == 5
            && fields
                .iter()
                .all(|f| CRON_FIELD.is_match(&f.to_lowercase()))
            && fields.iter().any(|f| f.contains(['*', '/']) || f.parse::<u32>().is_ok());
        if !looks_like_cron {
            return Ok(None);
        }
        let expr = fields.join(" ");
        parse_cron(&expr)?;
        Ok(Some(ParsedSchedule {
            text: format!("cron {expr} ({})", self.tz.name()),
            schedule: CronSchedule::Cron {
                expr,
                tz: self.tz_field(),
            },
        }))
    }

    fn parse_relative(
        &self,
        text: &str,
        now_ms: i64,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let Some(caps) = IN_RELATIVE.captures(text) else {
            return Ok(None);
        };
        let Some(unit_ms) = unit_millis(&caps[2]) else {
            return Ok(None);
        };
        let count: i64 = caps[1]
            .parse()
            .map_err(|_| ScheduleError::InvalidInterval(text.to_string()))?;
        let at_ms = count
            .checked_mul(unit_ms)
            .and_then(|d| now_ms.checked_add(d))
            .ok_or_else(|| ScheduleError::InvalidInterval(text.to_string()))?;
        Ok(Utc.timestamp_millis_opt(at_ms).single())
    }

    fn parse_absolute(&self, text: &str) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%dt%H:%M", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
                return self.localize(naive, text).map(Some);
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            let naive = date.and_time(default_time());
            return self.localize(naive, text).map(Some);
        }
        Ok(None)
    }

    fn parse_day_at(
        &self,
        text: &str,
        now_ms: i64,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let Some(caps) = DAY_AT.captures(text) else {
            return Ok(None);
        };
        let day = caps.get(1).map(|m| m.as_str());
        let time = match caps.get(2) {
            Some(m) => match parse_clock(m.as_str().trim()) {
                Some(t) => t,
                None => return Ok(None),
            },
            None if day.is_some() => default_time(),
            None => return Ok(None),
        };

        let now_local = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .ok_or_else(|| ScheduleError::Unrecognized(text.to_string()))?
            .with_timezone(&self.tz);
        let today = now_local.date_naive();

        let date = match day {
            Some("tomorrow") => today + Duration::days(1),
            Some(_) => today,
            None => {
                let candidate = self.localize(today.and_time(time), text)?;
                if candidate.timestamp_millis() > now_ms {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
        };
        self.localize(date.and_time(time), text).map(Some)
    }

    fn one_shot(
        &self,
        at: DateTime<Utc>,
        now_ms: i64,
        input: &str,
    ) -> Result<ParsedSchedule, ScheduleError> {
        let at_ms = at.timestamp_millis();
        if at_ms <= now_ms {
            return Err(ScheduleError::InPast(input.trim().to_string()));
        }
        Ok(ParsedSchedule {
            schedule: CronSchedule::At { at_ms },
            text: format!(
                "once at {}",
                at.with_timezone(&self.tz).format("%Y-%m-%d %H:%M %Z")
            ),
        })
    }

    fn localize(&self, naive: NaiveDateTime, text: &str) -> Result<DateTime<Utc>, ScheduleError> {
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| ScheduleError::Unrecognized(format!("{text} (no such local time)")))
    }

    fn tz_field(&self) -> Option<String> {
        (self.tz != chrono_tz::UTC).then(|| self.tz.name().to_string())
    }
}

fn unit_millis(unit: &str) -> Option<i64> {
    let ms = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        "w" | "week" | "weeks" => 7 * 86_400_000,
        _ => return None,
    };
    Some(ms)
}

fn describe_interval(every_ms: i64) -> String {
    const UNITS: [(i64, &str); 5] = [
        (7 * 86_400_000, "week"),
        (86_400_000, "day"),
        (3_600_000, "hour"),
        (60_000, "minute"),
        (1_000, "second"),
    ];
    for (size, name) in UNITS {
        if every_ms % size == 0 {
            let n = every_ms / size;
            return if n == 1 {
                format!("every {name}")
            } else {
                format!("every {n} {name}s")
            };
        }
    }
    format!("every {every_ms}ms")
}

fn weekday_number(day: &str) -> Option<&'static str> {
    let day = day.strip_suffix("days").map_or(day, |stem| &day[..stem.len() + 3]);
    let n = match day {
        "sunday" | "sun" => "0",
        "monday" | "mon" => "1",
        "tuesday" | "tue" | "tues" => "2",
        "wednesday" | "wed" => "3",
        "thursday" | "thu" | "thurs" => "4",
        "friday" | "fri" => "5",
        "saturday" | "sat" => "6",
        _ => return None,
    };
    Some(n)
}

fn parse_clock(text: &str) -> Option<NaiveTime> {
    match text {
        "noon" => return NaiveTime::from_hms_opt(12, 0, 0),
        "midnight" => return NaiveTime::from_hms_opt(0, 0, 0),
        _ => {}
    }
    let caps = CLOCK.captures(text)?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
    match caps.get(3).map(|m| m.as_str()) {
        Some(meridiem) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            hour %= 12;
            if meridiem == "pm" {
                hour += 12;
            }
        }
        None if caps.get(2).is_none() => return None,
        None => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn default_time() -> NaiveTime {
    NaiveTime::from_hms_opt(DEFAULT_HOUR, 0, 0).unwrap_or(NaiveTime::MIN)
}
