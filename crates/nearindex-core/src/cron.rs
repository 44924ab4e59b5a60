//! Minimal cron schedule for block timestamp filters.
//!
//! Supports the classic five fields (`minute hour day-of-month month
//! day-of-week`) with `*`, lists, ranges, steps, three-letter month and
//! weekday names, and the `@hourly` / `@daily` / `@weekly` / `@monthly` /
//! `@yearly` shorthands. All times are UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::IndexerError;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Searching further than this many years ahead means the expression can
/// never fire (e.g. `0 0 30 2 *`).
const MAX_YEARS_AHEAD: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// The field was written as `*` (or `*/n`).
    wildcard: bool,
}

impl Field {
    fn contains(&self, v: u32) -> bool {
        self.bits & (1u64 << v) != 0
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, IndexerError> {
        let expanded = match expr.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };
        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(expr, "expected 5 fields"));
        }

        let mut day_of_week = parse_field(parts[4], 0, 7, Some(&DAY_NAMES), expr)?;
        // 7 is an alias for Sunday.
        if day_of_week.contains(7) {
            day_of_week.bits = (day_of_week.bits | 1) & !(1 << 7);
        }

        Ok(Self {
            source: expr.to_string(),
            minute: parse_field(parts[0], 0, 59, None, expr)?,
            hour: parse_field(parts[1], 0, 23, None, expr)?,
            day_of_month: parse_field(parts[2], 1, 31, None, expr)?,
            month: parse_field(parts[3], 1, 12, Some(&MONTH_NAMES), expr)?,
            day_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());
        // Both restricted: either may match. Otherwise the restricted one decides.
        match (self.day_of_month.wildcard, self.day_of_week.wildcard) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// The first trigger time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit_year = start.year() + MAX_YEARS_AHEAD;
        let mut t = start;

        while t.year() <= limit_year {
            if !self.month.contains(t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = Utc
                    .from_utc_datetime(&t.date_naive().and_hms_opt(0, 0, 0)?)
                    + Duration::days(1);
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn invalid(expr: &str, reason: &str) -> IndexerError {
    IndexerError::Configuration(format!("invalid cron expression '{expr}': {reason}"))
}

fn parse_value(s: &str, names: Option<&[&str]>, offset: u32, expr: &str) -> Result<u32, IndexerError> {
    if let Ok(v) = s.parse::<u32>() {
        return Ok(v);
    }
    names
        .and_then(|names| {
            names
                .iter()
                .position(|n| n.eq_ignore_ascii_case(s))
                .map(|i| i as u32 + offset)
        })
        .ok_or_else(|| invalid(expr, &format!("bad value '{s}'")))
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
    expr: &str,
) -> Result<Field, IndexerError> {
    // Month names start at 1, weekday names at 0.
    let name_offset = min;
    let mut bits = 0u64;
    let wildcard = field.starts_with('*');

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| invalid(expr, &format!("bad step '{s}'")))?;
                if step == 0 {
                    return Err(invalid(expr, "step must be positive"));
                }
                (r, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, names, name_offset, expr)?,
                parse_value(b, names, name_offset, expr)?,
            )
        } else {
            let v = parse_value(range, names, name_offset, expr)?;
            // `5/15` means "from 5 to the end, every 15".
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(expr, &format!("'{item}' out of range {min}-{max}")));
        }
        let mut v = lo;
        while v <= hi {
            bits |= 1u64 << v;
            v += step;
        }
    }

    Ok(Field { bits, wildcard })
}

// ─── CronCursor ──────────────────────────────────────────────────────────────

/// Mutable schedule position for one block filter instance.
///
/// The cursor advances on every evaluation, match or not, so the schedule
/// stays anchored to block time rather than to matched blocks.
#[derive(Debug, Clone)]
pub struct CronCursor {
    schedule: CronSchedule,
    next: Option<DateTime<Utc>>,
}

impl CronCursor {
    pub fn new(schedule: CronSchedule) -> Self {
        Self {
            schedule,
            next: None,
        }
    }

    /// The trigger time the next block must reach to match.
    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.next
    }

    /// Evaluate a block timestamp. The first evaluation only anchors the
    /// cursor and does not match.
    pub fn evaluate(&mut self, ts: DateTime<Utc>) -> bool {
        let matched = match self.next {
            Some(next) => ts >= next,
            None => false,
        };
        self.next = self.schedule.next_after(ts);
        if matched {
            tracing::debug!(
                timestamp = %ts,
                next = ?self.next,
                schedule = self.schedule.as_str(),
                "Block timestamp reached cron trigger"
            );
        }
        matched
    }
}
