//! Cron expression handling: alias normalization, timezone parsing and
//! next-occurrence computation on top of `croner`.

use chrono::{DateTime, FixedOffset, Utc};

use super::SchedulerError;

// ---------------------------------------------------------------------------
// Human-readable schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a standard 5-field cron expression.
///
/// Supported aliases (case-insensitive):
/// - "every N minutes"     -> "*/N * * * *"
/// - "every N hours"       -> "0 */N * * *"
/// - "every minute"        -> "* * * * *"
/// - "every hour", "hourly" -> "0 * * * *"
/// - "every day", "daily"  -> "0 0 * * *"
/// - "every day at HH:MM"  -> "MM HH * * *"
/// - "weekly"              -> "0 0 * * 0"
///
/// Five whitespace-separated fields pass through unchanged (validated later
/// by [`CronSchedule::parse`]). Second-level schedules are rejected.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let invalid = || SchedulerError::InvalidSchedule(input.to_string());

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() == 5 && !trimmed.to_lowercase().starts_with("every") {
        return Ok(fields.join(" "));
    }
    if fields.len() == 6 && !trimmed.to_lowercase().starts_with("every") {
        return Err(SchedulerError::InvalidSchedule(format!(
            "'{trimmed}': seconds field is not supported, use 5 fields"
        )));
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("* * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 * * *".to_string()),
        "every week" | "weekly" => return Ok("0 0 * * 0".to_string()),
        _ => {}
    }

    let Some(rest) = lower.strip_prefix("every ") else {
        return Err(SchedulerError::InvalidSchedule(format!(
            "unrecognized schedule format: '{trimmed}'"
        )));
    };

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour < 24 && minute < 60 {
            return Ok(format!("{minute} {hour} * * *"));
        }
        return Err(invalid());
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [count, unit] = words.as_slice() else {
        return Err(invalid());
    };
    let n: u32 = count.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "interval must be > 0".to_string(),
        ));
    }
    match unit.trim_end_matches('s') {
        "minute" if n < 60 => Ok(format!("*/{n} * * * *")),
        "hour" if n < 24 => Ok(format!("0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

/// Parse "UTC" (or "Z", "GMT", "Etc/UTC") or a fixed offset such as
/// "+05:30", "-0800" or "+02".
pub fn parse_timezone(tz: &str) -> Result<FixedOffset, SchedulerError> {
    let tz = tz.trim();
    let invalid = || SchedulerError::InvalidTimezone(tz.to_string());

    if tz.is_empty() || ["utc", "z", "gmt", "etc/utc"].contains(&tz.to_lowercase().as_str()) {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, digits) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => digits.split_at(2),
        None if digits.len() <= 2 => (digits, "0"),
        None => return Err(invalid()),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

// ---------------------------------------------------------------------------
// CronSchedule
// ---------------------------------------------------------------------------

/// A validated cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    cron: croner::Cron,
    offset: FixedOffset,
}

impl CronSchedule {
    /// Normalize `schedule`, parse it and bind it to `timezone`.
    pub fn parse(schedule: &str, timezone: &str) -> Result<Self, SchedulerError> {
        let expr = normalize_schedule(schedule)?;
        let cron = expr
            .parse::<croner::Cron>()
            .map_err(|e| SchedulerError::InvalidSchedule(format!("'{schedule}': {e}")))?;
        let offset = parse_timezone(timezone)?;
        Ok(Self { expr, cron, offset })
    }

    /// The normalized 5-field expression.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron
            .iter_after(after.with_timezone(&self.offset))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// The next `count` occurrences after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.cron
            .iter_after(after.with_timezone(&self.offset))
            .take(count)
            .map(|at| at.with_timezone(&Utc))
            .collect()
    }

    /// Occurrences in the open interval `(from, to)`.
    pub fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.cron
            .iter_after(from.with_timezone(&self.offset))
            .map(|at| at.with_timezone(&Utc))
            .take_while(|at| *at < to)
            .collect()
    }
}

/// Preview the next `count` fire times of `schedule` in `timezone`.
pub fn next_runs(
    schedule: &str,
    timezone: &str,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    Ok(CronSchedule::parse(schedule, timezone)?.upcoming(Utc::now(), count))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
