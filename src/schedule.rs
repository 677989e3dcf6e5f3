//! Read-only view of the automatic backup schedule
//!
//! Schedules are owned by the system cron daemon; this module only reads the
//! installed entry and computes when it fires next.

use crate::{Error, Result};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cron file installed for the backup job
pub const DEFAULT_CRON_FILE: &str = "/etc/cron.d/homeserver-backup";

/// Snapshot of the automatic trigger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub active: bool,
    pub expression: Option<String>,
    pub next_run: Option<DateTime<Local>>,
}

impl ScheduleInfo {
    pub fn inactive() -> Self {
        Self {
            active: false,
            expression: None,
            next_run: None,
        }
    }
}

/// Source of schedule status
pub trait ScheduleStatus: Send + Sync {
    fn status(&self) -> ScheduleInfo;
}

/// Reads the cron.d entry for the backup job
#[derive(Debug, Clone)]
pub struct CronFileSchedule {
    path: PathBuf,
}

impl CronFileSchedule {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First five-field expression followed by a command
    pub fn read_expression(&self) -> Option<String> {
        let content = fs::read_to_string(&self.path).ok()?;
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .find(|parts| parts.len() >= 6)
            .map(|parts| parts[..5].join(" "))
    }
}

impl Default for CronFileSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_CRON_FILE)
    }
}

impl ScheduleStatus for CronFileSchedule {
    fn status(&self) -> ScheduleInfo {
        let Some(expression) = self.read_expression() else {
            debug!("No backup schedule found in {}", self.path.display());
            return ScheduleInfo::inactive();
        };

        let next_run = match CronExpression::parse(&expression) {
            Ok(cron) => cron.next_run(Local::now()),
            Err(e) => {
                debug!("Unparseable schedule '{}': {}", expression, e);
                None
            }
        };

        ScheduleInfo {
            active: true,
            expression: Some(expression),
            next_run,
        }
    }
}

/// Fixed schedule status
#[derive(Debug, Clone)]
pub struct StaticSchedule(pub ScheduleInfo);

impl ScheduleStatus for StaticSchedule {
    fn status(&self) -> ScheduleInfo {
        self.0.clone()
    }
}

/// Parsed five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days: Vec<bool>,
    months: Vec<bool>,
    weekdays: Vec<bool>,
    days_restricted: bool,
    weekdays_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::config(format!(
                "cron expression needs 5 fields, got {}: '{}'",
                fields.len(),
                expression
            )));
        }

        let mut weekdays = parse_field(fields[4], 0, 7)?;
        if weekdays[7] {
            weekdays[0] = true;
        }
        weekdays.truncate(7);

        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            weekdays,
            days_restricted: fields[2] != "*",
            weekdays_restricted: fields[4] != "*",
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days[date.day() as usize];
        let dow = self.weekdays[date.weekday().num_days_from_sunday() as usize];
        match (self.days_restricted, self.weekdays_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`, searched up to five years ahead
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = after + Duration::days(366 * 5);

        while t <= limit {
            if !self.months[t.month() as usize] {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours[t.hour() as usize] {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes[t.minute() as usize] {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// Next run in local time
    pub fn next_run(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut naive = after.naive_local();
        // Skip minutes that fall into a DST gap
        for _ in 0..4 {
            let next = self.next_after(naive)?;
            if let Some(local) = Local.from_local_datetime(&next).earliest() {
                return Some(local);
            }
            naive = next;
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<bool>> {
    let mut set = vec![false; max as usize + 1];
    let invalid = |reason: &str| Error::config(format!("invalid cron field '{}': {}", field, reason));

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid("bad range start"))?;
            let b: u32 = b.parse().map_err(|_| invalid("bad range end"))?;
            (a, b)
        } else {
            let value: u32 = range.parse().map_err(|_| invalid("not a number"))?;
            if part.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start < min || end > max || start > end {
            return Err(invalid("value out of range"));
        }
        for value in (start..=end).step_by(step as usize) {
            set[value as usize] = true;
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_daily_at_two() {
        let cron = CronExpression::parse("0 2 * * *").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 10, 1, 30)), Some(at(2024, 3, 10, 2, 0)));
        assert_eq!(cron.next_after(at(2024, 3, 10, 2, 0)), Some(at(2024, 3, 11, 2, 0)));
        assert_eq!(cron.next_after(at(2024, 12, 31, 23, 59)), Some(at(2025, 1, 1, 2, 0)));
    }

    #[test]
    fn test_steps_lists_and_ranges() {
        let cron = CronExpression::parse("*/15 9-17 * * 1-5").unwrap();
        // 2024-03-09 is a Saturday
        assert_eq!(cron.next_after(at(2024, 3, 9, 12, 0)), Some(at(2024, 3, 11, 9, 0)));
        assert_eq!(cron.next_after(at(2024, 3, 11, 9, 0)), Some(at(2024, 3, 11, 9, 15)));

        let cron = CronExpression::parse("30 4 1,15 * *").unwrap();
        assert_eq!(cron.next_after(at(2024, 2, 2, 0, 0)), Some(at(2024, 2, 15, 4, 30)));
    }

    #[test]
    fn test_sunday_as_seven() {
        let cron = CronExpression::parse("0 0 * * 7").unwrap();
        // 2024-03-10 is a Sunday
        assert_eq!(cron.next_after(at(2024, 3, 8, 0, 0)), Some(at(2024, 3, 10, 0, 0)));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronExpression::parse("0 2 * *").is_err());
        assert!(CronExpression::parse("61 2 * * *").is_err());
        assert!(CronExpression::parse("*/0 2 * * *").is_err());
        assert!(CronExpression::parse("a 2 * * *").is_err());
    }

    #[test]
    fn test_impossible_date_has_no_next_run() {
        let cron = CronExpression::parse("0 0 31 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_cron_file_status() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("homeserver-backup");
        fs::write(
            &path,
            "# HOMESERVER Backup Cron Job\n# Schedule: 0 2 * * *\n0 2 * * * www-data /usr/bin/homeserver-backup backup\n",
        )?;

        let status = CronFileSchedule::new(&path).status();
        assert!(status.active);
        assert_eq!(status.expression.as_deref(), Some("0 2 * * *"));
        assert!(status.next_run.is_some());

        let missing = CronFileSchedule::new(temp.path().join("absent")).status();
        assert_eq!(missing, ScheduleInfo::inactive());
        Ok(())
    }
}
