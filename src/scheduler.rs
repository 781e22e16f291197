//! Cron-style task schedule and the foreground run loop
//!
//! Schedules are "minute hour" pairs. Each field accepts `*`, `*/n`, a
//! number, a range `a-b`, or a comma list of those.

use anyhow::Context;
use chrono::{DateTime, DurationRound, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TrackError};

/// Schedules for the three periodic tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub emails: String,
    pub progress: String,
    pub paths: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            emails: "0 8".to_string(),
            progress: "*/30 *".to_string(),
            paths: "15 */4".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Any,
    Step(u32),
    Value(u32),
    Range(u32, u32),
}

impl Part {
    fn matches(&self, value: u32) -> bool {
        match *self {
            Part::Any => true,
            Part::Step(step) => value % step == 0,
            Part::Value(v) => value == v,
            Part::Range(lo, hi) => (lo..=hi).contains(&value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field(Vec<Part>);

impl Field {
    fn parse(text: &str, max: u32) -> Result<Self> {
        let invalid = || TrackError::InvalidSchedule(format!("bad field '{}' (0-{})", text, max));
        let number = |s: &str| -> Result<u32> {
            let n: u32 = s.parse().map_err(|_| invalid())?;
            if n > max {
                return Err(invalid());
            }
            Ok(n)
        };

        let mut parts = Vec::new();
        for piece in text.split(',') {
            let part = if piece == "*" {
                Part::Any
            } else if let Some(step) = piece.strip_prefix("*/") {
                let step = number(step)?;
                if step == 0 {
                    return Err(invalid());
                }
                Part::Step(step)
            } else if let Some((lo, hi)) = piece.split_once('-') {
                let (lo, hi) = (number(lo)?, number(hi)?);
                if lo > hi {
                    return Err(invalid());
                }
                Part::Range(lo, hi)
            } else {
                Part::Value(number(piece)?)
            };
            parts.push(part);
        }
        Ok(Field(parts))
    }

    fn matches(&self, value: u32) -> bool {
        self.0.iter().any(|p| p.matches(value))
    }
}

/// A parsed "minute hour" schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    minute: Field,
    hour: Field,
}

impl FromStr for Schedule {
    type Err = TrackError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [minute, hour] = fields.as_slice() else {
            return Err(TrackError::InvalidSchedule(format!(
                "expected \"minute hour\", got '{}'",
                s
            )));
        };
        Ok(Schedule {
            minute: Field::parse(minute, 59)?,
            hour: Field::parse(hour, 23)?,
        })
    }
}

impl Schedule {
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute()) && self.hour.matches(at.hour())
    }
}

/// The periodic tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    SendEmails,
    UpdateProgress,
    AssignPaths,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::SendEmails => "send-emails",
            Task::UpdateProgress => "update-progress",
            Task::AssignPaths => "assign-paths",
        };
        f.write_str(name)
    }
}

pub struct Scheduler {
    entries: Vec<(Task, Schedule)>,
}

impl Scheduler {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            entries: vec![
                (Task::SendEmails, config.emails.parse()?),
                (Task::UpdateProgress, config.progress.parse()?),
                (Task::AssignPaths, config.paths.parse()?),
            ],
        })
    }

    /// Tasks due in the minute containing `at`, in declaration order
    pub fn due(&self, at: DateTime<Utc>) -> Vec<Task> {
        self.entries
            .iter()
            .filter(|(_, schedule)| schedule.is_due(at))
            .map(|(task, _)| *task)
            .collect()
    }

    /// Run until Ctrl-C, firing each due task once per matching minute
    ///
    /// A failing task is logged and never stops the loop.
    pub fn run<F>(&self, mut run_task: F) -> anyhow::Result<()>
    where
        F: FnMut(Task, DateTime<Utc>) -> Result<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();

        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            r.store(false, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;

        info!("Scheduler started");
        let mut last_minute: Option<DateTime<Utc>> = None;

        while running.load(Ordering::SeqCst) {
            let minute = Utc::now()
                .duration_trunc(TimeDelta::minutes(1))
                .context("Failed to truncate clock")?;

            if last_minute != Some(minute) {
                last_minute = Some(minute);
                for task in self.due(minute) {
                    debug!("Running {}", task);
                    match run_task(task, minute) {
                        Ok(()) => {}
                        Err(e) if e.is_external() => warn!("Task {} failed: {}", task, e),
                        Err(e) => error!("Task {} failed: {}", task, e),
                    }
                }
            }

            std::thread::sleep(Duration::from_millis(500));
        }

        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 14, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_default_schedules() {
        let scheduler = Scheduler::from_config(&ScheduleConfig::default()).unwrap();
        assert_eq!(scheduler.due(at(8, 0)), vec![Task::SendEmails, Task::UpdateProgress]);
        assert_eq!(scheduler.due(at(4, 15)), vec![Task::AssignPaths]);
        assert_eq!(scheduler.due(at(5, 15)), Vec::<Task>::new());
        assert_eq!(scheduler.due(at(13, 30)), vec![Task::UpdateProgress]);
    }

    #[test]
    fn test_field_forms() {
        let schedule: Schedule = "5,10-12 */6".parse().unwrap();
        assert!(schedule.is_due(at(0, 5)));
        assert!(schedule.is_due(at(6, 11)));
        assert!(schedule.is_due(at(18, 12)));
        assert!(!schedule.is_due(at(7, 5)));
        assert!(!schedule.is_due(at(6, 13)));
    }

    #[test]
    fn test_invalid_schedules() {
        for bad in ["", "0", "0 8 *", "60 *", "* 24", "*/0 *", "a *", "9-3 *"] {
            assert!(
                matches!(bad.parse::<Schedule>(), Err(TrackError::InvalidSchedule(_))),
                "accepted '{}'",
                bad
            );
        }
    }

    #[test]
    fn test_bad_config_is_rejected() {
        let config = ScheduleConfig {
            paths: "whenever".to_string(),
            ..Default::default()
        };
        assert!(Scheduler::from_config(&config).is_err());
    }
}
