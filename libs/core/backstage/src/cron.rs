//! Cron schedules for recurring tasks.
//!
//! Five-field expressions (`minute hour day-of-month month day-of-week`)
//! with lists, ranges, steps, and wildcards. `CronSchedule::next_after` is a
//! pure function over the parsed fields; the `CronScheduler` sleeps until
//! the nearest due schedule and enqueues the matching tasks. Several
//! scheduler processes may run at once; duplicate fires are bounded by the
//! minute granularity and callers who need exactly-one can add a dedup key.

use crate::error::BackstageError;
use crate::producer::{EnqueueOptions, Producer};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
}

impl CronSchedule {
    /// Parse a five-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, BackstageError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(BackstageError::InvalidCron(format!(
                "expected 5 fields, got {}",
                parts.len()
            )));
        }

        Ok(Self {
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days_of_month: parse_field(parts[2], 1, 31)?,
            months: parse_field(parts[3], 1, 12)?,
            days_of_week: parse_field(parts[4], 0, 6)?,
        })
    }

    /// Whether the schedule matches a given instant (minute granularity).
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.days_of_month.contains(&t.day())
            && self.months.contains(&t.month())
            && self.days_of_week.contains(&t.weekday().num_days_from_sunday())
    }

    /// The next matching instant strictly after `after`, scanning at most
    /// one year ahead.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut next = after
            .duration_trunc(ChronoDuration::minutes(1))
            .unwrap_or(after)
            + ChronoDuration::minutes(1);

        for _ in 0..(366 * 24 * 60) {
            if self.matches(next) {
                return Some(next);
            }
            next += ChronoDuration::minutes(1);
        }

        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, BackstageError> {
    let mut values = std::collections::BTreeSet::new();

    for part in field.split(',') {
        if part == "*" {
            values.extend(min..=max);
        } else if let Some((base, step)) = part.split_once('/') {
            let step: u32 = step
                .parse()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| BackstageError::InvalidCron(format!("invalid step: {}", part)))?;

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((lo, hi)) = base.split_once('-') {
                (parse_value(lo)?, parse_value(hi)?)
            } else {
                (parse_value(base)?, max)
            };

            values.extend((start..=end).step_by(step as usize));
        } else if let Some((lo, hi)) = part.split_once('-') {
            values.extend(parse_value(lo)?..=parse_value(hi)?);
        } else {
            values.insert(parse_value(part)?);
        }
    }

    for v in &values {
        if *v < min || *v > max {
            return Err(BackstageError::InvalidCron(format!(
                "value {} out of range [{}-{}]",
                v, min, max
            )));
        }
    }

    Ok(values.into_iter().collect())
}

fn parse_value(s: &str) -> Result<u32, BackstageError> {
    s.parse()
        .map_err(|_| BackstageError::InvalidCron(format!("invalid value: {}", s)))
}

/// A recurring task definition.
#[derive(Debug, Clone)]
pub struct CronTask {
    pub expression: String,
    pub task_name: String,
    /// Target custom queue; defaults to the default priority stream.
    pub queue: Option<String>,
    schedule: CronSchedule,
}

impl CronTask {
    pub fn new(expression: &str, task_name: impl Into<String>) -> Result<Self, BackstageError> {
        Ok(Self {
            schedule: CronSchedule::parse(expression)?,
            expression: expression.to_string(),
            task_name: task_name.into(),
            queue: None,
        })
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }
}

/// Enqueues recurring tasks when their schedules come due.
pub struct CronScheduler {
    producer: Producer,
    tasks: Vec<CronTask>,
}

impl CronScheduler {
    pub fn new(producer: Producer, tasks: Vec<CronTask>) -> Self {
        Self { producer, tasks }
    }

    /// Run the scheduler until shutdown: sleep until the nearest schedule is
    /// due, enqueue every task due at that instant, repeat.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BackstageError> {
        if self.tasks.is_empty() {
            warn!("No cron schedules configured");
            return Ok(());
        }

        info!(tasks = self.tasks.len(), "Starting cron scheduler");
        let mut upcoming: Vec<usize> = Vec::new();

        while !*shutdown.borrow() {
            for &idx in &upcoming {
                self.fire(&self.tasks[idx]).await;
            }

            let now = Utc::now();
            let mut min_delay = ChronoDuration::hours(24);
            upcoming.clear();

            for (idx, task) in self.tasks.iter().enumerate() {
                let Some(next) = task.schedule.next_after(now) else {
                    continue;
                };
                let delay = next - now;
                if delay < min_delay {
                    min_delay = delay;
                    upcoming = vec![idx];
                } else if delay == min_delay {
                    upcoming.push(idx);
                }
            }

            let sleep = min_delay.to_std().unwrap_or(Duration::from_secs(60));
            debug!(sleep_secs = sleep.as_secs(), "Sleeping until next schedule");

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Cron scheduler stopped");
        Ok(())
    }

    async fn fire(&self, task: &CronTask) {
        let mut opts = EnqueueOptions::new();
        if let Some(queue) = &task.queue {
            opts = opts.with_queue(queue.clone());
        }

        match self
            .producer
            .enqueue(&task.task_name, &serde_json::Value::Null, opts)
            .await
        {
            Ok(_) => info!(task = %task.task_name, "Enqueued scheduled task"),
            Err(e) => warn!(task = %task.task_name, error = %e, "Scheduled enqueue failed"),
        }
    }
}
