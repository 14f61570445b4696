use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

/// Upper bound on missed fire times counted when planning a catch-up run.
const MAX_MISSED_SCAN: usize = 10_000;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    Cron { expr: String, reason: String },
    #[error("invalid interval `{0}` (expected `@every <n><s|m|h|d>`)")]
    Interval(String),
}

/// When a job fires: a six-field cron expression (UTC) or a fixed interval.
#[derive(Debug, Clone)]
pub enum Cadence {
    Cron { expr: String, schedule: Box<Schedule> },
    Every(Duration),
}

impl Cadence {
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Cron { schedule, .. } => schedule.after(&after).next(),
            Cadence::Every(interval) => Some(after + to_chrono(*interval)),
        }
    }

    /// Fire times strictly after `since` and not later than `until`, oldest first.
    fn fire_times_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> (usize, Option<DateTime<Utc>>) {
        match self {
            Cadence::Cron { schedule, .. } => {
                let mut count = 0;
                let mut latest = None;
                for at in schedule
                    .after(&since)
                    .take_while(|at| *at <= until)
                    .take(MAX_MISSED_SCAN)
                {
                    count += 1;
                    latest = Some(at);
                }
                (count, latest)
            }
            Cadence::Every(interval) => {
                let step = to_chrono(*interval);
                if step <= chrono::Duration::zero() || until <= since {
                    return (0, None);
                }
                let elapsed_ms = (until - since).num_milliseconds();
                let step_ms = step.num_milliseconds().max(1);
                let count = elapsed_ms / step_ms;
                if count <= 0 {
                    return (0, None);
                }
                let latest = until - chrono::Duration::milliseconds(elapsed_ms % step_ms);
                (usize::try_from(count).unwrap_or(usize::MAX), Some(latest))
            }
        }
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some(rest) = value.strip_prefix("@every") {
            return parse_interval(rest.trim())
                .map(Cadence::Every)
                .ok_or_else(|| CadenceError::Interval(value.to_string()));
        }
        let schedule = Schedule::from_str(value).map_err(|err| CadenceError::Cron {
            expr: value.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Cadence::Cron {
            expr: value.to_string(),
            schedule: Box::new(schedule),
        })
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Cron { expr, .. } => f.write_str(expr),
            Cadence::Every(interval) => write!(f, "@every {}s", interval.as_secs()),
        }
    }
}

fn parse_interval(raw: &str) -> Option<Duration> {
    let split = raw.find(|ch: char| !ch.is_ascii_digit())?;
    let (number, unit) = raw.split_at(split);
    let amount: u64 = number.parse().ok()?;
    if amount == 0 {
        return None;
    }
    let secs = match unit.trim() {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3_600,
        "d" => amount * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// What to do about fire times missed while the process was down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpPlan {
    pub missed: usize,
    pub latest_missed: Option<DateTime<Utc>>,
    /// True when exactly one coalesced run should execute now.
    pub run_now: bool,
}

/// Collapses every fire time missed since `last_run` into at most one run, and
/// discards it when the newest missed time is older than `grace`.
pub fn plan_catch_up(
    cadence: &Cadence,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> CatchUpPlan {
    let Some(last_run) = last_run else {
        return CatchUpPlan {
            missed: 0,
            latest_missed: None,
            run_now: false,
        };
    };
    let (missed, latest_missed) = cadence.fire_times_between(last_run, now);
    let run_now = latest_missed.is_some_and(|at| !is_misfire(at, now, grace));
    CatchUpPlan {
        missed,
        latest_missed,
        run_now,
    }
}

/// A fire time older than the grace window is discarded rather than run late.
pub fn is_misfire(scheduled_at: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    now - scheduled_at > to_chrono(grace)
}
