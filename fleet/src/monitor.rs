//! Scheduled health monitoring for `fleet watchdog`.
//!
//! Health is observed by polling: each tick runs `check` for every
//! non-terminal job (or one job with `--job`). A stalled job waits out its
//! exponential backoff and is then restarted, or failed with
//! `retry_exhausted` once the retry ceiling is reached.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::core::budget::{backoff_delay, can_retry};
use crate::core::types::{HealthState, JobState, ReasonCode};
use crate::orchestrator::Orchestrator;

/// Name of the fleet-wide watchdog singleton lock.
pub const WATCHDOG_LOCK: &str = "watchdog";

/// Pause between ticks. Tests substitute a recording fake.
pub trait Sleep {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleep;

impl Sleep for ThreadSleep {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Whether the scheduled callback wants another tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Stop,
}

/// Reason a scheduled loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleStop {
    /// The callback asked to stop.
    Done,
    MaxTicks,
}

/// Call `tick` every `interval` until it returns [`Tick::Stop`], `max_ticks`
/// ticks have run, or it fails. The first tick runs immediately.
pub fn run_every<S: Sleep, F: FnMut(u32) -> Result<Tick>>(
    interval: Duration,
    max_ticks: Option<u32>,
    sleeper: &S,
    mut tick: F,
) -> Result<(u32, ScheduleStop)> {
    let mut ticks = 0u32;
    loop {
        ticks += 1;
        if tick(ticks)? == Tick::Stop {
            return Ok((ticks, ScheduleStop::Done));
        }
        if max_ticks.is_some_and(|max| ticks >= max) {
            return Ok((ticks, ScheduleStop::MaxTicks));
        }
        sleeper.sleep(interval);
    }
}

/// What the watchdog did for one job on one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum WatchAction {
    Observed,
    RetryScheduled { at: DateTime<Utc> },
    Waiting { until: DateTime<Utc> },
    Restarted { retry_count: u32 },
    Exhausted,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchReport {
    pub id: String,
    pub health: Option<HealthState>,
    pub action: WatchAction,
}

#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    /// Watch one job and exit when it becomes terminal.
    pub job: Option<String>,
    pub interval: Duration,
    pub max_ticks: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogOutcome {
    pub ticks: u32,
    pub stop: ScheduleStop,
}

/// Run the watchdog loop. `on_tick` receives every tick's reports.
///
/// Holds a singleton lock for the duration (fleet-wide, or per job with
/// `--job`), so a second watchdog fails with `LockContention`.
pub fn run_watchdog<S: Sleep, F: FnMut(&[WatchReport])>(
    orchestrator: &Orchestrator,
    options: &WatchdogOptions,
    sleeper: &S,
    mut on_tick: F,
) -> Result<WatchdogOutcome> {
    let lock_name = match &options.job {
        Some(id) => format!("{WATCHDOG_LOCK}-{id}"),
        None => WATCHDOG_LOCK.to_string(),
    };
    let _singleton = orchestrator.locks().try_lock_singleton(&lock_name)?;
    if let Some(id) = &options.job {
        orchestrator.record(id)?;
        orchestrator
            .store()
            .write_monitor_pid(id, std::process::id())?;
    }

    let result = run_every(options.interval, options.max_ticks, sleeper, |n| {
        let ids = match &options.job {
            Some(id) => vec![id.clone()],
            None => orchestrator.active_ids()?,
        };
        let reports = watch_tick(orchestrator, &ids, Utc::now());
        info!(tick = n, jobs = reports.len(), "watchdog tick");
        on_tick(&reports);
        let single_job_done = options.job.is_some()
            && reports
                .iter()
                .all(|r| matches!(r.health, Some(HealthState::Terminal(_) | HealthState::Dead)));
        Ok(if single_job_done { Tick::Stop } else { Tick::Continue })
    });

    if let Some(id) = &options.job
        && let Err(err) = orchestrator.store().clear_monitor_pid(id)
    {
        warn!(err = %format!("{err:#}"), "cannot clear monitor pid");
    }
    let (ticks, stop) = result?;
    Ok(WatchdogOutcome { ticks, stop })
}

/// One pass over `ids`. Per-job failures become [`WatchAction::Error`]
/// reports so one broken job cannot starve the rest.
pub fn watch_tick(orchestrator: &Orchestrator, ids: &[String], now: DateTime<Utc>) -> Vec<WatchReport> {
    ids.iter()
        .map(|id| match watch_job(orchestrator, id, now) {
            Ok(report) => report,
            Err(err) => {
                warn!(job_id = %id, err = %format!("{err:#}"), "watchdog check failed");
                WatchReport {
                    id: id.clone(),
                    health: None,
                    action: WatchAction::Error {
                        message: format!("{err:#}"),
                    },
                }
            }
        })
        .collect()
}

fn watch_job(orchestrator: &Orchestrator, id: &str, now: DateTime<Utc>) -> Result<WatchReport> {
    let health = orchestrator.check(id)?;
    let report = |action| WatchReport {
        id: id.to_string(),
        health: Some(health),
        action,
    };
    if health != HealthState::Stalled {
        return Ok(report(WatchAction::Observed));
    }

    let jobs = &orchestrator.config().jobs;
    let record = orchestrator.record(id)?;
    if !can_retry(record.retry_count, jobs.retry_ceiling) {
        let outcome = orchestrator.finalize(id, Some(ReasonCode::RetryExhausted))?;
        warn!(job_id = id, state = %outcome.state, "retries exhausted");
        return Ok(WatchReport {
            id: id.to_string(),
            health: Some(HealthState::Terminal(JobState::Failed)),
            action: WatchAction::Exhausted,
        });
    }

    match record.next_retry_at {
        None => {
            let delay = backoff_delay(
                Duration::from_secs(jobs.backoff_base_secs),
                Duration::from_secs(jobs.backoff_max_secs),
                record.retry_count,
            );
            let at = now + chrono::Duration::from_std(delay).context("backoff out of range")?;
            orchestrator.schedule_retry(id, at)?;
            info!(job_id = id, %at, "restart scheduled");
            Ok(report(WatchAction::RetryScheduled { at }))
        }
        Some(at) if now >= at => {
            let handle = orchestrator.restart(id)?;
            Ok(report(WatchAction::Restarted {
                retry_count: handle.retry_count,
            }))
        }
        Some(until) => Ok(report(WatchAction::Waiting { until })),
    }
}
