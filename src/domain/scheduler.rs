//! Restart scheduler: on every tick, dispatch a restart for each enabled
//! whitelist entry whose interval has elapsed since its last restart.
//!
//! Dispatch is fire-and-forget; the executor owns completion. Each entry is
//! evaluated in isolation so one bad target never stalls the tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::audit::AuditLog;
use super::executor::{LifecycleExecutor, Operation};
use super::types::*;
use super::whitelist::WhitelistStore;

pub const SCHEDULER_ACTOR: &str = "scheduler";

/// What a tick decides for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Dispatch,
    NotDue { next_due: DateTime<Utc> },
    Disabled,
}

/// When the entry is next due. `None` means it has never been restarted
/// and is due immediately.
pub fn next_due(
    entry: &WhitelistEntry,
    last_restart: Option<DateTime<Utc>>,
    default_interval_hours: u32,
) -> Option<DateTime<Utc>> {
    last_restart.map(|last| last + entry.interval(default_interval_hours))
}

pub fn evaluate(
    entry: &WhitelistEntry,
    last_restart: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default_interval_hours: u32,
) -> Decision {
    if !entry.enabled {
        return Decision::Disabled;
    }
    match next_due(entry, last_restart, default_interval_hours) {
        Some(next_due) if now < next_due => Decision::NotDue { next_due },
        _ => Decision::Dispatch,
    }
}

enum Step {
    Dispatched(i64),
    Held(Decision),
}

/// Counts for one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub dispatched: Vec<i64>,
    pub not_due: usize,
    pub disabled: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct RestartScheduler {
    whitelist: Arc<WhitelistStore>,
    audit: Arc<AuditLog>,
    executor: Arc<LifecycleExecutor>,
    default_interval_hours: u32,
}

impl RestartScheduler {
    pub fn new(
        whitelist: Arc<WhitelistStore>,
        audit: Arc<AuditLog>,
        executor: Arc<LifecycleExecutor>,
        default_interval_hours: u32,
    ) -> Self {
        Self {
            whitelist,
            audit,
            executor,
            default_interval_hours,
        }
    }

    /// Evaluate every entry once. Only a failure to read the whitelist
    /// itself fails the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        for entry in self.whitelist.list()? {
            match self.tick_entry(&entry, now).await {
                Ok(Step::Dispatched(log_id)) => report.dispatched.push(log_id),
                Ok(Step::Held(Decision::NotDue { .. })) => report.not_due += 1,
                Ok(Step::Held(_)) => report.disabled += 1,
                Err(Error::InFlight { .. }) => {
                    debug!(entry = entry.id, target = %entry.target, "restart already in flight, skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(entry = entry.id, target = %entry.target, error = %e, "scheduled restart not dispatched");
                    report.errors += 1;
                }
            }
        }
        if !report.dispatched.is_empty() || report.errors > 0 {
            info!(
                dispatched = report.dispatched.len(),
                skipped = report.skipped,
                errors = report.errors,
                "scheduler tick"
            );
        }
        Ok(report)
    }

    async fn tick_entry(&self, entry: &WhitelistEntry, now: DateTime<Utc>) -> Result<Step> {
        let last = self.audit.last_restart(&entry.target)?;
        let decision = evaluate(entry, last, now, self.default_interval_hours);
        if decision != Decision::Dispatch {
            return Ok(Step::Held(decision));
        }

        if self.executor.is_in_flight(&entry.target) || self.audit.pending_for(&entry.target)?.is_some() {
            return Err(Error::InFlight {
                target: entry.target.key(),
            });
        }
        // the entry may have been disabled or removed since the list was read
        match self.whitelist.get(entry.id) {
            Ok(current) if current.enabled => {}
            Ok(_) | Err(Error::NotFound { .. }) => return Ok(Step::Held(Decision::Disabled)),
            Err(e) => return Err(e),
        }

        let log = self
            .executor
            .execute(
                Operation::Restart(entry.target.clone()),
                SCHEDULER_ACTOR,
                TriggerType::Auto,
            )
            .await?;
        Ok(Step::Dispatched(log.id))
    }

    /// Earliest next-due time over enabled entries. Entries never restarted
    /// count as due `now`.
    pub fn next_restart_time(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for entry in self.whitelist.list()?.iter().filter(|e| e.enabled) {
            let last = self.audit.last_restart(&entry.target)?;
            let due = next_due(entry, last, self.default_interval_hours).unwrap_or(now);
            earliest = Some(earliest.map_or(due, |e| e.min(due)));
        }
        Ok(earliest)
    }

    /// Tick every `period` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "restart scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("restart scheduler stopped");
    }
}
