//! Audit log: append-only record of every lifecycle operation.
//!
//! Entries are opened `pending` and closed exactly once; nothing else
//! mutates or deletes them.

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::error::{Error, Result};

use super::store::Database;
use super::types::*;

pub const ORPHANED_MESSAGE: &str = "interrupted by daemon restart";

pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(&self, new: &NewLogEntry) -> Result<RestartLogEntry> {
        self.db.insert_log(new, Utc::now())
    }

    /// Close a pending entry. Closing twice is an internal error.
    pub fn complete(&self, id: i64, outcome: &Outcome) -> Result<RestartLogEntry> {
        match self.db.complete_log(id, outcome, Utc::now())? {
            Some(entry) => Ok(entry),
            None => {
                error!(log_id = id, "attempted to complete a log entry twice");
                Err(Error::Internal(format!(
                    "log entry {} is missing or already completed",
                    id
                )))
            }
        }
    }

    pub fn get(&self, id: i64) -> Result<RestartLogEntry> {
        self.db
            .get_log(id)?
            .ok_or_else(|| Error::not_found("log entry", id))
    }

    pub fn query(&self, filter: &LogFilter) -> Result<Vec<RestartLogEntry>> {
        self.db.query_logs(filter)
    }

    /// When the target was last restarted (attempted), by anyone.
    pub fn last_restart(&self, target: &Target) -> Result<Option<DateTime<Utc>>> {
        self.db.last_log_start(target, Action::Restart)
    }

    pub fn pending_for(&self, target: &Target) -> Result<Option<i64>> {
        self.db.pending_for(target)
    }

    /// `(total, failed)` restart counts.
    pub fn restart_counts(&self) -> Result<(u64, u64)> {
        let total = self.db.count_logs(Some(Action::Restart), None)?;
        let failed = self
            .db
            .count_logs(Some(Action::Restart), Some(LogStatus::Failed))?;
        Ok((total, failed))
    }

    /// Fail entries left pending by a previous process.
    pub fn recover_orphans(&self) -> Result<usize> {
        let n = self.db.fail_pending(ORPHANED_MESSAGE, Utc::now())?;
        if n > 0 {
            warn!(count = n, "closed log entries orphaned by a previous run");
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::store::tests::seeded;

    fn restart(target: Target, trigger: TriggerType) -> NewLogEntry {
        NewLogEntry {
            target,
            resource_name: Some("web-01".into()),
            action: Action::Restart,
            trigger_type: trigger,
            triggered_by: "scheduler".into(),
        }
    }

    #[test]
    fn test_complete_exactly_once() {
        let audit = AuditLog::new(seeded());
        let entry = audit
            .open(&restart(Target::resource(105, "pve1"), TriggerType::Auto))
            .unwrap();

        let done = audit
            .complete(
                entry.id,
                &Outcome::Failed {
                    error: "boom".into(),
                    output: Some("partial".into()),
                },
            )
            .unwrap();
        assert_eq!(done.status, LogStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("boom"));
        assert_eq!(done.output.as_deref(), Some("partial"));

        assert!(matches!(
            audit.complete(entry.id, &Outcome::Success { output: None }),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_restart_counts_and_last_restart() {
        let audit = AuditLog::new(seeded());
        let target = Target::resource(105, "pve1");
        assert!(audit.last_restart(&target).unwrap().is_none());

        let a = audit.open(&restart(target.clone(), TriggerType::Auto)).unwrap();
        audit.complete(a.id, &Outcome::Success { output: None }).unwrap();
        let b = audit.open(&restart(target.clone(), TriggerType::Manual)).unwrap();
        audit
            .complete(
                b.id,
                &Outcome::Failed {
                    error: "x".into(),
                    output: None,
                },
            )
            .unwrap();

        assert_eq!(audit.restart_counts().unwrap(), (2, 1));
        assert!(audit.last_restart(&target).unwrap().is_some());
        assert!(matches!(audit.get(999), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_recover_orphans() {
        let audit = AuditLog::new(seeded());
        let target = Target::node("pve1");
        let entry = audit.open(&restart(target.clone(), TriggerType::Auto)).unwrap();
        assert_eq!(audit.pending_for(&target).unwrap(), Some(entry.id));

        assert_eq!(audit.recover_orphans().unwrap(), 1);
        assert_eq!(audit.pending_for(&target).unwrap(), None);
        let entry = audit.get(entry.id).unwrap();
        assert_eq!(entry.error_message.as_deref(), Some(ORPHANED_MESSAGE));
    }
}
