//! Whitelist store: the allowlist of targets eligible for scheduled restart.

use chrono::Utc;
use tracing::info;

use crate::error::{Error, Result};

use super::store::{Database, NewWhitelistEntry};
use super::types::*;

pub struct WhitelistStore {
    db: Database,
}

impl WhitelistStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add `target`. Fails with `Duplicate` if it is already listed and
    /// `NotFound` if the registry does not know it.
    pub fn add(
        &self,
        target: WhitelistTarget,
        created_by: &str,
        notes: &str,
        interval_hours: Option<u32>,
    ) -> Result<WhitelistEntry> {
        if interval_hours == Some(0) {
            return Err(Error::Validation(
                "interval_hours must be greater than zero".to_string(),
            ));
        }
        let created_by = if created_by.trim().is_empty() {
            "unknown"
        } else {
            created_by.trim()
        };
        let entry = self.db.insert_whitelist(
            &NewWhitelistEntry {
                target,
                notes: notes.to_string(),
                created_by: created_by.to_string(),
                interval_hours,
            },
            Utc::now(),
        )?;
        info!(
            id = entry.id,
            target = %entry.target,
            created_by = %entry.created_by,
            "whitelist entry added"
        );
        Ok(entry)
    }

    pub fn update(
        &self,
        id: i64,
        enabled: Option<bool>,
        notes: Option<&str>,
    ) -> Result<WhitelistEntry> {
        let entry = self
            .db
            .update_whitelist(id, enabled, notes)?
            .ok_or_else(|| Error::not_found("whitelist entry", id))?;
        info!(id, enabled = entry.enabled, "whitelist entry updated");
        Ok(entry)
    }

    /// Remove an entry. The scheduler reads the store on every tick, so the
    /// entry stops being considered from the next tick on.
    pub fn remove(&self, id: i64) -> Result<()> {
        if !self.db.delete_whitelist(id)? {
            return Err(Error::not_found("whitelist entry", id));
        }
        info!(id, "whitelist entry removed");
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<WhitelistEntry> {
        self.db
            .get_whitelist(id)?
            .ok_or_else(|| Error::not_found("whitelist entry", id))
    }

    /// All entries in creation order.
    pub fn list(&self) -> Result<Vec<WhitelistEntry>> {
        self.db.list_whitelist()
    }

    pub fn count(&self) -> Result<u64> {
        self.db.count_whitelist()
    }
}
