//! SQLite persistence for inventory, whitelist, and the restart audit trail.
//!
//! One connection behind a mutex: every public method holds the lock for its
//! whole body, so each call is atomic with respect to every other call.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::types::*;

const LAST_SYNC_KEY: &str = "registry.last_sync";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// What a full inventory replacement changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InventoryDiff {
    pub upserted_nodes: usize,
    pub upserted_resources: usize,
    pub removed_resources: Vec<ResourceRef>,
    pub removed_nodes: Vec<String>,
    pub cascaded_whitelist: usize,
}

/// Input for a new whitelist row.
#[derive(Debug, Clone)]
pub struct NewWhitelistEntry {
    pub target: WhitelistTarget,
    pub notes: String,
    pub created_by: String,
    pub interval_hours: Option<u32>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Internal(format!("creating {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!(path = %path.display(), "opened database");
        Ok(db)
    }

    /// In-memory database (tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                name TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                cpu_usage REAL NOT NULL DEFAULT 0,
                memory_used INTEGER NOT NULL DEFAULT 0,
                memory_total INTEGER NOT NULL DEFAULT 0,
                disk_used INTEGER NOT NULL DEFAULT 0,
                disk_total INTEGER NOT NULL DEFAULT 0,
                uptime INTEGER NOT NULL DEFAULT 0,
                last_synced_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resources (
                vmid INTEGER NOT NULL,
                node TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                cpu_usage REAL NOT NULL DEFAULT 0,
                memory_used INTEGER NOT NULL DEFAULT 0,
                memory_total INTEGER NOT NULL DEFAULT 0,
                disk_used INTEGER NOT NULL DEFAULT 0,
                disk_total INTEGER NOT NULL DEFAULT 0,
                uptime INTEGER NOT NULL DEFAULT 0,
                last_synced_at INTEGER NOT NULL,
                PRIMARY KEY (vmid, node)
            );
            CREATE INDEX IF NOT EXISTS idx_resources_vmid ON resources(vmid);

            CREATE TABLE IF NOT EXISTS whitelist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_key TEXT NOT NULL UNIQUE,
                target_type TEXT NOT NULL,
                vmid INTEGER,
                node TEXT NOT NULL,
                resource_name TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                notes TEXT NOT NULL DEFAULT '',
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                interval_hours INTEGER
            );

            CREATE TABLE IF NOT EXISTS restart_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_key TEXT NOT NULL,
                vmid INTEGER,
                resource_name TEXT,
                node TEXT NOT NULL,
                action TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                triggered_by TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                output TEXT,
                started_at INTEGER NOT NULL,
                completed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_restart_logs_target
                ON restart_logs(target_key, action, started_at);
            CREATE INDEX IF NOT EXISTS idx_restart_logs_started ON restart_logs(started_at);
            CREATE INDEX IF NOT EXISTS idx_restart_logs_status ON restart_logs(status);

            CREATE TABLE IF NOT EXISTS installed_services (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vmid INTEGER NOT NULL,
                node TEXT NOT NULL,
                service_name TEXT NOT NULL,
                service_type TEXT NOT NULL,
                installed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_installed_services_resource
                ON installed_services(vmid, node);

            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Inventory
    // ========================================================================

    /// Replace the mirrored inventory with a fresh hypervisor snapshot.
    ///
    /// Rows absent from the snapshot are deleted together with any whitelist
    /// entry that references them, inside one transaction.
    pub fn replace_inventory(
        &self,
        nodes: &[Node],
        resources: &[Resource],
        synced_at: DateTime<Utc>,
    ) -> Result<InventoryDiff> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut diff = InventoryDiff::default();

        for node in nodes {
            upsert_node(&tx, node)?;
            diff.upserted_nodes += 1;
        }
        for resource in resources {
            upsert_resource(&tx, resource)?;
            diff.upserted_resources += 1;
        }

        let seen_nodes: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let known_nodes: Vec<String> = {
            let mut stmt = tx.prepare("SELECT name FROM nodes")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for name in known_nodes {
            if !seen_nodes.contains(name.as_str()) {
                diff.cascaded_whitelist += delete_node_tx(&tx, &name)?;
                diff.removed_nodes.push(name);
            }
        }

        let seen: HashSet<(u32, &str)> = resources
            .iter()
            .map(|r| (r.vmid, r.node.as_str()))
            .collect();
        let known: Vec<ResourceRef> = {
            let mut stmt = tx.prepare("SELECT vmid, node FROM resources")?;
            let rows = stmt.query_map([], |row| {
                Ok(ResourceRef {
                    vmid: row.get(0)?,
                    node: row.get(1)?,
                })
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for r in known {
            if !seen.contains(&(r.vmid, r.node.as_str())) {
                diff.cascaded_whitelist += delete_resource_tx(&tx, &r)?;
                diff.removed_resources.push(r);
            }
        }

        set_kv(&tx, LAST_SYNC_KEY, &synced_at.to_rfc3339())?;
        tx.commit()?;
        Ok(diff)
    }

    pub fn upsert_resource(&self, resource: &Resource) -> Result<()> {
        let conn = self.conn.lock();
        upsert_resource(&conn, resource)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM nodes ORDER BY name", NODE_COLS))?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE name = ?1", NODE_COLS),
                params![name],
                node_from_row,
            )
            .optional()?)
    }

    pub fn list_resources(&self) -> Result<Vec<Resource>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM resources ORDER BY node, vmid",
            RESOURCE_COLS
        ))?;
        let rows = stmt.query_map([], resource_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_resource(&self, r: &ResourceRef) -> Result<Option<Resource>> {
        let conn = self.conn.lock();
        get_resource(&conn, r)
    }

    /// Every resource using `vmid` on any node.
    pub fn resources_by_vmid(&self, vmid: u32) -> Result<Vec<Resource>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM resources WHERE vmid = ?1 ORDER BY node",
            RESOURCE_COLS
        ))?;
        let rows = stmt.query_map(params![vmid], resource_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn set_resource_status(&self, r: &ResourceRef, status: ResourceStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE resources SET status = ?1 WHERE vmid = ?2 AND node = ?3",
            params![status.as_str(), r.vmid, r.node],
        )?;
        Ok(n > 0)
    }

    /// Delete a resource and cascade its whitelist entry. Returns false if absent.
    pub fn delete_resource(&self, r: &ResourceRef) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if get_resource(&tx, r)?.is_none() {
            return Ok(false);
        }
        let cascaded = delete_resource_tx(&tx, r)?;
        tx.commit()?;
        debug!(resource = %r, cascaded, "deleted resource");
        Ok(true)
    }

    pub fn max_vmid(&self) -> Result<Option<u32>> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT MAX(vmid) FROM resources", [], |row| row.get(0))?)
    }

    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![LAST_SYNC_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|d| d.with_timezone(&Utc)))
    }

    // ========================================================================
    // Installed services
    // ========================================================================

    /// Record a service installed into an existing resource.
    pub fn insert_service(
        &self,
        r: &ResourceRef,
        service_name: &str,
        service_type: &str,
        installed_at: DateTime<Utc>,
    ) -> Result<InstalledService> {
        let conn = self.conn.lock();
        if get_resource(&conn, r)?.is_none() {
            return Err(Error::not_found("resource", r));
        }
        conn.execute(
            "INSERT INTO installed_services (vmid, node, service_name, service_type, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                r.vmid,
                r.node,
                service_name,
                service_type,
                installed_at.timestamp_millis()
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            &format!("SELECT {} FROM installed_services WHERE id = ?1", SERVICE_COLS),
            params![id],
            service_from_row,
        )?)
    }

    /// Services of one resource, newest first.
    pub fn services_for(&self, r: &ResourceRef) -> Result<Vec<InstalledService>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM installed_services WHERE vmid = ?1 AND node = ?2
             ORDER BY installed_at DESC, id DESC",
            SERVICE_COLS
        ))?;
        let rows = stmt.query_map(params![r.vmid, r.node], service_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ========================================================================
    // Whitelist
    // ========================================================================

    /// Insert a whitelist row after checking target existence and uniqueness.
    pub fn insert_whitelist(
        &self,
        new: &NewWhitelistEntry,
        created_at: DateTime<Utc>,
    ) -> Result<WhitelistEntry> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let resource_name = match &new.target {
            Target::Resource { vmid, node } => {
                let r = ResourceRef::new(*vmid, node);
                let resource =
                    get_resource(&tx, &r)?.ok_or_else(|| Error::not_found("resource", &r))?;
                Some(resource.name)
            }
            Target::Node { name } => {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM nodes WHERE name = ?1)",
                    params![name],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(Error::not_found("node", name));
                }
                None
            }
        };

        let key = new.target.key();
        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM whitelist WHERE target_key = ?1)",
            params![key],
            |row| row.get(0),
        )?;
        if taken {
            return Err(Error::duplicate("whitelist entry", &new.target));
        }

        let target_type = match new.target {
            Target::Resource { .. } => "resource",
            Target::Node { .. } => "node",
        };
        tx.execute(
            "INSERT INTO whitelist
                (target_key, target_type, vmid, node, resource_name, enabled, notes,
                 created_by, created_at, interval_hours)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9)",
            params![
                key,
                target_type,
                new.target.vmid(),
                new.target.node_name(),
                resource_name,
                new.notes,
                new.created_by,
                created_at.timestamp_millis(),
                new.interval_hours,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let entry = get_whitelist(&tx, id)?
            .ok_or_else(|| Error::Internal(format!("whitelist row {} vanished", id)))?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn get_whitelist(&self, id: i64) -> Result<Option<WhitelistEntry>> {
        let conn = self.conn.lock();
        get_whitelist(&conn, id)
    }

    /// Apply `enabled` and/or `notes` in a single statement.
    pub fn update_whitelist(
        &self,
        id: i64,
        enabled: Option<bool>,
        notes: Option<&str>,
    ) -> Result<Option<WhitelistEntry>> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE whitelist
             SET enabled = COALESCE(?1, enabled), notes = COALESCE(?2, notes)
             WHERE id = ?3",
            params![enabled, notes, id],
        )?;
        if n == 0 {
            return Ok(None);
        }
        get_whitelist(&conn, id)
    }

    pub fn delete_whitelist(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM whitelist WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// All entries in creation order.
    pub fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM whitelist ORDER BY id",
            WHITELIST_COLS
        ))?;
        let rows = stmt.query_map([], whitelist_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn count_whitelist(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM whitelist", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    // ========================================================================
    // Restart log
    // ========================================================================

    /// Open a `pending` log entry.
    pub fn insert_log(&self, new: &NewLogEntry, started_at: DateTime<Utc>) -> Result<RestartLogEntry> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO restart_logs
                (target_key, vmid, resource_name, node, action, trigger_type,
                 triggered_by, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                new.target.key(),
                new.target.vmid(),
                new.resource_name,
                new.target.node_name(),
                new.action.as_str(),
                new.trigger_type.as_str(),
                new.triggered_by,
                started_at.timestamp_millis(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        get_log(&conn, id)?.ok_or_else(|| Error::Internal(format!("log row {} vanished", id)))
    }

    /// Move a pending entry to its terminal state. Returns `None` if the entry
    /// does not exist or was already completed.
    ///
    /// `completed_at` is clamped so it never precedes `started_at`.
    pub fn complete_log(
        &self,
        id: i64,
        outcome: &Outcome,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<RestartLogEntry>> {
        let conn = self.conn.lock();
        let (status, error, output) = match outcome {
            Outcome::Success { output } => (LogStatus::Success, None, output.as_deref()),
            Outcome::Failed { error, output } => {
                (LogStatus::Failed, Some(error.as_str()), output.as_deref())
            }
        };
        let n = conn.execute(
            "UPDATE restart_logs
             SET status = ?1, error_message = ?2, output = ?3,
                 completed_at = MAX(?4, started_at)
             WHERE id = ?5 AND status = 'pending'",
            params![
                status.as_str(),
                error,
                output,
                completed_at.timestamp_millis(),
                id
            ],
        )?;
        if n == 0 {
            return Ok(None);
        }
        get_log(&conn, id)
    }

    pub fn get_log(&self, id: i64) -> Result<Option<RestartLogEntry>> {
        let conn = self.conn.lock();
        get_log(&conn, id)
    }

    /// Filtered, paginated query, newest first.
    pub fn query_logs(&self, filter: &LogFilter) -> Result<Vec<RestartLogEntry>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(vmid) = filter.vmid {
            clauses.push("vmid = ?");
            values.push(Value::Integer(i64::from(vmid)));
        }
        if let Some(name) = &filter.resource_name {
            clauses.push("resource_name LIKE '%' || ? || '%'");
            values.push(Value::Text(name.clone()));
        }
        if let Some(node) = &filter.node {
            clauses.push("node = ?");
            values.push(Value::Text(node.clone()));
        }
        if let Some(action) = filter.action {
            clauses.push("action = ?");
            values.push(Value::Text(action.as_str().to_string()));
        }
        if let Some(trigger) = filter.trigger_type {
            clauses.push("trigger_type = ?");
            values.push(Value::Text(trigger.as_str().to_string()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(start) = filter.start_date {
            clauses.push("started_at >= ?");
            values.push(Value::Integer(start.timestamp_millis()));
        }
        if let Some(end) = filter.end_date {
            clauses.push("started_at <= ?");
            values.push(Value::Integer(end.timestamp_millis()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(Value::Integer(i64::from(filter.effective_limit())));
        values.push(Value::Integer(i64::from(filter.offset.unwrap_or(0))));

        let sql = format!(
            "SELECT {} FROM restart_logs {} ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?",
            LOG_COLS, where_sql
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), log_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Start time of the most recent `action` entry for a target, any outcome.
    pub fn last_log_start(&self, target: &Target, action: Action) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let ms: Option<i64> = conn.query_row(
            "SELECT MAX(started_at) FROM restart_logs WHERE target_key = ?1 AND action = ?2",
            params![target.key(), action.as_str()],
            |row| row.get(0),
        )?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Id of a pending entry for this target, if any.
    pub fn pending_for(&self, target: &Target) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id FROM restart_logs WHERE target_key = ?1 AND status = 'pending'
                 ORDER BY id DESC LIMIT 1",
                params![target.key()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn count_logs(&self, action: Option<Action>, status: Option<LogStatus>) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM restart_logs
             WHERE (?1 IS NULL OR action = ?1) AND (?2 IS NULL OR status = ?2)",
            params![action.map(|a| a.as_str()), status.map(|s| s.as_str())],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Fail every pending entry (used at startup for entries orphaned by a
    /// previous process). Returns how many were closed.
    pub fn fail_pending(&self, message: &str, completed_at: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE restart_logs
             SET status = 'failed', error_message = ?1, completed_at = MAX(?2, started_at)
             WHERE status = 'pending'",
            params![message, completed_at.timestamp_millis()],
        )?;
        Ok(n)
    }
}

// ── Row helpers ────────────────────────────────────────────

const NODE_COLS: &str =
    "name, status, cpu_usage, memory_used, memory_total, disk_used, disk_total, uptime, last_synced_at";

const RESOURCE_COLS: &str = "vmid, node, name, kind, status, cpu_usage, memory_used, memory_total, \
     disk_used, disk_total, uptime, last_synced_at";

const WHITELIST_COLS: &str = "id, target_type, vmid, node, resource_name, enabled, notes, \
     created_by, created_at, interval_hours";

const SERVICE_COLS: &str = "id, vmid, node, service_name, service_type, installed_at";

const LOG_COLS: &str = "id, target_key, vmid, resource_name, node, action, trigger_type, \
     triggered_by, status, error_message, output, started_at, completed_at";

fn upsert_node(conn: &Connection, node: &Node) -> Result<()> {
    conn.execute(
        "INSERT INTO nodes (name, status, cpu_usage, memory_used, memory_total, disk_used,
                            disk_total, uptime, last_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(name) DO UPDATE SET
            status = excluded.status, cpu_usage = excluded.cpu_usage,
            memory_used = excluded.memory_used, memory_total = excluded.memory_total,
            disk_used = excluded.disk_used, disk_total = excluded.disk_total,
            uptime = excluded.uptime, last_synced_at = excluded.last_synced_at",
        params![
            node.name,
            node.status.as_str(),
            node.usage.cpu_usage,
            node.usage.memory_used as i64,
            node.usage.memory_total as i64,
            node.usage.disk_used as i64,
            node.usage.disk_total as i64,
            node.usage.uptime as i64,
            node.last_synced_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn upsert_resource(conn: &Connection, r: &Resource) -> Result<()> {
    conn.execute(
        "INSERT INTO resources (vmid, node, name, kind, status, cpu_usage, memory_used,
                                memory_total, disk_used, disk_total, uptime, last_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(vmid, node) DO UPDATE SET
            name = excluded.name, kind = excluded.kind, status = excluded.status,
            cpu_usage = excluded.cpu_usage, memory_used = excluded.memory_used,
            memory_total = excluded.memory_total, disk_used = excluded.disk_used,
            disk_total = excluded.disk_total, uptime = excluded.uptime,
            last_synced_at = excluded.last_synced_at",
        params![
            r.vmid,
            r.node,
            r.name,
            r.kind.as_str(),
            r.status.as_str(),
            r.usage.cpu_usage,
            r.usage.memory_used as i64,
            r.usage.memory_total as i64,
            r.usage.disk_used as i64,
            r.usage.disk_total as i64,
            r.usage.uptime as i64,
            r.last_synced_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn get_resource(conn: &Connection, r: &ResourceRef) -> Result<Option<Resource>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM resources WHERE vmid = ?1 AND node = ?2",
                RESOURCE_COLS
            ),
            params![r.vmid, r.node],
            resource_from_row,
        )
        .optional()?)
}

fn delete_resource_tx(tx: &Transaction<'_>, r: &ResourceRef) -> Result<usize> {
    tx.execute(
        "DELETE FROM resources WHERE vmid = ?1 AND node = ?2",
        params![r.vmid, r.node],
    )?;
    tx.execute(
        "DELETE FROM installed_services WHERE vmid = ?1 AND node = ?2",
        params![r.vmid, r.node],
    )?;
    let key = Target::from(r.clone()).key();
    Ok(tx.execute("DELETE FROM whitelist WHERE target_key = ?1", params![key])?)
}

fn delete_node_tx(tx: &Transaction<'_>, name: &str) -> Result<usize> {
    tx.execute("DELETE FROM nodes WHERE name = ?1", params![name])?;
    Ok(tx.execute(
        "DELETE FROM whitelist WHERE target_key = ?1",
        params![Target::node(name).key()],
    )?)
}

fn get_whitelist(conn: &Connection, id: i64) -> Result<Option<WhitelistEntry>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM whitelist WHERE id = ?1", WHITELIST_COLS),
            params![id],
            whitelist_from_row,
        )
        .optional()?)
}

fn get_log(conn: &Connection, id: i64) -> Result<Option<RestartLogEntry>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM restart_logs WHERE id = ?1", LOG_COLS),
            params![id],
            log_from_row,
        )
        .optional()?)
}

fn set_kv(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
        params![key, value, Utc::now().timestamp()],
    )?;
    Ok(())
}

/// Parse a stored enum column, surfacing garbage as a conversion error.
fn parse_col<T: std::str::FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value '{}'", s).into(),
        )
    })
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn usage_from_row(row: &Row<'_>, start: usize) -> rusqlite::Result<Usage> {
    Ok(Usage {
        cpu_usage: row.get(start)?,
        memory_used: row.get::<_, i64>(start + 1)? as u64,
        memory_total: row.get::<_, i64>(start + 2)? as u64,
        disk_used: row.get::<_, i64>(start + 3)? as u64,
        disk_total: row.get::<_, i64>(start + 4)? as u64,
        uptime: row.get::<_, i64>(start + 5)? as u64,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        name: row.get(0)?,
        status: parse_col(row, 1)?,
        usage: usage_from_row(row, 2)?,
        last_synced_at: time_col(row, 8)?,
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        vmid: row.get(0)?,
        node: row.get(1)?,
        name: row.get(2)?,
        kind: parse_col(row, 3)?,
        status: parse_col(row, 4)?,
        usage: usage_from_row(row, 5)?,
        last_synced_at: time_col(row, 11)?,
    })
}

fn whitelist_from_row(row: &Row<'_>) -> rusqlite::Result<WhitelistEntry> {
    let target_type: String = row.get(1)?;
    let node: String = row.get(3)?;
    let target = match target_type.as_str() {
        "resource" => {
            let vmid: u32 = row.get(2)?;
            Target::resource(vmid, &node)
        }
        _ => Target::node(&node),
    };
    Ok(WhitelistEntry {
        id: row.get(0)?,
        target,
        resource_name: row.get(4)?,
        enabled: row.get(5)?,
        notes: row.get(6)?,
        created_by: row.get(7)?,
        created_at: time_col(row, 8)?,
        interval_hours: row.get(9)?,
    })
}

fn service_from_row(row: &Row<'_>) -> rusqlite::Result<InstalledService> {
    Ok(InstalledService {
        id: row.get(0)?,
        vmid: row.get(1)?,
        node: row.get(2)?,
        service_name: row.get(3)?,
        service_type: row.get(4)?,
        installed_at: time_col(row, 5)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<RestartLogEntry> {
    let started_at = time_col(row, 11)?;
    let completed_at: Option<i64> = row.get(12)?;
    let completed_at = completed_at.and_then(DateTime::from_timestamp_millis);
    let duration_seconds = completed_at
        .map(|c| (c - started_at).num_milliseconds() as f64 / 1000.0);
    Ok(RestartLogEntry {
        id: row.get(0)?,
        target_key: row.get(1)?,
        vmid: row.get(2)?,
        resource_name: row.get(3)?,
        node: row.get(4)?,
        action: parse_col(row, 5)?,
        trigger_type: parse_col(row, 6)?,
        triggered_by: row.get(7)?,
        status: parse_col(row, 8)?,
        error_message: row.get(9)?,
        output: row.get(10)?,
        started_at,
        completed_at,
        duration_seconds,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn resource(vmid: u32, node: &str, name: &str) -> Resource {
        Resource {
            vmid,
            name: name.to_string(),
            kind: ResourceKind::Container,
            node: node.to_string(),
            status: ResourceStatus::Running,
            usage: Usage::default(),
            last_synced_at: Utc::now(),
        }
    }

    pub(crate) fn node(name: &str) -> Node {
        Node {
            name: name.to_string(),
            status: NodeStatus::Online,
            usage: Usage::default(),
            last_synced_at: Utc::now(),
        }
    }

    pub(crate) fn seeded() -> Database {
        let db = Database::open_memory().unwrap();
        db.replace_inventory(
            &[node("pve1"), node("pve2")],
            &[resource(105, "pve1", "web-01"), resource(106, "pve2", "db-01")],
            Utc::now(),
        )
        .unwrap();
        db
    }

    /// Drop a resource row behind the registry's back, leaving its
    /// whitelist entry dangling.
    pub(crate) fn forget_resource(db: &Database, r: &ResourceRef) {
        db.conn
            .lock()
            .execute(
                "DELETE FROM resources WHERE vmid = ?1 AND node = ?2",
                params![r.vmid, r.node],
            )
            .unwrap();
    }

    fn new_entry(target: Target) -> NewWhitelistEntry {
        NewWhitelistEntry {
            target,
            notes: "nightly".to_string(),
            created_by: "dashboard".to_string(),
            interval_hours: None,
        }
    }

    fn new_log(target: Target, action: Action) -> NewLogEntry {
        NewLogEntry {
            target,
            resource_name: None,
            action,
            trigger_type: TriggerType::Manual,
            triggered_by: "tester".to_string(),
        }
    }

    #[test]
    fn test_inventory_round_trip() {
        let db = seeded();
        assert_eq!(db.list_nodes().unwrap().len(), 2);
        let r = db
            .get_resource(&ResourceRef::new(105, "pve1"))
            .unwrap()
            .unwrap();
        assert_eq!(r.name, "web-01");
        assert_eq!(r.kind, ResourceKind::Container);
        assert_eq!(db.max_vmid().unwrap(), Some(106));
        assert!(db.last_sync_time().unwrap().is_some());
    }

    #[test]
    fn test_whitelist_insert_resolves_name_and_rejects_duplicates() {
        let db = seeded();
        let entry = db
            .insert_whitelist(&new_entry(Target::resource(105, "pve1")), Utc::now())
            .unwrap();
        assert_eq!(entry.resource_name.as_deref(), Some("web-01"));
        assert!(entry.enabled);

        let err = db
            .insert_whitelist(&new_entry(Target::resource(105, "pve1")), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));

        let err = db
            .insert_whitelist(&new_entry(Target::resource(999, "pve1")), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let err = db
            .insert_whitelist(&new_entry(Target::node("pve9")), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_update_whitelist_is_partial() {
        let db = seeded();
        let entry = db
            .insert_whitelist(&new_entry(Target::node("pve1")), Utc::now())
            .unwrap();

        let updated = db.update_whitelist(entry.id, Some(false), None).unwrap().unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.notes, "nightly");

        let updated = db.update_whitelist(entry.id, None, Some("weekly")).unwrap().unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.notes, "weekly");

        assert!(db.update_whitelist(4242, Some(true), None).unwrap().is_none());
    }

    #[test]
    fn test_delete_resource_cascades_whitelist() {
        let db = seeded();
        db.insert_whitelist(&new_entry(Target::resource(105, "pve1")), Utc::now())
            .unwrap();
        db.insert_whitelist(&new_entry(Target::resource(106, "pve2")), Utc::now())
            .unwrap();

        assert!(db.delete_resource(&ResourceRef::new(105, "pve1")).unwrap());
        let remaining = db.list_whitelist().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].target, Target::resource(106, "pve2"));

        assert!(!db.delete_resource(&ResourceRef::new(105, "pve1")).unwrap());
    }

    #[test]
    fn test_installed_services_follow_their_resource() {
        let db = seeded();
        let web = ResourceRef::new(105, "pve1");
        let t0 = Utc::now();
        db.insert_service(&web, "grow-node", "grow", t0).unwrap();
        let newest = db
            .insert_service(&web, "monitor", "custom", t0 + Duration::minutes(5))
            .unwrap();
        db.insert_service(&ResourceRef::new(106, "pve2"), "db", "custom", t0)
            .unwrap();

        let services = db.services_for(&web).unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0], newest);
        assert_eq!(services[1].service_type, "grow");

        let err = db
            .insert_service(&ResourceRef::new(999, "pve1"), "x", "custom", t0)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        assert!(db.delete_resource(&web).unwrap());
        assert!(db.services_for(&web).unwrap().is_empty());
        assert_eq!(db.services_for(&ResourceRef::new(106, "pve2")).unwrap().len(), 1);
    }

    #[test]
    fn test_replace_inventory_removes_vanished_rows() {
        let db = seeded();
        db.insert_whitelist(&new_entry(Target::resource(106, "pve2")), Utc::now())
            .unwrap();
        db.insert_whitelist(&new_entry(Target::node("pve2")), Utc::now())
            .unwrap();

        let diff = db
            .replace_inventory(&[node("pve1")], &[resource(105, "pve1", "web-01")], Utc::now())
            .unwrap();
        assert_eq!(diff.removed_resources, vec![ResourceRef::new(106, "pve2")]);
        assert_eq!(diff.removed_nodes, vec!["pve2".to_string()]);
        assert_eq!(diff.cascaded_whitelist, 2);
        assert!(db.list_whitelist().unwrap().is_empty());
    }

    #[test]
    fn test_complete_log_happens_once() {
        let db = seeded();
        let target = Target::resource(105, "pve1");
        let log = db
            .insert_log(&new_log(target.clone(), Action::Restart), Utc::now())
            .unwrap();
        assert_eq!(log.status, LogStatus::Pending);
        assert!(log.completed_at.is_none());
        assert_eq!(db.pending_for(&target).unwrap(), Some(log.id));

        let done = db
            .complete_log(log.id, &Outcome::Success { output: None }, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(done.status, LogStatus::Success);
        assert!(done.completed_at.unwrap() >= done.started_at);
        assert!(done.duration_seconds.unwrap() >= 0.0);

        let again = db
            .complete_log(
                log.id,
                &Outcome::Failed {
                    error: "late".into(),
                    output: None,
                },
                Utc::now(),
            )
            .unwrap();
        assert!(again.is_none());
        assert_eq!(db.get_log(log.id).unwrap().unwrap().status, LogStatus::Success);
        assert_eq!(db.pending_for(&target).unwrap(), None);
    }

    #[test]
    fn test_completion_never_precedes_start() {
        let db = seeded();
        let started = Utc::now();
        let log = db
            .insert_log(&new_log(Target::node("pve1"), Action::Restart), started)
            .unwrap();
        let done = db
            .complete_log(
                log.id,
                &Outcome::Success { output: None },
                started - Duration::seconds(30),
            )
            .unwrap()
            .unwrap();
        assert_eq!(done.completed_at, Some(done.started_at));
    }

    #[test]
    fn test_query_logs_filters_and_orders_newest_first() {
        let db = seeded();
        let base = Utc::now() - Duration::hours(3);
        let a = Target::resource(105, "pve1");
        let b = Target::resource(106, "pve2");

        for (i, (t, action)) in [
            (a.clone(), Action::Restart),
            (b.clone(), Action::Stop),
            (a.clone(), Action::Start),
            (a.clone(), Action::Restart),
        ]
        .into_iter()
        .enumerate()
        {
            db.insert_log(&new_log(t, action), base + Duration::minutes(i as i64 * 10))
                .unwrap();
        }

        let all = db.query_logs(&LogFilter::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].started_at >= w[1].started_at));

        let filter = LogFilter {
            vmid: Some(105),
            action: Some(Action::Restart),
            ..Default::default()
        };
        assert_eq!(db.query_logs(&filter).unwrap().len(), 2);

        let filter = LogFilter {
            node: Some("pve2".into()),
            ..Default::default()
        };
        assert_eq!(db.query_logs(&filter).unwrap().len(), 1);

        let filter = LogFilter {
            start_date: Some(base + Duration::minutes(15)),
            ..Default::default()
        };
        assert_eq!(db.query_logs(&filter).unwrap().len(), 2);

        let filter = LogFilter {
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        };
        let page = db.query_logs(&filter).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].action, Action::Start);

        assert_eq!(
            db.last_log_start(&a, Action::Restart).unwrap(),
            DateTime::from_timestamp_millis((base + Duration::minutes(30)).timestamp_millis())
        );
        assert_eq!(db.count_logs(Some(Action::Restart), None).unwrap(), 2);
        assert_eq!(
            db.count_logs(Some(Action::Restart), Some(LogStatus::Failed)).unwrap(),
            0
        );
    }

    #[test]
    fn test_fail_pending_closes_orphans() {
        let db = seeded();
        db.insert_log(&new_log(Target::node("pve1"), Action::Restart), Utc::now())
            .unwrap();
        db.insert_log(&new_log(Target::node("pve2"), Action::Restart), Utc::now())
            .unwrap();

        assert_eq!(db.fail_pending("interrupted", Utc::now()).unwrap(), 2);
        let failed = LogFilter {
            status: Some(LogStatus::Failed),
            ..Default::default()
        };
        let logs = db.query_logs(&failed).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.error_message.as_deref() == Some("interrupted")));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warden.db");
        {
            let db = Database::open(&path).unwrap();
            db.upsert_resource(&resource(200, "pve1", "fresh")).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.list_resources().unwrap().len(), 1);
    }
}
