//! SQLite persistence for batches, counters and templates.
//!
//! Batches are only ever updated with merge-style partial writes. Status
//! changes go through [`Store::transition`], a compare-and-swap on the
//! current status, so two writers racing on the same batch cannot both
//! move it forward.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::error::StoreError;
use crate::model::{Batch, BatchPatch, Counter, NewBatch, Status, Template, now_ms};

/// Attempts at an immediate transaction before reporting a conflict.
const MAX_TXN_ATTEMPTS: u32 = 5;

/// How long SQLite waits on a locked database before returning BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BATCH_COLUMNS: &str = "id, artifact_name, project, status, apk_seq, template_index_used,
     artifact_path, error, created_at, build_start, built_at";

/// Database handle shared by all components.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS batches (
                id                  TEXT PRIMARY KEY,
                artifact_name       TEXT NOT NULL,
                project             TEXT,
                status              TEXT NOT NULL,
                apk_seq             INTEGER,
                template_index_used INTEGER,
                artifact_path       TEXT,
                error               TEXT,
                created_at          INTEGER NOT NULL,
                build_start         INTEGER,
                built_at            INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_batches_created
                ON batches(created_at DESC);

            CREATE TABLE IF NOT EXISTS counters (
                project  TEXT PRIMARY KEY,
                last_seq INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS templates (
                project   TEXT NOT NULL,
                idx       INTEGER NOT NULL,
                data_text TEXT NOT NULL,
                PRIMARY KEY (project, idx)
            );
            ",
        )?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // ── Batches ────────────────────────────────────────────────────────

    pub fn create_batch(&self, new: &NewBatch) -> Result<Batch, StoreError> {
        let db = self.db.lock();
        let created_at = now_ms();
        let inserted = db.execute(
            "INSERT INTO batches (id, artifact_name, project, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.id,
                new.artifact_name,
                new.project,
                new.status.as_str(),
                created_at
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                return Err(StoreError::Duplicate(new.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Batch {
            id: new.id.clone(),
            artifact_name: new.artifact_name.clone(),
            project: new.project.clone(),
            status: new.status,
            apk_seq: None,
            template_index_used: None,
            artifact_path: None,
            error: None,
            created_at,
            build_start: None,
            built_at: None,
        })
    }

    pub fn get_batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        let db = self.db.lock();
        let row = db
            .query_row(
                &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1"),
                params![id],
                BatchRow::read,
            )
            .optional()?;
        row.map(BatchRow::into_batch).transpose()
    }

    /// Most recently created batches, newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Batch>, StoreError> {
        let db = self.db.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches
             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], BatchRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(BatchRow::into_batch).collect()
    }

    /// Merge non-status fields into a batch. Returns false if it doesn't exist.
    pub fn merge(&self, id: &str, patch: &BatchPatch) -> Result<bool, StoreError> {
        if patch.status.is_some() {
            return Err(StoreError::InvalidPatch(
                "status changes must use transition".to_string(),
            ));
        }
        if patch.artifact_path.is_some() {
            return Err(StoreError::InvalidPatch(
                "artifact path is only set when the batch is built".to_string(),
            ));
        }
        self.apply(id, patch, &[])
    }

    /// Apply a patch that moves the batch to `patch.status`, but only if the
    /// batch currently sits in a legal predecessor state.
    ///
    /// Returns false when the batch is missing or in any other state.
    pub fn transition(&self, id: &str, patch: &BatchPatch) -> Result<bool, StoreError> {
        let Some(next) = patch.status else {
            return Err(StoreError::InvalidPatch(
                "transition requires a target status".to_string(),
            ));
        };
        if patch.artifact_path.is_some() && next != Status::Built {
            return Err(StoreError::InvalidPatch(
                "artifact path is only set when the batch is built".to_string(),
            ));
        }
        let from = next.predecessors();
        if from.is_empty() {
            return Ok(false);
        }
        self.apply(id, patch, from)
    }

    fn apply(&self, id: &str, patch: &BatchPatch, from: &[Status]) -> Result<bool, StoreError> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(project) = &patch.project {
            sets.push("project = ?");
            values.push(Value::Text(project.clone()));
        }
        // Sequence and template index are write-once.
        if let Some(seq) = patch.apk_seq {
            sets.push("apk_seq = COALESCE(apk_seq, ?)");
            values.push(Value::Integer(seq as i64));
        }
        if let Some(index) = patch.template_index_used {
            sets.push("template_index_used = COALESCE(template_index_used, ?)");
            values.push(Value::Integer(index as i64));
        }
        if let Some(path) = &patch.artifact_path {
            sets.push("artifact_path = ?");
            values.push(Value::Text(path.clone()));
        }
        if let Some(error) = &patch.error {
            sets.push("error = ?");
            values.push(Value::Text(error.clone()));
        }
        if let Some(at) = patch.build_start {
            sets.push("build_start = ?");
            values.push(Value::Integer(at));
        }
        if let Some(at) = patch.built_at {
            sets.push("built_at = ?");
            values.push(Value::Integer(at));
        }

        if sets.is_empty() {
            return Ok(self.get_batch(id)?.is_some());
        }

        let mut sql = format!("UPDATE batches SET {} WHERE id = ?", sets.join(", "));
        values.push(Value::Text(id.to_string()));
        if !from.is_empty() {
            let slots = vec!["?"; from.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({slots})"));
            values.extend(from.iter().map(|s| Value::Text(s.as_str().to_string())));
        }

        let db = self.db.lock();
        let changed = db.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(changed > 0)
    }

    // ── Templates ──────────────────────────────────────────────────────

    /// Insert or replace the template at `(project, index)`.
    pub fn put_template(&self, template: &Template) -> Result<(), StoreError> {
        let index = i64::try_from(template.index).map_err(|_| StoreError::OutOfRange {
            field: "template index",
            value: template.index,
        })?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO templates (project, idx, data_text) VALUES (?1, ?2, ?3)
             ON CONFLICT(project, idx) DO UPDATE SET data_text = excluded.data_text",
            params![template.project, index, template.data_text],
        )?;
        Ok(())
    }

    pub fn template_at(&self, project: &str, index: u64) -> Result<Option<Template>, StoreError> {
        // Nothing above i64::MAX can have been stored.
        let Ok(index) = i64::try_from(index) else {
            return Ok(None);
        };
        let db = self.db.lock();
        let t = db
            .query_row(
                "SELECT project, idx, data_text FROM templates
                 WHERE project = ?1 AND idx = ?2 LIMIT 1",
                params![project, index],
                read_template,
            )
            .optional()?;
        Ok(t)
    }

    /// Highest-indexed template for a project.
    pub fn latest_template(&self, project: &str) -> Result<Option<Template>, StoreError> {
        let db = self.db.lock();
        let t = db
            .query_row(
                "SELECT project, idx, data_text FROM templates
                 WHERE project = ?1 ORDER BY idx DESC LIMIT 1",
                params![project],
                read_template,
            )
            .optional()?;
        Ok(t)
    }

    /// Every template of a project, highest index first.
    pub fn templates_for(&self, project: &str) -> Result<Vec<Template>, StoreError> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT project, idx, data_text FROM templates
             WHERE project = ?1 ORDER BY idx DESC",
        )?;
        let templates = stmt
            .query_map(params![project], read_template)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    // ── Counters ───────────────────────────────────────────────────────

    pub fn counter(&self, project: &str) -> Result<Option<Counter>, StoreError> {
        let db = self.db.lock();
        read_counter(&db, project)
    }

    /// Run `body` inside an immediate (write-locking) transaction.
    ///
    /// The transaction commits when `body` returns `Ok` and rolls back
    /// otherwise. A busy database is retried up to `MAX_TXN_ATTEMPTS` times
    /// before `TransactionConflict` is returned; `body` may therefore run
    /// more than once and must not have side effects outside `txn`.
    pub fn transaction<T>(
        &self,
        scope: &str,
        mut body: impl FnMut(&CounterTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut db = self.db.lock();
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let tx = match db.transaction_with_behavior(TransactionBehavior::Immediate) {
                Ok(tx) => tx,
                Err(e) if is_busy(&e) => {
                    tracing::debug!(scope, attempt, "Database busy, retrying transaction");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let txn = CounterTxn { tx };
            let outcome = body(&txn);
            let committed = match outcome {
                Ok(value) => txn.tx.commit().map(|()| value),
                Err(StoreError::Sqlite(e)) if is_busy(&e) => Err(e),
                Err(other) => return Err(other),
            };
            match committed {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    tracing::debug!(scope, attempt, "Commit busy, retrying transaction");
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(scope, attempts = MAX_TXN_ATTEMPTS, "Transaction conflict");
        Err(StoreError::TransactionConflict(scope.to_string()))
    }
}

/// Scoped view of one counter document inside a transaction.
pub struct CounterTxn<'a> {
    tx: Transaction<'a>,
}

impl CounterTxn<'_> {
    pub fn get(&self, project: &str) -> Result<Option<Counter>, StoreError> {
        read_counter(&self.tx, project)
    }

    pub fn set(&self, counter: &Counter) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO counters (project, last_seq) VALUES (?1, ?2)
             ON CONFLICT(project) DO UPDATE SET last_seq = excluded.last_seq",
            params![counter.project, counter.last_seq as i64],
        )?;
        Ok(())
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn read_counter(conn: &Connection, project: &str) -> Result<Option<Counter>, StoreError> {
    let counter = conn
        .query_row(
            "SELECT project, last_seq FROM counters WHERE project = ?1",
            params![project],
            |row| {
                Ok(Counter {
                    project: row.get(0)?,
                    last_seq: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .optional()?;
    Ok(counter)
}

fn read_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<Template> {
    Ok(Template {
        project: row.get(0)?,
        index: row.get::<_, i64>(1)? as u64,
        data_text: row.get(2)?,
    })
}

/// Raw batch row before the status column is parsed.
struct BatchRow {
    id: String,
    artifact_name: String,
    project: Option<String>,
    status: String,
    apk_seq: Option<i64>,
    template_index_used: Option<i64>,
    artifact_path: Option<String>,
    error: Option<String>,
    created_at: i64,
    build_start: Option<i64>,
    built_at: Option<i64>,
}

impl BatchRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            artifact_name: row.get(1)?,
            project: row.get(2)?,
            status: row.get(3)?,
            apk_seq: row.get(4)?,
            template_index_used: row.get(5)?,
            artifact_path: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            build_start: row.get(9)?,
            built_at: row.get(10)?,
        })
    }

    fn into_batch(self) -> Result<Batch, StoreError> {
        let status = self.status.parse::<Status>().map_err(|_| StoreError::Corrupt {
            id: self.id.clone(),
            field: "status",
            value: self.status.clone(),
        })?;
        Ok(Batch {
            id: self.id,
            artifact_name: self.artifact_name,
            project: self.project,
            status,
            apk_seq: self.apk_seq.map(|v| v as u64),
            template_index_used: self.template_index_used.map(|v| v as u64),
            artifact_path: self.artifact_path,
            error: self.error,
            created_at: self.created_at,
            build_start: self.build_start,
            built_at: self.built_at,
        })
    }
}
