//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use gantry_types::state::{
    InstanceRecord, PipelineId, RefName, RunId, RunRecord, RunStatus, TriggerEvent,
};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::backend::{RunFilter, StateBackend};
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    git_ref TEXT NOT NULL,
    commit_sha TEXT NOT NULL,
    is_protected INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    owner_pid INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_pipeline_ref ON pipeline_runs (pipeline, git_ref, status);

CREATE TABLE IF NOT EXISTS pipeline_instances (
    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id),
    instance TEXT NOT NULL,
    status TEXT NOT NULL,
    error_kind TEXT,
    error_message TEXT,
    failing_suites TEXT NOT NULL DEFAULT '[]',
    line_rate REAL,
    seq INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (run_id, instance)
);
";

const TERMINAL_STATUSES: &str = "('cancelled', 'succeeded', 'failed')";

const RUN_COLUMNS: &str = "id, pipeline, git_ref, commit_sha, is_protected, status, owner_pid, \
                           started_at, finished_at, error_message";

/// Raw run row before status parsing.
struct RunRow {
    id: i64,
    pipeline: String,
    git_ref: String,
    commit: String,
    is_protected: bool,
    status: String,
    owner_pid: i64,
    started_at: String,
    finished_at: Option<String>,
    error_message: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pipeline: row.get(1)?,
            git_ref: row.get(2)?,
            commit: row.get(3)?,
            is_protected: row.get(4)?,
            status: row.get(5)?,
            owner_pid: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    fn into_record(self) -> error::Result<RunRecord> {
        let status = parse_status(&self.status)?;
        let owner_pid = u32::try_from(self.owner_pid)
            .map_err(|_| StateError::Corrupt(format!("owner_pid {}", self.owner_pid)))?;
        Ok(RunRecord {
            id: self.id,
            pipeline: PipelineId::new(self.pipeline),
            git_ref: RefName::new(self.git_ref),
            commit: self.commit,
            is_protected: self.is_protected,
            status,
            owner_pid,
            started_at: SqliteStateBackend::sqlite_to_iso8601(&self.started_at),
            finished_at: self
                .finished_at
                .as_deref()
                .map(SqliteStateBackend::sqlite_to_iso8601),
            error_message: self.error_message,
        })
    }
}

fn parse_status(raw: &str) -> error::Result<RunStatus> {
    RunStatus::parse(raw).ok_or_else(|| StateError::Corrupt(format!("unknown status '{raw}'")))
}

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // Several orchestrator processes may share one database file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }
}

impl StateBackend for SqliteStateBackend {
    fn create_run(
        &self,
        pipeline: &PipelineId,
        trigger: &TriggerEvent,
        owner_pid: u32,
    ) -> error::Result<RunId> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipeline_runs \
             (pipeline, git_ref, commit_sha, is_protected, status, owner_pid, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                pipeline.as_str(),
                trigger.git_ref.as_str(),
                trigger.commit,
                trigger.is_protected,
                RunStatus::Running.as_str(),
                i64::from(owner_pid),
                Self::now_sqlite(),
            ],
        )
        .map_err(StateError::operation("create_run: insert"))?;
        Ok(conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: RunId) -> error::Result<Option<RunRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = ?1"),
                [run_id],
                RunRow::from_row,
            )
            .optional()
            .map_err(StateError::operation("get_run"))?;
        row.map(RunRow::into_record).transpose()
    }

    fn active_runs(
        &self,
        pipeline: &PipelineId,
        git_ref: &RefName,
    ) -> error::Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM pipeline_runs \
                 WHERE pipeline = ?1 AND git_ref = ?2 AND status IN ('pending', 'running') \
                 ORDER BY id"
            ))
            .map_err(StateError::operation("active_runs: prepare"))?;
        let rows = stmt
            .query_map(
                rusqlite::params![pipeline.as_str(), git_ref.as_str()],
                RunRow::from_row,
            )
            .map_err(StateError::operation("active_runs: query"))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let finished_at = status.is_terminal().then(Self::now_sqlite);
        let changed = conn
            .execute(
                &format!(
                    "UPDATE pipeline_runs SET status = ?1, finished_at = ?2, \
                     error_message = COALESCE(?3, error_message) \
                     WHERE id = ?4 AND status NOT IN {TERMINAL_STATUSES}"
                ),
                rusqlite::params![status.as_str(), finished_at, error_message, run_id],
            )
            .map_err(StateError::operation("finish_run: update"))?;
        Ok(changed > 0)
    }

    fn list_runs(&self, filter: &RunFilter) -> error::Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM pipeline_runs \
                 WHERE (?1 IS NULL OR pipeline = ?1) AND (?2 IS NULL OR git_ref = ?2) \
                 ORDER BY id DESC LIMIT ?3"
            ))
            .map_err(StateError::operation("list_runs: prepare"))?;
        let limit = filter.limit.map_or(-1, i64::from);
        let rows = stmt
            .query_map(
                rusqlite::params![
                    filter.pipeline.as_ref().map(PipelineId::as_str),
                    filter.git_ref.as_ref().map(RefName::as_str),
                    limit,
                ],
                RunRow::from_row,
            )
            .map_err(StateError::operation("list_runs: query"))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    fn record_instance(&self, record: &InstanceRecord) -> error::Result<()> {
        let failing = serde_json::to_string(&record.failing_suites)
            .map_err(|e| StateError::Corrupt(format!("failing_suites: {e}")))?;
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO pipeline_instances \
                 (run_id, instance, status, error_kind, error_message, failing_suites, line_rate, \
                  seq, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, \
                  (SELECT COUNT(*) FROM pipeline_instances WHERE run_id = ?1), ?8) \
                 ON CONFLICT(run_id, instance) DO UPDATE SET \
                  status = excluded.status, error_kind = excluded.error_kind, \
                  error_message = excluded.error_message, failing_suites = excluded.failing_suites, \
                  line_rate = excluded.line_rate, updated_at = excluded.updated_at \
                 WHERE pipeline_instances.status NOT IN {TERMINAL_STATUSES}"
            ),
            rusqlite::params![
                record.run_id,
                record.instance,
                record.status.as_str(),
                record.error_kind,
                record.error_message,
                failing,
                record.line_rate,
                Self::now_sqlite(),
            ],
        )
        .map_err(StateError::operation("record_instance: upsert"))?;
        Ok(())
    }

    fn list_instances(&self, run_id: RunId) -> error::Result<Vec<InstanceRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT instance, status, error_kind, error_message, failing_suites, line_rate \
                 FROM pipeline_instances WHERE run_id = ?1 ORDER BY seq",
            )
            .map_err(StateError::operation("list_instances: prepare"))?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                ))
            })
            .map_err(StateError::operation("list_instances: query"))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(instance, status, error_kind, error_message, failing, line_rate)| {
                    let failing_suites: Vec<String> = serde_json::from_str(&failing)
                        .map_err(|e| StateError::Corrupt(format!("failing_suites: {e}")))?;
                    Ok(InstanceRecord {
                        run_id,
                        instance,
                        status: parse_status(&status)?,
                        error_kind,
                        error_message,
                        failing_suites,
                        line_rate,
                    })
                },
            )
            .collect()
    }
}
