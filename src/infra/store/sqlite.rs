//! SQLite-backed task store.
//!
//! Every mutation runs in an IMMEDIATE transaction and versioned writes are
//! `UPDATE ... WHERE id = ? AND updated_at = ?`, so several scheduler
//! processes can share one database file. Admission reads pre-ordered,
//! pre-limited candidate sets and hands them to the shared selection rules.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;

use crate::core::admission::{remaining_slots, select_parallel_from, select_sequence_from};
use crate::core::task::{ErrorSnapshot, NewTask, TaskFilter, TaskRecord, TaskStatus};
use crate::core::{SchedulerError, TaskStore};
use crate::util::serde::{Priority, TaskId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        activity_code TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT NOT NULL,            -- JSON
        result TEXT,                    -- JSON
        error TEXT,                     -- JSON error snapshot
        priority INTEGER NOT NULL DEFAULT 0,
        max_retry_times INTEGER,
        retry_times INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        running_at INTEGER,
        finished_at INTEGER,
        failed_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks (status, created_at);
    CREATE INDEX IF NOT EXISTS idx_tasks_retry ON tasks (status, failed_at, created_at);
    CREATE INDEX IF NOT EXISTS idx_tasks_idle ON tasks (status, priority, created_at);
    CREATE INDEX IF NOT EXISTS idx_tasks_finished ON tasks (status, finished_at);
";

const COLUMNS: &str = "id, activity_code, status, input, result, error, priority, \
    max_retry_times, retry_times, created_at, updated_at, running_at, finished_at, failed_at";

/// Raw column values, decoded into a [`TaskRecord`] outside the row callback.
struct TaskRow {
    id: String,
    activity_code: String,
    status: String,
    input: String,
    result: Option<String>,
    error: Option<String>,
    priority: u8,
    max_retry_times: Option<u32>,
    retry_times: u32,
    created_at: u64,
    updated_at: u64,
    running_at: Option<u64>,
    finished_at: Option<u64>,
    failed_at: Option<u64>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            activity_code: row.get(1)?,
            status: row.get(2)?,
            input: row.get(3)?,
            result: row.get(4)?,
            error: row.get(5)?,
            priority: row.get(6)?,
            max_retry_times: row.get(7)?,
            retry_times: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            running_at: row.get(11)?,
            finished_at: row.get(12)?,
            failed_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, SchedulerError> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| SchedulerError::storage(format!("unknown task status {}", self.status)))?;
        let priority = Priority::new(self.priority)
            .ok_or_else(|| SchedulerError::storage(format!("priority out of range: {}", self.priority)))?;
        Ok(TaskRecord {
            id: TaskId::from(self.id),
            activity_code: self.activity_code,
            status,
            input: serde_json::from_str(&self.input)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error.as_deref().map(serde_json::from_str).transpose()?,
            priority,
            max_retry_times: self.max_retry_times,
            retry_times: self.retry_times,
            created_at: self.created_at,
            updated_at: self.updated_at,
            running_at: self.running_at,
            finished_at: self.finished_at,
            failed_at: self.failed_at,
        })
    }
}

fn sql_err(err: rusqlite::Error) -> SchedulerError {
    SchedulerError::storage(format!("sqlite: {err}"))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn query_tasks<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<TaskRecord>, SchedulerError> {
    let mut stmt = conn.prepare(sql).map_err(sql_err)?;
    let rows = stmt
        .query_map(params, TaskRow::from_row)
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    rows.into_iter().map(TaskRow::into_record).collect()
}

fn load_task(conn: &Connection, id: &TaskId) -> Result<Option<TaskRecord>, SchedulerError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
        params![id.as_str()],
        TaskRow::from_row,
    )
    .optional()
    .map_err(sql_err)?
    .map(TaskRow::into_record)
    .transpose()
}

fn insert_row(conn: &Connection, task: &TaskRecord) -> Result<(), SchedulerError> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO tasks ({COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            task.id.as_str(),
            task.activity_code,
            task.status.as_str(),
            serde_json::to_string(&task.input)?,
            task.result.as_ref().map(serde_json::to_string).transpose()?,
            task.error.as_ref().map(serde_json::to_string).transpose()?,
            task.priority.value(),
            task.max_retry_times,
            task.retry_times,
            task.created_at,
            task.updated_at,
            task.running_at,
            task.finished_at,
            task.failed_at,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

/// Overwrite the mutable columns of a row if it is still at `expected_version`.
fn update_row(conn: &Connection, task: &TaskRecord, expected_version: u64) -> Result<bool, SchedulerError> {
    let changed = conn
        .execute(
            "UPDATE tasks SET status = ?1, result = ?2, error = ?3, retry_times = ?4, \
             updated_at = ?5, running_at = ?6, finished_at = ?7, failed_at = ?8 \
             WHERE id = ?9 AND updated_at = ?10",
            params![
                task.status.as_str(),
                task.result.as_ref().map(serde_json::to_string).transpose()?,
                task.error.as_ref().map(serde_json::to_string).transpose()?,
                task.retry_times,
                task.updated_at,
                task.running_at,
                task.finished_at,
                task.failed_at,
                task.id.as_str(),
                expected_version,
            ],
        )
        .map_err(sql_err)?;
    Ok(changed == 1)
}

/// Durable task store on SQLite.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(SchedulerError::storage)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        tracing::debug!(path = %path.display(), "opened sqlite task store");
        Self::with_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        Self::with_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SchedulerError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load, transform and write back one row inside an IMMEDIATE transaction.
    fn write_versioned(
        &self,
        task: &TaskRecord,
        write: impl FnOnce(&mut TaskRecord) -> Result<(), SchedulerError>,
    ) -> Result<TaskRecord, SchedulerError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        let mut stored =
            load_task(&tx, &task.id)?.ok_or_else(|| SchedulerError::TaskNotFound(task.id.clone()))?;
        if stored.updated_at != task.updated_at {
            return Err(SchedulerError::StaleTask(task.id.clone()));
        }
        write(&mut stored)?;
        if !update_row(&tx, &stored, task.updated_at)? {
            return Err(SchedulerError::StaleTask(task.id.clone()));
        }
        tx.commit().map_err(sql_err)?;
        Ok(stored)
    }

    fn pool_tasks(
        conn: &Connection,
        status: TaskStatus,
        codes: &[String],
        order_by: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, SchedulerError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM tasks WHERE status = '{}' AND activity_code IN ({}) \
             ORDER BY {order_by} LIMIT {limit}",
            status.as_str(),
            placeholders(codes.len()),
        );
        query_tasks(conn, &sql, params_from_iter(codes.iter()))
    }

    /// Head task of each activity code for one status.
    fn heads_per_code(
        conn: &Connection,
        status: TaskStatus,
        codes: &[String],
        order_by: &str,
    ) -> Result<Vec<TaskRecord>, SchedulerError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM ( \
                SELECT *, ROW_NUMBER() OVER (PARTITION BY activity_code ORDER BY {order_by}) AS rn \
                FROM tasks WHERE status = '{}' AND activity_code IN ({}) \
             ) WHERE rn = 1",
            status.as_str(),
            placeholders(codes.len()),
        );
        query_tasks(conn, &sql, params_from_iter(codes.iter()))
    }

    fn running_codes(conn: &Connection, codes: &[String]) -> Result<Vec<String>, SchedulerError> {
        let sql = format!(
            "SELECT activity_code FROM tasks WHERE status = 'RUNNING' AND activity_code IN ({})",
            placeholders(codes.len()),
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params_from_iter(codes.iter()), |row| row.get::<_, String>(0))
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(rows)
    }
}

const RETRY_ORDER: &str = "failed_at ASC, created_at ASC, id ASC";
const IDLE_ORDER: &str = "priority DESC, created_at ASC, id ASC";

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn create_task(&self, task: NewTask, now: u64) -> Result<TaskRecord, SchedulerError> {
        let record = TaskRecord::from_new(task, now);
        insert_row(&self.conn.lock(), &record)?;
        Ok(record)
    }

    async fn insert_task(&self, task: TaskRecord) -> Result<(), SchedulerError> {
        insert_row(&self.conn.lock(), &task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, SchedulerError> {
        load_task(&self.conn.lock(), id)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, SchedulerError> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if !filter.statuses.is_empty() {
            clauses.push(format!("status IN ({})", placeholders(filter.statuses.len())));
            args.extend(filter.statuses.iter().map(|s| s.as_str().to_string()));
        }
        if let Some(code) = &filter.activity_code {
            clauses.push("activity_code = ?".to_string());
            args.push(code.clone());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT {COLUMNS} FROM tasks {where_clause} ORDER BY created_at ASC, id ASC");
        query_tasks(&self.conn.lock(), &sql, params_from_iter(args.iter()))
    }

    async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>, SchedulerError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?)))
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        rows.into_iter()
            .map(|(status, count)| {
                TaskStatus::parse(&status)
                    .map(|s| (s, count))
                    .ok_or_else(|| SchedulerError::storage(format!("unknown task status {status}")))
            })
            .collect()
    }

    async fn reset_tasks(&self, retryable_codes: &[String], now: u64) -> Result<usize, SchedulerError> {
        let retryable: HashSet<&str> = retryable_codes.iter().map(String::as_str).collect();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        let running = query_tasks(
            &tx,
            &format!("SELECT {COLUMNS} FROM tasks WHERE status = 'RUNNING'"),
            [],
        )?;
        let mut touched = 0;
        for mut task in running {
            let version = task.updated_at;
            task.mark_reset(retryable.contains(task.activity_code.as_str()), now)?;
            if update_row(&tx, &task, version)? {
                touched += 1;
            }
        }
        tx.commit().map_err(sql_err)?;
        Ok(touched)
    }

    async fn parallel_tasks(
        &self,
        codes: &[String],
        task_limit: usize,
    ) -> Result<Vec<TaskRecord>, SchedulerError> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let running = Self::running_codes(&conn, codes)?.len();
        let remaining = remaining_slots(task_limit, running);
        if remaining == 0 {
            return Ok(Vec::new());
        }
        let retry = Self::pool_tasks(&conn, TaskStatus::TemporarilyFailed, codes, RETRY_ORDER, remaining)?;
        let idle = Self::pool_tasks(&conn, TaskStatus::Idle, codes, IDLE_ORDER, remaining)?;
        Ok(select_parallel_from(running, retry, idle, task_limit))
    }

    async fn sequence_tasks(
        &self,
        codes: &[String],
        task_limit: usize,
    ) -> Result<Vec<TaskRecord>, SchedulerError> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let running = Self::running_codes(&conn, codes)?;
        if remaining_slots(task_limit, running.len()) == 0 {
            return Ok(Vec::new());
        }
        let retry = Self::heads_per_code(&conn, TaskStatus::TemporarilyFailed, codes, RETRY_ORDER)?;
        let idle = Self::heads_per_code(&conn, TaskStatus::Idle, codes, IDLE_ORDER)?;
        Ok(select_sequence_from(codes, &running, retry, idle, task_limit))
    }

    async fn start_task(&self, task: &TaskRecord, now: u64) -> Result<TaskRecord, SchedulerError> {
        self.write_versioned(task, |t| t.mark_running(now))
    }

    async fn finish_task(
        &self,
        task: &TaskRecord,
        result: Value,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        self.write_versioned(task, |t| t.mark_finished(result, now))
    }

    async fn fail_task(
        &self,
        task: &TaskRecord,
        error: ErrorSnapshot,
        activity_retryable: bool,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        self.write_versioned(task, |t| t.mark_failed(error, activity_retryable, now).map(|_| ()))
    }

    async fn expire_tasks(&self, finished_before: u64) -> Result<usize, SchedulerError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM tasks WHERE status = 'FINISHED' AND finished_at < ?1",
            params![finished_before],
        )
        .map_err(sql_err)
    }
}
