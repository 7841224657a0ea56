//! Persistent SQLite-backed task queue: `workers` are supervised subprocess
//! slots keyed by `(channel, chat_id, thread_id, label)`; `tasks` are queued
//! payloads claimed by exactly one worker. Schema, atomic claim, and the
//! zombie-as-dead PID liveness check are a direct port of
//! `original_source/clawlite/runtime/multiagent.py`; connection/pragma
//! style grounded on the teacher's `agent/memory/memory_db.rs`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker não encontrado: {0}")]
    WorkerNotFound(i64),
    #[error("nenhum worker ativo para {channel}/{chat_id}/{thread_id}/{label}")]
    NoActiveWorker { channel: String, chat_id: String, thread_id: String, label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Running,
}

impl WorkerStatus {
    fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Running => "running",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => WorkerStatus::Running,
            _ => WorkerStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Queued,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub id: i64,
    pub channel: String,
    pub chat_id: String,
    pub thread_id: String,
    pub label: String,
    pub command_template: String,
    pub enabled: bool,
    pub pid: Option<i32>,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub channel: String,
    pub chat_id: String,
    pub thread_id: String,
    pub label: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub worker_id: Option<i64>,
    pub result: Option<String>,
}

const MAX_RESULT_CHARS: usize = 4000;

pub struct QueueStore {
    db_path: PathBuf,
}

impl QueueStore {
    pub fn new(state_root: impl AsRef<Path>) -> Result<Self, QueueError> {
        let dir = state_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let store = QueueStore { db_path: dir.join("queue.sqlite3") };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, QueueError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=3000;")?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<(), QueueError> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                thread_id TEXT NOT NULL DEFAULT '',
                label TEXT NOT NULL,
                command_template TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                pid INTEGER,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                UNIQUE(channel, chat_id, thread_id, label)
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                thread_id TEXT NOT NULL DEFAULT '',
                label TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                result TEXT,
                worker_id INTEGER,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn upsert_worker(&self, channel: &str, chat_id: &str, thread_id: &str, label: &str, command_template: &str, enabled: bool) -> Result<i64, QueueError> {
        let ts = now_secs();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO workers (channel, chat_id, thread_id, label, command_template, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(channel, chat_id, thread_id, label)
             DO UPDATE SET command_template=excluded.command_template, enabled=excluded.enabled, updated_at=excluded.updated_at",
            params![channel, chat_id, thread_id, label, command_template, enabled as i64, ts],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM workers WHERE channel=?1 AND chat_id=?2 AND thread_id=?3 AND label=?4",
            params![channel, chat_id, thread_id, label],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn row_to_worker(row: &rusqlite::Row) -> rusqlite::Result<Worker> {
        Ok(Worker {
            id: row.get(0)?,
            channel: row.get(1)?,
            chat_id: row.get(2)?,
            thread_id: row.get(3)?,
            label: row.get(4)?,
            command_template: row.get(5)?,
            enabled: row.get::<_, i64>(6)? != 0,
            pid: row.get::<_, Option<i64>>(7)?.map(|p| p as i32),
            status: WorkerStatus::parse(&row.get::<_, String>(8)?),
        })
    }

    const WORKER_COLUMNS: &'static str = "id, channel, chat_id, thread_id, label, command_template, enabled, pid, status";

    /// Lists workers, normalizing the liveness-checked `pid`/`status` the
    /// same way the original's `list_workers` does: a recorded pid that is
    /// no longer live (including zombie/defunct) is reported as stopped.
    pub fn list_workers(&self) -> Result<Vec<Worker>, QueueError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM workers ORDER BY channel, chat_id, thread_id, label", Self::WORKER_COLUMNS))?;
        let rows = stmt.query_map([], Self::row_to_worker)?;
        let mut out = Vec::new();
        for row in rows {
            let mut w = row?;
            if let Some(pid) = w.pid {
                if !is_pid_running(pid) {
                    w.pid = None;
                    w.status = WorkerStatus::Stopped;
                }
            }
            out.push(w);
        }
        Ok(out)
    }

    pub fn get_worker(&self, worker_id: i64) -> Result<Worker, QueueError> {
        let conn = self.connect()?;
        conn.query_row(&format!("SELECT {} FROM workers WHERE id=?1", Self::WORKER_COLUMNS), params![worker_id], Self::row_to_worker)
            .optional()?
            .ok_or(QueueError::WorkerNotFound(worker_id))
    }

    pub fn set_worker_runtime(&self, worker_id: i64, pid: Option<i32>, status: WorkerStatus, enabled: Option<bool>) -> Result<(), QueueError> {
        let conn = self.connect()?;
        match enabled {
            Some(enabled) => conn.execute(
                "UPDATE workers SET pid=?1, status=?2, enabled=?3, updated_at=?4 WHERE id=?5",
                params![pid, status.as_str(), enabled as i64, now_secs(), worker_id],
            )?,
            None => conn.execute("UPDATE workers SET pid=?1, status=?2, updated_at=?3 WHERE id=?4", params![pid, status.as_str(), now_secs(), worker_id])?,
        };
        Ok(())
    }

    /// Restarts every enabled worker whose recorded pid is not live. The
    /// actual respawn (spawning the worker subprocess) is the caller's
    /// responsibility via `on_restart`; this just identifies candidates and
    /// clears their stale runtime row so `on_restart` can call
    /// `set_worker_runtime` with the freshly spawned pid.
    pub fn workers_needing_recovery(&self) -> Result<Vec<Worker>, QueueError> {
        let workers = self.list_workers()?;
        Ok(workers.into_iter().filter(|w| w.enabled && w.pid.is_none()).collect())
    }

    pub fn enqueue_task(&self, channel: &str, chat_id: &str, thread_id: &str, label: &str, payload: serde_json::Value) -> Result<i64, QueueError> {
        let conn = self.connect()?;
        let has_worker: Option<i64> = conn
            .query_row(
                "SELECT id FROM workers WHERE channel=?1 AND chat_id=?2 AND thread_id=?3 AND label=?4 AND enabled=1",
                params![channel, chat_id, thread_id, label],
                |row| row.get(0),
            )
            .optional()?;
        if has_worker.is_none() {
            return Err(QueueError::NoActiveWorker { channel: channel.to_string(), chat_id: chat_id.to_string(), thread_id: thread_id.to_string(), label: label.to_string() });
        }

        let ts = now_secs();
        conn.execute(
            "INSERT INTO tasks (channel, chat_id, thread_id, label, payload, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![channel, chat_id, thread_id, label, payload.to_string(), ts],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let payload_raw: String = row.get(5)?;
        Ok(Task {
            id: row.get(0)?,
            channel: row.get(1)?,
            chat_id: row.get(2)?,
            thread_id: row.get(3)?,
            label: row.get(4)?,
            payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
            status: TaskStatus::parse(&row.get::<_, String>(6)?),
            worker_id: row.get(7)?,
            result: row.get(8)?,
        })
    }

    const TASK_COLUMNS: &'static str = "id, channel, chat_id, thread_id, label, payload, status, worker_id, result";

    /// Oldest queued task matching the worker's routing key.
    pub fn next_task(&self, worker: &Worker) -> Result<Option<Task>, QueueError> {
        let conn = self.connect()?;
        let task = conn
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE status='queued' AND channel=?1 AND chat_id=?2 AND thread_id=?3 AND label=?4 ORDER BY id ASC LIMIT 1",
                    Self::TASK_COLUMNS
                ),
                params![worker.channel, worker.chat_id, worker.thread_id, worker.label],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Atomically flips a `queued` task to `running` for `worker_id`.
    /// Returns `true` only for the single caller that won the race.
    pub fn claim_task(&self, task_id: i64, worker_id: i64) -> Result<bool, QueueError> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE tasks SET status='running', worker_id=?1, updated_at=?2 WHERE id=?3 AND status='queued'",
            params![worker_id, now_secs(), task_id],
        )?;
        Ok(updated == 1)
    }

    pub fn finish_task(&self, task_id: i64, ok: bool, result: &str) -> Result<(), QueueError> {
        let truncated: String = result.chars().take(MAX_RESULT_CHARS).collect();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE tasks SET status=?1, result=?2, updated_at=?3 WHERE id=?4",
            params![if ok { TaskStatus::Done.as_str() } else { TaskStatus::Failed.as_str() }, truncated, now_secs(), task_id],
        )?;
        Ok(())
    }

    pub fn list_tasks(&self, limit: i64) -> Result<Vec<Task>, QueueError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks ORDER BY id DESC LIMIT ?1", Self::TASK_COLUMNS))?;
        let rows = stmt.query_map(params![limit], Self::row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(QueueError::from)
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Probes OS process liveness by `kill(pid, 0)`, then treats zombie/defunct
/// (`State: Z` in `/proc/<pid>/status`) as dead too — otherwise the
/// recovery sweep never fires for a worker whose process exited but was
/// never reaped.
#[cfg(target_os = "linux")]
pub fn is_pid_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/status")) {
        Ok(status) => {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("State:") {
                    return !rest.trim_start().starts_with('Z');
                }
            }
            true
        }
        Err(_) => true,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn is_pid_running(pid: i32) -> bool {
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn enqueue_without_active_worker_errors() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path()).unwrap();
        let err = store.enqueue_task("telegram", "123", "", "default", serde_json::json!({"text": "oi"})).unwrap_err();
        assert!(matches!(err, QueueError::NoActiveWorker { .. }));
    }

    #[test]
    fn upsert_worker_then_enqueue_and_claim() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path()).unwrap();
        let worker_id = store.upsert_worker("telegram", "123", "", "default", "echo {text}", true).unwrap();
        let task_id = store.enqueue_task("telegram", "123", "", "default", serde_json::json!({"text": "oi"})).unwrap();

        let worker = store.get_worker(worker_id).unwrap();
        let task = store.next_task(&worker).unwrap().unwrap();
        assert_eq!(task.id, task_id);
        assert!(store.claim_task(task_id, worker_id).unwrap());
        // second claim attempt loses the race
        assert!(!store.claim_task(task_id, worker_id).unwrap());
    }

    #[test]
    fn finish_task_truncates_long_results() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path()).unwrap();
        store.upsert_worker("telegram", "1", "", "default", "echo {text}", true).unwrap();
        let task_id = store.enqueue_task("telegram", "1", "", "default", serde_json::json!({"text": "oi"})).unwrap();
        store.claim_task(task_id, 1).unwrap();

        let huge = "x".repeat(5000);
        store.finish_task(task_id, true, &huge).unwrap();
        let task = store.list_tasks(10).unwrap().into_iter().find(|t| t.id == task_id).unwrap();
        assert_eq!(task.result.unwrap().len(), 4000);
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[test]
    fn workers_needing_recovery_excludes_disabled() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path()).unwrap();
        let enabled_id = store.upsert_worker("telegram", "1", "", "a", "echo {text}", true).unwrap();
        store.upsert_worker("telegram", "2", "", "b", "echo {text}", false).unwrap();

        let pending = store.workers_needing_recovery().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, enabled_id);
    }

    #[test]
    fn is_pid_running_rejects_nonpositive_pid() {
        assert!(!is_pid_running(0));
        assert!(!is_pid_running(-1));
    }
}
