//! `conversation_cron_jobs` persistence and the run-due-jobs tick. Schema,
//! routing (system job vs `enqueue_task`), and notification fields are a
//! direct port of
//! `original_source/clawlite/runtime/conversation_cron.py::run_cron_jobs`.
//! Kept in its own SQLite file rather than the original's shared
//! `multiagent.db`, consistent with this crate's one-file-per-subsystem
//! state layout (see `src/queue/store.rs`, `src/memory/store.rs`).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::notifications::{NotificationRequest, NotificationStore};
use crate::queue::{QueueError, QueueStore};

#[derive(Debug, Error)]
pub enum CronError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("intervalSeconds deve ser maior que 0")]
    InvalidInterval,
    #[error("cron job não encontrado: {0}")]
    NotFound(i64),
    #[error("notification error: {0}")]
    Notification(#[from] crate::notifications::NotificationError),
}

#[derive(Debug, Clone)]
pub struct CronJob {
    pub id: i64,
    pub channel: String,
    pub chat_id: String,
    pub thread_id: String,
    pub label: String,
    pub name: String,
    pub text: String,
    pub interval_seconds: i64,
    pub enabled: bool,
    pub last_run_at: Option<f64>,
    pub next_run_at: f64,
    pub last_result: String,
}

#[derive(Debug, Clone)]
pub struct CronRunResult {
    pub job_id: i64,
    pub status: String,
    pub task_id: Option<i64>,
    pub message: String,
}

/// Seam for the `(channel=system, label=skills, name=auto-update)` special
/// case: invoked directly rather than routed through the task queue.
pub trait SystemJobHandler: Send + Sync {
    fn run_system_job(&self, name: &str, text: &str) -> Result<String, String>;
}

/// Enqueues a routine (non-system) job onto the task queue.
pub trait TaskEnqueuer: Send + Sync {
    fn enqueue(&self, channel: &str, chat_id: &str, thread_id: &str, label: &str, payload: serde_json::Value) -> Result<i64, QueueError>;
}

pub struct CronStore {
    db_path: PathBuf,
}

impl CronStore {
    pub fn new(state_root: impl AsRef<Path>) -> Result<Self, CronError> {
        let dir = state_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let store = CronStore { db_path: dir.join("cron.sqlite3") };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, CronError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA busy_timeout=3000;")?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<(), CronError> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversation_cron_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                thread_id TEXT NOT NULL DEFAULT '',
                label TEXT NOT NULL,
                name TEXT NOT NULL,
                text TEXT NOT NULL,
                interval_seconds INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run_at REAL,
                next_run_at REAL NOT NULL,
                last_result TEXT NOT NULL DEFAULT '',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                UNIQUE(channel, chat_id, thread_id, label, name)
            )",
            [],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_job(&self, channel: &str, chat_id: &str, thread_id: &str, label: &str, name: &str, text: &str, interval_seconds: i64, enabled: bool) -> Result<i64, CronError> {
        if interval_seconds <= 0 {
            return Err(CronError::InvalidInterval);
        }
        let ts = now_secs();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO conversation_cron_jobs
             (channel, chat_id, thread_id, label, name, text, interval_seconds, enabled, next_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(channel, chat_id, thread_id, label, name)
             DO UPDATE SET text=excluded.text, interval_seconds=excluded.interval_seconds, enabled=excluded.enabled, updated_at=excluded.updated_at",
            params![channel, chat_id, thread_id, label, name, text, interval_seconds, enabled as i64, ts + interval_seconds as f64, ts],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM conversation_cron_jobs WHERE channel=?1 AND chat_id=?2 AND thread_id=?3 AND label=?4 AND name=?5",
            params![channel, chat_id, thread_id, label, name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<CronJob> {
        Ok(CronJob {
            id: row.get(0)?,
            channel: row.get(1)?,
            chat_id: row.get(2)?,
            thread_id: row.get(3)?,
            label: row.get(4)?,
            name: row.get(5)?,
            text: row.get(6)?,
            interval_seconds: row.get(7)?,
            enabled: row.get::<_, i64>(8)? != 0,
            last_run_at: row.get(9)?,
            next_run_at: row.get(10)?,
            last_result: row.get(11)?,
        })
    }

    const COLUMNS: &'static str = "id, channel, chat_id, thread_id, label, name, text, interval_seconds, enabled, last_run_at, next_run_at, last_result";

    pub fn list_jobs(&self) -> Result<Vec<CronJob>, CronError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM conversation_cron_jobs ORDER BY channel, chat_id, thread_id, label, name", Self::COLUMNS))?;
        let rows = stmt.query_map([], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CronError::from)
    }

    pub fn remove_job(&self, job_id: i64) -> Result<bool, CronError> {
        let conn = self.connect()?;
        Ok(conn.execute("DELETE FROM conversation_cron_jobs WHERE id=?1", params![job_id])? == 1)
    }

    fn due_jobs(&self, now_ts: f64) -> Result<Vec<CronJob>, CronError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM conversation_cron_jobs WHERE enabled=1 AND next_run_at <= ?1 ORDER BY id ASC", Self::COLUMNS))?;
        let rows = stmt.query_map(params![now_ts], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CronError::from)
    }

    fn job_by_id(&self, job_id: i64) -> Result<Option<CronJob>, CronError> {
        let conn = self.connect()?;
        conn.query_row(&format!("SELECT {} FROM conversation_cron_jobs WHERE id=?1", Self::COLUMNS), params![job_id], Self::row_to_job).optional().map_err(CronError::from)
    }

    fn all_enabled(&self) -> Result<Vec<CronJob>, CronError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM conversation_cron_jobs WHERE enabled=1 ORDER BY id ASC", Self::COLUMNS))?;
        let rows = stmt.query_map([], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CronError::from)
    }

    fn mark_fired(&self, job_id: i64, now_ts: f64, next_run_at: f64, last_result: &str) -> Result<(), CronError> {
        let conn = self.connect()?;
        let truncated: String = last_result.chars().take(4000).collect();
        conn.execute(
            "UPDATE conversation_cron_jobs SET last_run_at=?1, next_run_at=?2, last_result=?3, updated_at=?4 WHERE id=?5",
            params![now_ts, next_run_at, truncated, now_ts, job_id],
        )?;
        Ok(())
    }

    /// Runs due jobs (or a single job by id, or every enabled job if
    /// `run_all`), dispatching each to `system` (for the marketplace
    /// auto-update special case) or `enqueue` (everything else), then
    /// records the outcome and emits a deduped notification.
    pub fn run_cron_jobs(
        &self,
        job_id: Option<i64>,
        run_all: bool,
        enqueue: &dyn TaskEnqueuer,
        system: &dyn SystemJobHandler,
        notifications: &NotificationStore,
    ) -> Result<Vec<CronRunResult>, CronError> {
        let now_ts = now_secs();
        let jobs = if let Some(id) = job_id {
            self.job_by_id(id)?.into_iter().collect()
        } else if run_all {
            self.all_enabled()?
        } else {
            self.due_jobs(now_ts)?
        };

        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let is_system_job = job.channel == "system" && job.label == "skills" && job.name == "auto-update";

            let (status, task_id, message, last_result) = if is_system_job {
                match system.run_system_job(&job.name, &job.text) {
                    Ok(message) => ("executed".to_string(), None, message.clone(), format!("runtime:{message}")),
                    Err(err) => ("failed".to_string(), None, err.clone(), format!("error:{err}")),
                }
            } else {
                let payload = serde_json::json!({
                    "channel": job.channel, "chat_id": job.chat_id, "thread_id": job.thread_id,
                    "label": job.label, "text": job.text, "source": "cron",
                    "cron_job_id": job.id, "cron_name": job.name,
                });
                match enqueue.enqueue(&job.channel, &job.chat_id, &job.thread_id, &job.label, payload) {
                    Ok(task_id) => ("enqueued".to_string(), Some(task_id), "ok".to_string(), format!("task:{task_id}")),
                    Err(err) => ("failed".to_string(), None, err.to_string(), format!("error:{err}")),
                }
            };

            let next_run = now_ts + job.interval_seconds as f64;
            self.mark_fired(job.id, now_ts, next_run, &last_result)?;

            let is_ok = status == "enqueued" || status == "executed";
            let dedupe_window = if job.interval_seconds > 0 { job.interval_seconds as u64 } else { 60 };
            notifications.create(NotificationRequest {
                event: &format!("cron_{status}"),
                message: &if is_ok { format!("Cron job {} -> {status} ({message})", job.name) } else { format!("Cron job {} falhou: {message}", job.name) },
                priority: Some(if is_ok { "low" } else { "high" }),
                dedupe_key: Some(&if is_ok { format!("cron:{status}:{}", job.id) } else { format!("cron:failed:{}:{message}", job.id) }),
                dedupe_window_seconds: dedupe_window.min(600),
                channel: &job.channel,
                chat_id: &job.chat_id,
                thread_id: &job.thread_id,
                label: &job.label,
                metadata: serde_json::json!({"cron_job_id": job.id, "task_id": task_id}),
            })?;

            results.push(CronRunResult { job_id: job.id, status, task_id, message });
        }
        Ok(results)
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

impl TaskEnqueuer for QueueStore {
    fn enqueue(&self, channel: &str, chat_id: &str, thread_id: &str, label: &str, payload: serde_json::Value) -> Result<i64, QueueError> {
        self.enqueue_task(channel, chat_id, thread_id, label, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct RecordingEnqueuer(std::sync::Mutex<Vec<(String, String)>>);
    impl TaskEnqueuer for RecordingEnqueuer {
        fn enqueue(&self, channel: &str, chat_id: &str, _thread_id: &str, _label: &str, _payload: serde_json::Value) -> Result<i64, QueueError> {
            self.0.lock().unwrap().push((channel.to_string(), chat_id.to_string()));
            Ok(42)
        }
    }

    struct NoSystemJobs;
    impl SystemJobHandler for NoSystemJobs {
        fn run_system_job(&self, _name: &str, _text: &str) -> Result<String, String> {
            Err("não deveria ser chamado".to_string())
        }
    }

    struct AutoUpdateHandler;
    impl SystemJobHandler for AutoUpdateHandler {
        fn run_system_job(&self, _name: &str, _text: &str) -> Result<String, String> {
            Ok("updated=2, blocked=0".to_string())
        }
    }

    #[test]
    fn add_job_rejects_nonpositive_interval() {
        let dir = tempdir().unwrap();
        let store = CronStore::new(dir.path()).unwrap();
        let err = store.add_job("telegram", "1", "", "default", "reminder", "oi", 0, true).unwrap_err();
        assert!(matches!(err, CronError::InvalidInterval));
    }

    #[test]
    fn due_job_is_enqueued_and_reschedules() {
        let dir = tempdir().unwrap();
        let store = CronStore::new(dir.path()).unwrap();
        let notifications = NotificationStore::new(dir.path()).unwrap();
        let job_id = store.add_job("telegram", "1", "", "default", "reminder", "lembrete", 60, true).unwrap();

        // force due immediately
        {
            let conn = store.connect().unwrap();
            conn.execute("UPDATE conversation_cron_jobs SET next_run_at = 0 WHERE id = ?1", params![job_id]).unwrap();
        }

        let enqueuer = RecordingEnqueuer(std::sync::Mutex::new(Vec::new()));
        let results = store.run_cron_jobs(None, false, &enqueuer, &NoSystemJobs, &notifications).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "enqueued");
        assert_eq!(results[0].task_id, Some(42));

        let job = store.list_jobs().unwrap().into_iter().next().unwrap();
        assert!(job.next_run_at > now_secs());
        assert!(job.last_run_at.is_some());
    }

    #[test]
    fn system_auto_update_job_bypasses_the_queue() {
        let dir = tempdir().unwrap();
        let store = CronStore::new(dir.path()).unwrap();
        let notifications = NotificationStore::new(dir.path()).unwrap();
        let job_id = store.add_job("system", "", "", "skills", "auto-update", "{}", 3600, true).unwrap();
        {
            let conn = store.connect().unwrap();
            conn.execute("UPDATE conversation_cron_jobs SET next_run_at = 0 WHERE id = ?1", params![job_id]).unwrap();
        }

        let enqueuer = RecordingEnqueuer(std::sync::Mutex::new(Vec::new()));
        let results = store.run_cron_jobs(None, false, &enqueuer, &AutoUpdateHandler, &notifications).unwrap();
        assert_eq!(results[0].status, "executed");
        assert!(enqueuer.0.lock().unwrap().is_empty());
    }

    #[test]
    fn not_yet_due_job_is_skipped() {
        let dir = tempdir().unwrap();
        let store = CronStore::new(dir.path()).unwrap();
        let notifications = NotificationStore::new(dir.path()).unwrap();
        store.add_job("telegram", "1", "", "default", "reminder", "oi", 3600, true).unwrap();

        let enqueuer = RecordingEnqueuer(std::sync::Mutex::new(Vec::new()));
        let results = store.run_cron_jobs(None, false, &enqueuer, &NoSystemJobs, &notifications).unwrap();
        assert!(results.is_empty());
    }
}
