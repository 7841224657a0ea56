//! Deduped notification log: the cron scheduler and heartbeat loop funnel
//! their proactive outcomes through here so a flapping job doesn't spam the
//! manager's broadcast channel. Direct port of
//! `original_source/clawlite/runtime/notifications.py`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: i64,
    pub channel: String,
    pub chat_id: String,
    pub thread_id: String,
    pub label: String,
    pub event: String,
    pub priority: String,
    pub priority_rank: i64,
    pub dedupe_key: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: f64,
}

fn priority_rank(priority: &str) -> i64 {
    match priority {
        "low" => 1,
        "high" => 3,
        _ => 2,
    }
}

pub fn normalize_priority(priority: &str) -> String {
    let value = priority.trim().to_lowercase();
    if matches!(value.as_str(), "low" | "normal" | "high") {
        value
    } else {
        "normal".to_string()
    }
}

pub fn infer_priority(event: &str) -> String {
    let value = event.trim().to_lowercase();
    if ["failed", "error", "provider_failure"].iter().any(|t| value.contains(t)) {
        "high".to_string()
    } else if ["fallback", "offline"].iter().any(|t| value.contains(t)) {
        "normal".to_string()
    } else if ["ok", "success", "enqueued"].iter().any(|t| value.contains(t)) {
        "low".to_string()
    } else {
        "normal".to_string()
    }
}

#[derive(Debug, Default)]
pub struct NotificationRequest<'a> {
    pub event: &'a str,
    pub message: &'a str,
    pub priority: Option<&'a str>,
    pub dedupe_key: Option<&'a str>,
    pub dedupe_window_seconds: u64,
    pub channel: &'a str,
    pub chat_id: &'a str,
    pub thread_id: &'a str,
    pub label: &'a str,
    pub metadata: serde_json::Value,
}

pub struct NotificationStore {
    db_path: PathBuf,
}

impl NotificationStore {
    pub fn new(state_root: impl AsRef<Path>) -> Result<Self, NotificationError> {
        let dir = state_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let store = NotificationStore { db_path: dir.join("notifications.sqlite3") };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, NotificationError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA busy_timeout=3000;")?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<(), NotificationError> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL DEFAULT '',
                chat_id TEXT NOT NULL DEFAULT '',
                thread_id TEXT NOT NULL DEFAULT '',
                label TEXT NOT NULL DEFAULT '',
                event TEXT NOT NULL,
                priority TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                dedupe_key TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_dedupe_time ON notifications (dedupe_key, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_notifications_priority_time ON notifications (priority_rank DESC, created_at DESC);",
        )?;
        Ok(())
    }

    fn default_dedupe_key(event: &str, message: &str, channel: &str, chat_id: &str, thread_id: &str, label: &str) -> String {
        let raw = [event.trim().to_lowercase(), channel.to_string(), chat_id.to_string(), thread_id.to_string(), label.to_string(), message.trim().to_lowercase()].join("|");
        crate::utils::sha256_hex(raw.as_bytes())
    }

    /// Inserts a notification unless a row with the same dedupe key fired
    /// within `dedupe_window_seconds`. Returns `(created, id)`.
    pub fn create(&self, req: NotificationRequest<'_>) -> Result<(bool, Option<i64>), NotificationError> {
        let priority = normalize_priority(req.priority.unwrap_or(&infer_priority(req.event)));
        let rank = priority_rank(&priority);
        let key = req.dedupe_key.map(str::to_string).unwrap_or_else(|| Self::default_dedupe_key(req.event, req.message, req.channel, req.chat_id, req.thread_id, req.label));
        let now = now_secs();
        let cutoff = now - req.dedupe_window_seconds as f64;

        let conn = self.connect()?;
        let dup: Option<i64> = conn
            .query_row("SELECT id FROM notifications WHERE dedupe_key=?1 AND created_at >= ?2 ORDER BY id DESC LIMIT 1", params![key, cutoff], |row| row.get(0))
            .ok();
        if dup.is_some() {
            return Ok((false, None));
        }

        conn.execute(
            "INSERT INTO notifications (channel, chat_id, thread_id, label, event, priority, priority_rank, dedupe_key, message, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![req.channel, req.chat_id, req.thread_id, req.label, req.event, priority, rank, key, req.message, req.metadata.to_string(), now],
        )?;
        Ok((true, Some(conn.last_insert_rowid())))
    }

    pub fn list(&self, limit: i64, min_priority: &str) -> Result<Vec<NotificationRow>, NotificationError> {
        let threshold = priority_rank(&normalize_priority(min_priority));
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, channel, chat_id, thread_id, label, event, priority, priority_rank, dedupe_key, message, metadata, created_at
             FROM notifications WHERE priority_rank >= ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![threshold, limit], |row| {
            let metadata_raw: String = row.get(10)?;
            Ok(NotificationRow {
                id: row.get(0)?,
                channel: row.get(1)?,
                chat_id: row.get(2)?,
                thread_id: row.get(3)?,
                label: row.get(4)?,
                event: row.get(5)?,
                priority: row.get(6)?,
                priority_rank: row.get(7)?,
                dedupe_key: row.get(8)?,
                message: row.get(9)?,
                metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
                created_at: row.get(11)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(NotificationError::from)
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn req<'a>(event: &'a str, message: &'a str) -> NotificationRequest<'a> {
        NotificationRequest { event, message, dedupe_window_seconds: 300, ..Default::default() }
    }

    #[test]
    fn creates_a_notification_with_inferred_priority() {
        let dir = tempdir().unwrap();
        let store = NotificationStore::new(dir.path()).unwrap();
        let (created, id) = store.create(req("cron_failed", "deu ruim")).unwrap();
        assert!(created);
        assert!(id.is_some());
        let rows = store.list(10, "low").unwrap();
        assert_eq!(rows[0].priority, "high");
    }

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let dir = tempdir().unwrap();
        let store = NotificationStore::new(dir.path()).unwrap();
        let (first, _) = store.create(req("cron_enqueued", "ok")).unwrap();
        let (second, _) = store.create(req("cron_enqueued", "ok")).unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(store.list(10, "low").unwrap().len(), 1);
    }

    #[test]
    fn min_priority_filters_list() {
        let dir = tempdir().unwrap();
        let store = NotificationStore::new(dir.path()).unwrap();
        store.create(req("cron_enqueued", "ok baixa")).unwrap();
        store.create(req("cron_failed", "alta")).unwrap();
        let rows = store.list(10, "high").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].priority, "high");
    }
}
