//! Per-session append-only log, one JSONL file per session rooted at
//! `<state>/sessions/<sid>.jsonl`. Contract and the "reject invalid role /
//! drop empty content" behavior are grounded on `spec.md` §4.6; the
//! file-locked-append shape is grounded on the teacher's
//! `session/manager.rs` (JSONL-per-session, `atomic_write`-on-save), adapted
//! from whole-file-rewrite-on-save to a locked line append since this
//! contract has no in-process cache to keep coherent.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::utils::safe_slug;

const VALID_ROLES: &[&str] = &["system", "user", "assistant", "tool"];

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("role inválido: '{0}'")]
    InvalidRole(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The `{role, content}` shape returned by `read`, matching the contract
/// in `spec.md` §4.6 (callers that need `ts`/`metadata` too should read
/// the JSONL file directly).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTurn {
    pub role: String,
    pub content: String,
}

pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    pub fn new(state_root: impl AsRef<Path>) -> Result<Self, SessionError> {
        let sessions_dir = state_root.as_ref().join("sessions");
        fs::create_dir_all(&sessions_dir)?;
        Ok(SessionStore { sessions_dir })
    }

    fn path_for(&self, sid: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", safe_slug(sid)))
    }

    /// Appends one record. Rejects a role outside `{system,user,assistant,
    /// tool}`; silently drops empty (post-trim) content, matching the
    /// original's "nothing worth persisting" behavior rather than erroring.
    pub fn append(&self, sid: &str, role: &str, content: &str, metadata: Option<Value>) -> Result<(), SessionError> {
        if !VALID_ROLES.contains(&role) {
            return Err(SessionError::InvalidRole(role.to_string()));
        }
        if content.trim().is_empty() {
            return Ok(());
        }

        let record = SessionRecord { ts: Utc::now(), session_id: sid.to_string(), role: role.to_string(), content: content.to_string(), metadata };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let path = self.path_for(sid);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.lock_exclusive()?;
        let result = (&file).write_all(line.as_bytes());
        let _ = file.unlock();
        result?;
        Ok(())
    }

    /// Returns the last `limit` turns as `{role, content}` pairs, oldest
    /// first. Lines that fail to parse are skipped rather than failing the
    /// whole read, since a torn append (process killed mid-write) should
    /// not make the rest of the history unreadable.
    pub fn read(&self, sid: &str, limit: usize) -> Result<Vec<SessionTurn>, SessionError> {
        let path = self.path_for(sid);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&path)?;
        let reader = std::io::BufReader::new(file);
        let mut turns = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<SessionRecord>(line) {
                turns.push(SessionTurn { role: record.role, content: record.content });
            }
        }

        if turns.len() > limit {
            let drop = turns.len() - limit;
            turns.drain(..drop);
        }
        Ok(turns)
    }

    /// Session ids are the safe-slugged values used on disk; a caller that
    /// always passes the same raw `sid` to `append`/`read`/`delete` sees a
    /// stable round trip.
    pub fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn delete(&self, sid: &str) -> Result<(), SessionError> {
        let path = self.path_for(sid);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_rejects_invalid_role() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let err = store.append("s1", "narrator", "hi", None).unwrap_err();
        assert!(matches!(err, SessionError::InvalidRole(_)));
    }

    #[test]
    fn append_drops_empty_content() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.append("s1", "user", "   ", None).unwrap();
        assert_eq!(store.read("s1", 10).unwrap().len(), 0);
    }

    #[test]
    fn append_then_read_round_trips_in_order() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.append("s1", "user", "oi", None).unwrap();
        store.append("s1", "assistant", "ola", None).unwrap();

        let turns = store.read("s1", 10).unwrap();
        assert_eq!(turns, vec![
            SessionTurn { role: "user".to_string(), content: "oi".to_string() },
            SessionTurn { role: "assistant".to_string(), content: "ola".to_string() },
        ]);
    }

    #[test]
    fn read_respects_limit_keeping_most_recent() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        for i in 0..5 {
            store.append("s1", "user", &format!("m{i}"), None).unwrap();
        }
        let turns = store.read("s1", 2).unwrap();
        assert_eq!(turns, vec![
            SessionTurn { role: "user".to_string(), content: "m3".to_string() },
            SessionTurn { role: "user".to_string(), content: "m4".to_string() },
        ]);
    }

    #[test]
    fn read_missing_session_returns_empty() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        assert!(store.read("ghost", 10).unwrap().is_empty());
    }

    #[test]
    fn list_sessions_enumerates_files() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.append("alpha", "user", "hi", None).unwrap();
        store.append("beta", "user", "hi", None).unwrap();
        let mut ids = store.list_sessions().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.append("s1", "user", "hi", None).unwrap();
        store.delete("s1").unwrap();
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn session_ids_with_unsafe_characters_are_slugged() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.append("tg:123/456", "user", "hi", None).unwrap();
        assert_eq!(store.list_sessions().unwrap(), vec!["tg_123_456".to_string()]);
    }
}
