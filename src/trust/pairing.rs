//! Pairing store: first-contact handshake gating unknown senders.
//!
//! Algorithm shape (file-locked JSON store, per-client lockout, constant-
//! time code compare) is grounded on
//! `examples/oxicrab-oxicrab/src/pairing/mod.rs`; the constants (6-char
//! code, full `A-Z0-9` alphabet, 24h TTL) are grounded on
//! `original_source/clawlite/runtime/pairing.py`, which the teacher's own
//! incidental 8-char/15-minute constants disagree with (see
//! `SPEC_FULL.md` §4.18).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

pub const CODE_LENGTH: usize = 6;
pub const CODE_TTL_SECS: u64 = 24 * 60 * 60;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    pub channel: String,
    pub peer_id: String,
    pub display: String,
    pub code: String,
    pub created_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PairingData {
    #[serde(default)]
    pending: Vec<PendingRequest>,
    #[serde(default)]
    approved: HashMap<String, Vec<String>>,
    #[serde(default)]
    failed_attempts: HashMap<String, (u32, u64)>,
}

pub struct PairingStore {
    path: PathBuf,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl PairingStore {
    pub fn new(path: PathBuf) -> Self {
        PairingStore { path }
    }

    fn load(&self) -> PairingData {
        let Ok(raw) = fs::read_to_string(&self.path) else { return PairingData::default() };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn save_locked(&self, data: &PairingData) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = self.path.with_extension("lock");
        let lock_file = fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
        lock_file.lock_exclusive()?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(data)?)?;
        fs::rename(&tmp_path, &self.path)?;
        lock_file.unlock()?;
        Ok(())
    }

    fn generate_code(&self) -> String {
        (0..CODE_LENGTH)
            .map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char)
            .collect()
    }

    fn prune_expired(&self, data: &mut PairingData) {
        let now = now_secs();
        data.pending.retain(|p| now.saturating_sub(p.created_at) < CODE_TTL_SECS);
    }

    /// Issues a new pairing code for `(channel, peer_id)`, or returns the
    /// existing unexpired one.
    pub fn issue_or_fetch(&self, channel: &str, peer_id: &str, display: &str) -> anyhow::Result<PendingRequest> {
        let mut data = self.load();
        self.prune_expired(&mut data);

        if let Some(existing) = data.pending.iter().find(|p| p.channel == channel && p.peer_id.eq_ignore_ascii_case(peer_id)) {
            return Ok(existing.clone());
        }

        let request = PendingRequest {
            channel: channel.to_string(),
            peer_id: peer_id.to_string(),
            display: display.to_string(),
            code: self.generate_code(),
            created_at: now_secs(),
        };
        data.pending.push(request.clone());
        self.save_locked(&data)?;
        Ok(request)
    }

    /// Approves a pending code for `channel`. Pops the matching pending
    /// entry and promotes `peer_id` into the approved set (case-insensitive
    /// dedupe). Second call for the same already-consumed code fails with
    /// `None`.
    pub fn approve(&self, channel: &str, code: &str, client_key: &str) -> anyhow::Result<Option<PendingRequest>> {
        let mut data = self.load();
        self.prune_expired(&mut data);

        if self.is_locked_out(&data, client_key) {
            return Ok(None);
        }

        let Some(idx) = data
            .pending
            .iter()
            .position(|p| p.channel == channel && constant_time_code_eq(&p.code, code))
        else {
            self.record_failure(&mut data, client_key);
            self.save_locked(&data)?;
            return Ok(None);
        };

        let request = data.pending.remove(idx);
        let approved = data.approved.entry(channel.to_string()).or_default();
        if !approved.iter().any(|p| p.eq_ignore_ascii_case(&request.peer_id)) {
            approved.push(request.peer_id.clone());
        }
        data.failed_attempts.remove(client_key);
        self.save_locked(&data)?;
        Ok(Some(request))
    }

    pub fn reject(&self, channel: &str, code: &str) -> anyhow::Result<bool> {
        let mut data = self.load();
        self.prune_expired(&mut data);
        let before = data.pending.len();
        data.pending.retain(|p| !(p.channel == channel && constant_time_code_eq(&p.code, code)));
        let changed = data.pending.len() != before;
        if changed {
            self.save_locked(&data)?;
        }
        Ok(changed)
    }

    pub fn is_approved(&self, channel: &str, peer_id: &str) -> bool {
        let data = self.load();
        data.approved.get(channel).map(|list| list.iter().any(|p| p.eq_ignore_ascii_case(peer_id))).unwrap_or(false)
    }

    fn is_locked_out(&self, data: &PairingData, client_key: &str) -> bool {
        data.failed_attempts
            .get(client_key)
            .map(|(count, since)| *count >= MAX_FAILED_ATTEMPTS && now_secs().saturating_sub(*since) < LOCKOUT_SECS)
            .unwrap_or(false)
    }

    fn record_failure(&self, data: &mut PairingData, client_key: &str) {
        let entry = data.failed_attempts.entry(client_key.to_string()).or_insert((0, now_secs()));
        entry.0 += 1;
        if entry.0 == 1 {
            entry.1 = now_secs();
        }
    }
}

fn constant_time_code_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Candidate-based allow check: §4.3 step 2/3 of the Trust Gate.
pub fn is_sender_allowed(pairing_enabled: bool, configured_allowlist: &[String], approved: &dyn Fn(&str) -> bool, candidates: &[String]) -> bool {
    if !pairing_enabled {
        if configured_allowlist.is_empty() {
            return true;
        }
        return candidates.iter().any(|c| configured_allowlist.iter().any(|a| a.eq_ignore_ascii_case(c)));
    }
    candidates.iter().any(|c| configured_allowlist.iter().any(|a| a.eq_ignore_ascii_case(c)) || approved(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> PairingStore {
        PairingStore::new(dir.join("pairing.json"))
    }

    #[test]
    fn issue_then_approve_promotes_peer() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let req = store.issue_or_fetch("telegram", "user-alpha", "Alpha").unwrap();
        assert_eq!(req.code.len(), CODE_LENGTH);
        assert!(req.code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        let approved = store.approve("telegram", &req.code, "client-1").unwrap().unwrap();
        assert_eq!(approved.peer_id, "user-alpha");
        assert!(store.is_approved("telegram", "user-alpha"));
    }

    #[test]
    fn approving_twice_fails_second_time() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let req = store.issue_or_fetch("telegram", "user-beta", "Beta").unwrap();
        assert!(store.approve("telegram", &req.code, "client-1").unwrap().is_some());
        assert!(store.approve("telegram", &req.code, "client-1").unwrap().is_none());
    }

    #[test]
    fn empty_allowlist_with_pairing_disabled_allows_everyone() {
        assert!(is_sender_allowed(false, &[], &|_| false, &["anyone".to_string()]));
    }

    #[test]
    fn disabled_pairing_with_allowlist_requires_membership() {
        let allow = vec!["alice".to_string()];
        assert!(is_sender_allowed(false, &allow, &|_| false, &["alice".to_string()]));
        assert!(!is_sender_allowed(false, &allow, &|_| false, &["mallory".to_string()]));
    }

    #[test]
    fn lockout_blocks_repeated_wrong_codes() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.issue_or_fetch("telegram", "user-gamma", "Gamma").unwrap();
        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = store.approve("telegram", "WRONG1", "client-x").unwrap();
        }
        let result = store.approve("telegram", "WRONG1", "client-x").unwrap();
        assert!(result.is_none());
    }
}
