//! HEARTBEAT.md-driven proactive loop. Direct port of
//! `original_source/clawlite/core/heartbeat.py`'s `HeartbeatLoop` /
//! `AsyncHeartbeatLoop`, reconciled into one async implementation the same
//! way `cron::scheduler::CronScheduler` reconciles its sync/async pair.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::notifications::{NotificationRequest, NotificationStore};

pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";
const DEFAULT_INTERVAL_SECS: u64 = 1800;
const STATE_RESULT_TRUNCATE_CHARS: usize = 200;
const NOTIFICATION_TRUNCATE_CHARS: usize = 500;

pub fn is_effectively_empty(content: &str) -> bool {
    content.lines().all(|line| {
        let trimmed = line.trim();
        trimmed.is_empty() || trimmed.starts_with('#')
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatState {
    last_run: Option<String>,
    last_result: Option<String>,
    runs_today: i64,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        HeartbeatState { last_run: None, last_result: None, runs_today: 0 }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

/// Seam for the two-phase agent call the original routes through
/// `run_task_with_learning`: a cheap decide pass ("skip" or "run" plus a
/// short task summary), then, only if warranted, a full execution pass.
pub trait HeartbeatAgent: Send + Sync {
    fn decide(&self, heartbeat_md: &str) -> Result<String, String>;
    fn execute(&self, prompt: &str) -> Result<String, String>;
}

#[async_trait::async_trait]
pub trait ProactiveSink: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), String>;
}

/// Last-resort delivery path when no `proactive_callback` is wired up,
/// matching the original's `_send_telegram_proactive`.
pub struct TelegramProactiveSink {
    token: String,
    chat_id: String,
}

impl TelegramProactiveSink {
    pub fn from_config(cfg: &Config) -> Option<Self> {
        let tg = cfg.channels.telegram.as_ref()?;
        let chat_id = tg.base.chat_id.clone().unwrap_or_default();
        if tg.base.token.trim().is_empty() || chat_id.trim().is_empty() {
            return None;
        }
        Some(TelegramProactiveSink { token: tg.base.token.clone(), chat_id })
    }
}

#[async_trait::async_trait]
impl ProactiveSink for TelegramProactiveSink {
    async fn send(&self, message: &str) -> Result<(), String> {
        let client = crate::utils::http::shared_client();
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let text = format!("[heartbeat] {message}");
        client
            .post(&url)
            .json(&serde_json::json!({"chat_id": self.chat_id, "text": text}))
            .send()
            .await
            .map_err(|err| err.to_string())?;
        Ok(())
    }
}

enum Decision {
    Skip { raw: String },
    Run { tasks: String },
}

fn extract_decision(raw: &str) -> Decision {
    let trimmed = raw.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(str::trim)
        .map(|s| s.strip_suffix("```").map(str::trim).unwrap_or(s))
        .unwrap_or(trimmed);

    let parsed: Option<serde_json::Value> = serde_json::from_str(candidate).ok().or_else(|| {
        let start = candidate.find('{')?;
        let end = candidate.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&candidate[start..=end]).ok()
    });

    if let Some(serde_json::Value::Object(obj)) = parsed {
        let action = obj.get("action").and_then(|v| v.as_str()).unwrap_or("skip").trim().to_lowercase();
        let tasks = obj.get("tasks").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
        return if action == "run" { Decision::Run { tasks } } else { Decision::Skip { raw: raw.to_string() } };
    }

    if trimmed == HEARTBEAT_OK {
        Decision::Skip { raw: trimmed.to_string() }
    } else {
        Decision::Run { tasks: trimmed.to_string() }
    }
}

pub struct HeartbeatLoop {
    heartbeat_file: PathBuf,
    state_file: PathBuf,
    interval_secs: u64,
    agent: Arc<dyn HeartbeatAgent>,
    notifications: Arc<NotificationStore>,
    proactive: Arc<dyn ProactiveSink>,
    running: Arc<AtomicBool>,
}

impl HeartbeatLoop {
    pub fn new(workspace_path: impl AsRef<Path>, agent: Arc<dyn HeartbeatAgent>, notifications: Arc<NotificationStore>, proactive: Arc<dyn ProactiveSink>) -> Self {
        let root = workspace_path.as_ref().to_path_buf();
        HeartbeatLoop {
            heartbeat_file: root.join("HEARTBEAT.md"),
            state_file: root.join("memory").join("heartbeat-state.json"),
            interval_secs: DEFAULT_INTERVAL_SECS,
            agent,
            notifications,
            proactive,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs.max(1);
        self
    }

    fn load_state(&self) -> HeartbeatState {
        std::fs::read_to_string(&self.state_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_state(&self, last_result: &str, runs_today: i64) -> std::io::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = HeartbeatState {
            last_run: Some(Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
            last_result: Some(last_result.to_string()),
            runs_today,
        };
        std::fs::write(&self.state_file, serde_json::to_string_pretty(&state).unwrap_or_default())
    }

    fn runs_today(&self, state: &HeartbeatState) -> i64 {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        match &state.last_run {
            Some(last_run) if last_run.get(0..10) == Some(today.as_str()) => state.runs_today + 1,
            _ => 1,
        }
    }

    /// One full decide/execute pass. Returns `Ok(true)` if a proactive
    /// notification was emitted, `Ok(false)` for a silent (skip or
    /// `HEARTBEAT_OK`) cycle.
    pub async fn run_once(&self) -> Result<bool, String> {
        let content = match std::fs::read_to_string(&self.heartbeat_file) {
            Ok(content) => content,
            Err(_) => {
                info!("heartbeat: HEARTBEAT.md não encontrado, pulando ciclo");
                return Ok(false);
            }
        };
        if is_effectively_empty(&content) {
            info!("heartbeat: HEARTBEAT.md vazio/comentários, silêncio");
            return Ok(false);
        }

        let decision_raw = self.agent.decide(&content).map_err(|err| {
            warn!("heartbeat: erro ao chamar agente — {err}");
            err
        })?;

        let tasks = match extract_decision(&decision_raw) {
            Decision::Skip { raw } => {
                let response_clean = if raw.trim() == HEARTBEAT_OK { HEARTBEAT_OK.to_string() } else { "HEARTBEAT_SKIP".to_string() };
                let state = self.load_state();
                let runs_today = self.runs_today(&state);
                let _ = self.save_state(&response_clean, runs_today);
                info!("heartbeat: decisão=skip — silêncio");
                return Ok(false);
            }
            Decision::Run { tasks } => tasks,
        };

        let execution_prompt = if tasks.trim().is_empty() { content.clone() } else { tasks };
        let response = match self.agent.execute(&execution_prompt) {
            Ok(response) => response,
            Err(err) => {
                warn!("heartbeat: erro na fase de execução — {err}");
                return Ok(false);
            }
        };

        let response_clean = {
            let trimmed = response.trim();
            if trimmed.is_empty() { "HEARTBEAT_RUN_EMPTY".to_string() } else { trimmed.to_string() }
        };
        let last_result = truncate_chars(&response_clean, STATE_RESULT_TRUNCATE_CHARS);

        let state = self.load_state();
        let runs_today = self.runs_today(&state);
        let _ = self.save_state(&last_result, runs_today);

        if response_clean == HEARTBEAT_OK {
            info!("heartbeat: HEARTBEAT_OK — silêncio");
            return Ok(false);
        }

        info!("heartbeat: resposta não-OK, criando notificação");
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let dedupe_key = format!("heartbeat:{today}:{}", crate::utils::sha256_hex(response_clean.as_bytes()).get(0..10).unwrap_or_default());
        if let Err(err) = self.notifications.create(NotificationRequest {
            event: "heartbeat.response",
            message: &truncate_chars(&response_clean, NOTIFICATION_TRUNCATE_CHARS),
            priority: Some("normal"),
            dedupe_key: Some(&dedupe_key),
            dedupe_window_seconds: 300,
            ..Default::default()
        }) {
            warn!("heartbeat: erro ao criar notificação — {err}");
        }

        if let Err(err) = self.proactive.send(&response_clean).await {
            warn!("heartbeat: falha no envio proativo — {err}");
        }

        Ok(true)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self, cfg: &Config) {
        self.running.store(true, Ordering::SeqCst);
        info!(interval_secs = self.interval_secs, "heartbeat: loop iniciado");
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.run_once().await {
                warn!("heartbeat: exceção não tratada em run_once — {err}");
            }
            let delay = cfg.battery_mode.effective_poll_seconds(self.interval_secs as f64);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        info!("heartbeat: loop encerrado");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FixedAgent {
        decide_response: String,
        execute_response: String,
    }
    impl HeartbeatAgent for FixedAgent {
        fn decide(&self, _content: &str) -> Result<String, String> {
            Ok(self.decide_response.clone())
        }
        fn execute(&self, _prompt: &str) -> Result<String, String> {
            Ok(self.execute_response.clone())
        }
    }

    struct RecordingSink(Mutex<Vec<String>>);
    #[async_trait::async_trait]
    impl ProactiveSink for RecordingSink {
        async fn send(&self, message: &str) -> Result<(), String> {
            self.0.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn write_heartbeat_md(dir: &Path, content: &str) {
        std::fs::write(dir.join("HEARTBEAT.md"), content).unwrap();
    }

    #[test]
    fn comment_only_file_is_effectively_empty() {
        assert!(is_effectively_empty("# just a note\n\n# another\n"));
        assert!(!is_effectively_empty("# note\ncheck the mailbox\n"));
    }

    #[tokio::test]
    async fn missing_file_is_a_silent_cycle() {
        let dir = tempdir().unwrap();
        let notifications = Arc::new(NotificationStore::new(dir.path()).unwrap());
        let agent = Arc::new(FixedAgent { decide_response: "{}".into(), execute_response: String::new() });
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let hb = HeartbeatLoop::new(dir.path(), agent, notifications, sink.clone());
        assert!(!hb.run_once().await.unwrap());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn skip_decision_is_silent_and_persists_state() {
        let dir = tempdir().unwrap();
        write_heartbeat_md(dir.path(), "check inbox for overdue tasks");
        let notifications = Arc::new(NotificationStore::new(dir.path()).unwrap());
        let agent = Arc::new(FixedAgent { decide_response: r#"{"action":"skip","tasks":""}"#.into(), execute_response: String::new() });
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let hb = HeartbeatLoop::new(dir.path(), agent, notifications, sink.clone());
        assert!(!hb.run_once().await.unwrap());
        assert!(sink.0.lock().unwrap().is_empty());
        assert!(dir.path().join("memory/heartbeat-state.json").exists());
    }

    #[tokio::test]
    async fn run_decision_with_ok_result_is_silent() {
        let dir = tempdir().unwrap();
        write_heartbeat_md(dir.path(), "ping connectivity check");
        let notifications = Arc::new(NotificationStore::new(dir.path()).unwrap());
        let agent = Arc::new(FixedAgent { decide_response: r#"{"action":"run","tasks":"ping"}"#.into(), execute_response: HEARTBEAT_OK.into() });
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let hb = HeartbeatLoop::new(dir.path(), agent, notifications, sink.clone());
        assert!(!hb.run_once().await.unwrap());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_decision_with_real_output_notifies_and_sends() {
        let dir = tempdir().unwrap();
        write_heartbeat_md(dir.path(), "summarize overnight alerts");
        let notifications = Arc::new(NotificationStore::new(dir.path()).unwrap());
        let agent = Arc::new(FixedAgent { decide_response: r#"{"action":"run","tasks":"summarize"}"#.into(), execute_response: "3 alerts fired overnight".into() });
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let hb = HeartbeatLoop::new(dir.path(), agent, notifications.clone(), sink.clone());
        assert!(hb.run_once().await.unwrap());
        assert_eq!(sink.0.lock().unwrap().as_slice(), &["3 alerts fired overnight".to_string()]);
        assert_eq!(notifications.list(10, "low").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn legacy_heartbeat_ok_token_is_treated_as_skip() {
        let dir = tempdir().unwrap();
        write_heartbeat_md(dir.path(), "legacy skill still in token mode");
        let notifications = Arc::new(NotificationStore::new(dir.path()).unwrap());
        let agent = Arc::new(FixedAgent { decide_response: HEARTBEAT_OK.into(), execute_response: String::new() });
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let hb = HeartbeatLoop::new(dir.path(), agent, notifications, sink.clone());
        assert!(!hb.run_once().await.unwrap());
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
