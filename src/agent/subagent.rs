//! Bounded-concurrency subagent executor. Grounded on the teacher's
//! `agent/subagent.rs` (`Arc<Mutex<HashMap<.., JoinHandle>>>` run registry,
//! `tokio::sync::Semaphore` for `max_workers`), reworked to spawn this
//! crate's `AgentLoop::run` instead of the teacher's tool-calling mini-loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::agent::agent_loop::{AgentLoop, AgentRequest};

const RESULT_PREVIEW_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubagentStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SubagentRun {
    pub run_id: String,
    pub session_id: String,
    pub label: Option<String>,
    pub status: SubagentStatus,
    pub result_preview: Option<String>,
}

/// Invoked `(original_session_id, formatted_message)` on completion so the
/// reply flows back through the channel manager to the caller.
pub trait SubagentNotifier: Send + Sync {
    fn notify(&self, session_id: &str, message: &str);
}

struct RunEntry {
    run: SubagentRun,
    handle: Option<tokio::task::JoinHandle<()>>,
    cancel_flag: Arc<std::sync::atomic::AtomicBool>,
}

pub struct SubagentManager {
    agent: Arc<AgentLoop>,
    notifier: Arc<dyn SubagentNotifier>,
    semaphore: Arc<Semaphore>,
    runs: Arc<Mutex<HashMap<String, RunEntry>>>,
    counter: AtomicU64,
}

impl SubagentManager {
    pub fn new(agent: Arc<AgentLoop>, notifier: Arc<dyn SubagentNotifier>, max_workers: usize) -> Self {
        SubagentManager { agent, notifier, semaphore: Arc::new(Semaphore::new(max_workers.max(1))), runs: Arc::new(Mutex::new(HashMap::new())), counter: AtomicU64::new(0) }
    }

    pub async fn spawn(&self, session_id: String, task: String, label: Option<String>) -> String {
        let run_id = format!("{}-{}", self.counter.fetch_add(1, Ordering::SeqCst), Uuid::new_v4().simple());
        let derived_session_id = format!("{session_id}:subagent:{run_id}");

        let run = SubagentRun { run_id: run_id.clone(), session_id: session_id.clone(), label: label.clone(), status: SubagentStatus::Running, result_preview: None };
        let cancel_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let agent = self.agent.clone();
        let notifier = self.notifier.clone();
        let semaphore = self.semaphore.clone();
        let runs = self.runs.clone();
        let run_id_for_task = run_id.clone();
        let session_id_for_task = session_id.clone();
        let cancel_flag_for_task = cancel_flag.clone();

        let handle = tokio::spawn(async move {
            // Best-effort cancellation: a run cancelled before it acquires a
            // worker slot never executes at all.
            if cancel_flag_for_task.load(Ordering::SeqCst) {
                Self::finish(&runs, &run_id_for_task, SubagentStatus::Cancelled, None, &session_id_for_task, notifier.as_ref());
                return;
            }
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if cancel_flag_for_task.load(Ordering::SeqCst) {
                Self::finish(&runs, &run_id_for_task, SubagentStatus::Cancelled, None, &session_id_for_task, notifier.as_ref());
                return;
            }

            let req = AgentRequest { prompt: task, session_id: derived_session_id, skill: None, identity: format!("subagent:{run_id_for_task}"), can_execute_tools: true };
            match agent.run(req).await {
                Ok((text, _meta)) => Self::finish(&runs, &run_id_for_task, SubagentStatus::Done, Some(text), &session_id_for_task, notifier.as_ref()),
                Err(err) => Self::finish(&runs, &run_id_for_task, SubagentStatus::Failed, Some(err.user_message()), &session_id_for_task, notifier.as_ref()),
            }
        });

        self.runs.lock().await.insert(run_id.clone(), RunEntry { run, handle: Some(handle), cancel_flag });
        run_id
    }

    fn finish(runs: &Arc<Mutex<HashMap<String, RunEntry>>>, run_id: &str, status: SubagentStatus, result: Option<String>, session_id: &str, notifier: &dyn SubagentNotifier) {
        let preview = result.map(|text| text.chars().take(RESULT_PREVIEW_CHARS).collect::<String>());
        let runs = runs.clone();
        let run_id = run_id.to_string();
        let session_id = session_id.to_string();
        let preview_for_notify = preview.clone();
        tokio::spawn(async move {
            let mut guard = runs.lock().await;
            if let Some(entry) = guard.get_mut(&run_id) {
                entry.run.status = status;
                entry.run.result_preview = preview.clone();
            }
        });
        let message = match status {
            SubagentStatus::Done => preview_for_notify.unwrap_or_default(),
            SubagentStatus::Failed => format!("subtarefa falhou: {}", preview_for_notify.unwrap_or_default()),
            SubagentStatus::Cancelled => "subtarefa cancelada".to_string(),
            SubagentStatus::Running => return,
        };
        notifier.notify(&session_id, &message);
    }

    pub async fn status(&self, run_id: &str) -> Option<SubagentRun> {
        self.runs.lock().await.get(run_id).map(|e| e.run.clone())
    }

    /// Best-effort: flags the run cancelled and aborts its task handle if
    /// still running. A run already past its cancellation check completes
    /// normally and is marked `done`/`failed` instead.
    pub async fn cancel(&self, run_id: &str) {
        let mut guard = self.runs.lock().await;
        if let Some(entry) = guard.get_mut(run_id) {
            entry.cancel_flag.store(true, Ordering::SeqCst);
            if entry.run.status == SubagentStatus::Running {
                if let Some(handle) = entry.handle.take() {
                    handle.abort();
                }
                entry.run.status = SubagentStatus::Cancelled;
            }
        }
    }

    /// Walks the run index and cancels every run for `session_id`.
    pub async fn cancel_session(&self, session_id: &str) {
        let ids: Vec<String> = self.runs.lock().await.iter().filter(|(_, e)| e.run.session_id == session_id).map(|(id, _)| id.clone()).collect();
        for id in ids {
            self.cancel(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::providers::base::{ChatRequest, LLMProvider, LLMResponse};
    use crate::session::SessionStore;
    use crate::trust::policy::ToolPolicyEngine;
    use crate::agent::tools::ToolRegistry;
    use crate::agent::workspace::Workspace;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct EchoProvider;
    #[async_trait]
    impl LLMProvider for EchoProvider {
        async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
            let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(LLMResponse { content: Some(format!("done: {last}")), ..Default::default() })
        }
        fn default_model(&self) -> &str {
            "test-model"
        }
    }

    struct RecordingNotifier {
        messages: StdMutex<Vec<(String, String)>>,
    }
    impl SubagentNotifier for RecordingNotifier {
        fn notify(&self, session_id: &str, message: &str) {
            self.messages.lock().unwrap().push((session_id.to_string(), message.to_string()));
        }
    }

    fn build_manager(dir: &std::path::Path, notifier: Arc<RecordingNotifier>) -> SubagentManager {
        let workspace = Workspace::new(dir.join("workspace"));
        let sessions = Arc::new(SessionStore::new(dir).unwrap());
        let memory = Arc::new(MemoryStore::new(dir).unwrap());
        let tools = Arc::new(ToolRegistry::new());
        let provider: Arc<dyn LLMProvider> = Arc::new(EchoProvider);
        let policy = ToolPolicyEngine::new(HashMap::new());
        let agent = Arc::new(AgentLoop::new(workspace, sessions, memory, tools, provider, policy, "openai/gpt-4o-mini"));
        SubagentManager::new(agent, notifier, 2)
    }

    #[tokio::test]
    async fn spawn_completes_and_notifies_original_session() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier { messages: StdMutex::new(Vec::new()) });
        let manager = build_manager(dir.path(), notifier.clone());

        let run_id = manager.spawn("session-1".to_string(), "faça algo".to_string(), Some("demo".to_string())).await;

        for _ in 0..50 {
            if let Some(run) = manager.status(&run_id).await {
                if run.status != SubagentStatus::Running {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let run = manager.status(&run_id).await.unwrap();
        assert_eq!(run.status, SubagentStatus::Done);
        assert!(run.result_preview.unwrap().contains("faça algo"));

        let notified = notifier.messages.lock().unwrap();
        assert_eq!(notified[0].0, "session-1");
    }

    #[tokio::test]
    async fn cancel_session_marks_all_its_runs_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier { messages: StdMutex::new(Vec::new()) });
        let manager = build_manager(dir.path(), notifier);

        let run_id = manager.spawn("session-2".to_string(), "tarefa lenta".to_string(), None).await;
        manager.cancel_session("session-2").await;

        let run = manager.status(&run_id).await.unwrap();
        assert!(matches!(run.status, SubagentStatus::Cancelled | SubagentStatus::Done));
    }
}
