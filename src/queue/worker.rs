//! Worker subprocess supervision: argv-safe command rendering and the
//! polling loop a spawned worker process runs. Rendering is deliberately
//! NOT `original_source/clawlite/runtime/multiagent.py::_render_command` +
//! `shell=True` — `spec.md` §4.8 calls for "argv-safe substitution... no
//! shell metacharacter expansion", so the template is split into argv
//! tokens first and placeholders are substituted per-token, which means
//! user-controlled field values can never introduce a new token boundary
//! or be interpreted by a shell (there is none).

use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::queue::store::{QueueStore, Worker, WorkerStatus};

const MAX_RENDERED_OUTPUT_CHARS: usize = 4000;

/// Splits `template` on whitespace, then substitutes `{field}` occurrences
/// — whether a token is exactly a placeholder or embeds one among literal
/// text — with the matching value from `fields`. An unknown placeholder is
/// left as literal text.
pub fn render_command_argv(template: &str, fields: &[(&str, &str)]) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            let mut rendered = token.to_string();
            for (name, value) in fields {
                rendered = rendered.replace(&format!("{{{name}}}"), value);
            }
            rendered
        })
        .collect()
}

fn payload_fields(payload: &serde_json::Value) -> Vec<(String, String)> {
    let get = |key: &str, default: &str| payload.get(key).and_then(|v| v.as_str()).unwrap_or(default).to_string();
    vec![
        ("text".to_string(), get("text", "")),
        ("label".to_string(), get("label", "")),
        ("chat_id".to_string(), get("chat_id", "")),
        ("thread_id".to_string(), get("thread_id", "")),
        ("channel".to_string(), get("channel", "telegram")),
    ]
}

async fn run_rendered_command(argv: &[String]) -> Result<(String, bool), std::io::Error> {
    let Some((program, args)) = argv.split_first() else {
        return Ok((String::new(), false));
    };
    let mut cmd = crate::utils::subprocess::scrubbed_tokio_command(program, args);
    cmd.stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());
    let output = cmd.output().await?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    let truncated: String = combined.chars().take(MAX_RENDERED_OUTPUT_CHARS).collect();
    Ok((truncated, output.status.success()))
}

/// One polling cycle for `worker`: claims and runs at most one task. Returns
/// `true` if a task was claimed (so the caller can skip its poll sleep).
pub async fn poll_once(store: &QueueStore, worker: &Worker) -> Result<bool, crate::queue::store::QueueError> {
    let Some(task) = store.next_task(worker)? else { return Ok(false) };
    if !store.claim_task(task.id, worker.id)? {
        return Ok(false);
    }

    let fields = payload_fields(&task.payload);
    let field_refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let argv = render_command_argv(&worker.command_template, &field_refs);

    match run_rendered_command(&argv).await {
        Ok((output, ok)) => store.finish_task(task.id, ok, output.trim())?,
        Err(e) => {
            warn!("worker {} task {} failed to spawn: {e}", worker.id, task.id);
            store.finish_task(task.id, false, &format!("worker error: {e}"))?;
        }
    }
    Ok(true)
}

/// The loop a spawned worker process runs: poll for its routing key's next
/// queued task, claim, render, execute, record, repeat until disabled.
pub async fn worker_loop(store: &QueueStore, worker_id: i64, cfg: &Config, pid: i32) -> Result<(), crate::queue::store::QueueError> {
    store.set_worker_runtime(worker_id, Some(pid), WorkerStatus::Running, None)?;

    loop {
        let worker = store.get_worker(worker_id)?;
        if !worker.enabled {
            store.set_worker_runtime(worker_id, None, WorkerStatus::Stopped, None)?;
            return Ok(());
        }

        let claimed = poll_once(store, &worker).await?;
        if !claimed {
            let poll_secs = cfg.battery_mode.effective_poll_seconds(2.0);
            tokio::time::sleep(Duration::from_secs_f64(poll_secs)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn render_substitutes_whole_token_placeholders() {
        let argv = render_command_argv("echo {text}", &[("text", "hello world")]);
        assert_eq!(argv, vec!["echo".to_string(), "hello world".to_string()]);
    }

    #[test]
    fn render_substitutes_embedded_placeholders_within_a_token() {
        let argv = render_command_argv("script.sh --chat={chat_id}", &[("chat_id", "123")]);
        assert_eq!(argv, vec!["script.sh".to_string(), "--chat=123".to_string()]);
    }

    #[test]
    fn render_never_lets_substituted_text_create_new_tokens() {
        let argv = render_command_argv("echo {text}", &[("text", "a; rm -rf /")]);
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[1], "a; rm -rf /");
    }

    #[tokio::test]
    async fn poll_once_claims_and_runs_a_queued_task() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path()).unwrap();
        let worker_id = store.upsert_worker("telegram", "1", "", "default", "echo {text}", true).unwrap();
        store.enqueue_task("telegram", "1", "", "default", serde_json::json!({"text": "oi"})).unwrap();

        let worker = store.get_worker(worker_id).unwrap();
        let claimed = poll_once(&store, &worker).await.unwrap();
        assert!(claimed);

        let tasks = store.list_tasks(10).unwrap();
        assert_eq!(tasks[0].status, crate::queue::store::TaskStatus::Done);
        assert_eq!(tasks[0].result.as_deref(), Some("oi"));
    }

    #[tokio::test]
    async fn poll_once_returns_false_when_queue_is_empty() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path()).unwrap();
        let worker_id = store.upsert_worker("telegram", "1", "", "default", "echo {text}", true).unwrap();
        let worker = store.get_worker(worker_id).unwrap();
        assert!(!poll_once(&store, &worker).await.unwrap());
    }
}
