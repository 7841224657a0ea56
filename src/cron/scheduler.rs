//! Supervised tick loop for the conversation-cron jobs table. The original
//! ships two variants of this (a `threading.Thread` one and an
//! `asyncio.Task` sibling, `ConversationCronScheduler` /
//! `AsyncConversationCronScheduler` in
//! `original_source/clawlite/runtime/conversation_cron.py`) that do the
//! identical thing on two different runtimes; this is the single async
//! reconciliation, in the style of the teacher's `cron::service::CronService`
//! (`Arc<AtomicBool>` running flag, `tokio::spawn` poll loop, sleep-then-tick).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cron::store::{CronError, CronRunResult, CronStore, SystemJobHandler};
use crate::notifications::NotificationStore;
use crate::queue::QueueStore;

const DEFAULT_POLL_INTERVAL_SECS: f64 = 5.0;

pub struct CronScheduler {
    cron: Arc<CronStore>,
    queue: Arc<QueueStore>,
    notifications: Arc<NotificationStore>,
    system: Arc<dyn SystemJobHandler>,
    poll_interval_secs: f64,
    running: Arc<AtomicBool>,
    // non-blocking mutex: a held lock means a tick is already in flight, so
    // an overlapping call to `tick` becomes a no-op rather than queueing up,
    // mirroring the original's `threading.Lock(blocking=False)` guard.
    tick_guard: Arc<Mutex<()>>,
}

impl CronScheduler {
    pub fn new(cron: Arc<CronStore>, queue: Arc<QueueStore>, notifications: Arc<NotificationStore>, system: Arc<dyn SystemJobHandler>) -> Self {
        CronScheduler {
            cron,
            queue,
            notifications,
            system,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            running: Arc::new(AtomicBool::new(false)),
            tick_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_poll_interval_secs(mut self, secs: f64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Runs exactly one pass over due jobs. Returns `Ok(vec![])` without
    /// touching the store if a tick is already running.
    pub async fn tick(&self) -> Result<Vec<CronRunResult>, CronError> {
        let guard = match self.tick_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("cron tick skipped, previous tick still running");
                return Ok(Vec::new());
            }
        };
        let cron = self.cron.clone();
        let queue = self.queue.clone();
        let notifications = self.notifications.clone();
        let system = self.system.clone();
        let results = tokio::task::spawn_blocking(move || cron.run_cron_jobs(None, false, queue.as_ref(), system.as_ref(), &notifications))
            .await
            .map_err(|err| CronError::Io(std::io::Error::other(err.to_string())))??;
        drop(guard);
        Ok(results)
    }

    /// Runs every enabled job once, ignoring `next_run_at`. Used by the
    /// `cron run --all` CLI surface.
    pub async fn run_all(&self) -> Result<Vec<CronRunResult>, CronError> {
        let _guard = self.tick_guard.lock().await;
        self.cron.run_cron_jobs(None, true, self.queue.as_ref(), self.system.as_ref(), &self.notifications)
    }

    pub async fn run_one(&self, job_id: i64) -> Result<Vec<CronRunResult>, CronError> {
        let _guard = self.tick_guard.lock().await;
        self.cron.run_cron_jobs(Some(job_id), false, self.queue.as_ref(), self.system.as_ref(), &self.notifications)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Polls until `stop()` is called, throttled by battery mode the same
    /// way the heartbeat and autonomy loops are.
    pub async fn run(&self, cfg: &Config) {
        self.running.store(true, Ordering::SeqCst);
        info!("conversation cron scheduler started");
        while self.running.load(Ordering::SeqCst) {
            match self.tick().await {
                Ok(results) => {
                    for result in &results {
                        if result.status == "failed" {
                            warn!(job_id = result.job_id, message = %result.message, "cron job failed");
                        } else {
                            info!(job_id = result.job_id, status = %result.status, "cron job ran");
                        }
                    }
                }
                Err(err) => error!("cron tick failed: {err}"),
            }
            let delay = cfg.battery_mode.effective_poll_seconds(self.poll_interval_secs);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        info!("conversation cron scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::store::TaskEnqueuer;
    use crate::queue::QueueError;
    use tempfile::tempdir;

    struct NoopEnqueuer;
    impl TaskEnqueuer for NoopEnqueuer {
        fn enqueue(&self, _channel: &str, _chat_id: &str, _thread_id: &str, _label: &str, _payload: serde_json::Value) -> Result<i64, QueueError> {
            Ok(1)
        }
    }

    struct NoopSystemJobs;
    impl SystemJobHandler for NoopSystemJobs {
        fn run_system_job(&self, _name: &str, _text: &str) -> Result<String, String> {
            Ok("ok".to_string())
        }
    }

    #[tokio::test]
    async fn tick_with_no_due_jobs_returns_empty() {
        let dir = tempdir().unwrap();
        let cron = Arc::new(CronStore::new(dir.path()).unwrap());
        let queue = Arc::new(QueueStore::new(dir.path()).unwrap());
        let notifications = Arc::new(NotificationStore::new(dir.path()).unwrap());
        let scheduler = CronScheduler::new(cron, queue, notifications, Arc::new(NoopSystemJobs));
        let results = scheduler.tick().await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn run_one_executes_regardless_of_schedule() {
        let dir = tempdir().unwrap();
        let cron = Arc::new(CronStore::new(dir.path()).unwrap());
        let queue = Arc::new(QueueStore::new(dir.path()).unwrap());
        let notifications = Arc::new(NotificationStore::new(dir.path()).unwrap());
        let job_id = cron.add_job("system", "", "", "skills", "auto-update", "{}", 3600, true).unwrap();

        let scheduler = CronScheduler::new(cron, queue, notifications, Arc::new(NoopSystemJobs));
        let results = scheduler.run_one(job_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "executed");
    }
}
