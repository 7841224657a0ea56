//! Skill marketplace and self-update. Grounded on
//! `original_source/clawlite/skills/marketplace.py` and
//! `original_source/clawlite/runtime/self_update.py`.

pub mod self_update;
pub mod skills;
mod version;

use std::sync::Arc;

use serde::Deserialize;

pub use self_update::{SelfUpdateError, UpdateStatus, UpdateTarget};
pub use skills::{InstalledManifest, InstalledSkill, MarketplaceError, MarketplaceStore, UpdateReport, DEFAULT_INDEX_URL};

/// Matches the original's `SYSTEM_AUTO_UPDATE_*` constants exactly — the
/// cron store's `run_cron_jobs` routes jobs with this `(channel, label,
/// name)` triple to `SystemJobHandler` instead of `TaskEnqueuer`.
pub const SYSTEM_AUTO_UPDATE_CHANNEL: &str = "system";
pub const SYSTEM_AUTO_UPDATE_CHAT_ID: &str = "local";
pub const SYSTEM_AUTO_UPDATE_LABEL: &str = "skills";
pub const SYSTEM_AUTO_UPDATE_NAME: &str = "auto-update";

#[derive(Debug, Deserialize)]
struct AutoUpdatePayload {
    action: String,
    #[serde(default)]
    slugs: Option<Vec<String>>,
    #[serde(default)]
    strict: bool,
}

/// Builds the JSON `text` field stored on the cron job row, mirroring
/// `build_auto_update_runtime_payload`.
pub fn build_auto_update_runtime_payload(slugs: Option<&[String]>, strict: bool) -> String {
    serde_json::json!({
        "action": "skill-auto-update",
        "slugs": slugs,
        "strict": strict,
    })
    .to_string()
}

/// Implements the cron store's `SystemJobHandler` seam for the one system job
/// kind this crate ships: sweeping installed skills for updates. Bridges the
/// sync trait method to the marketplace's async HTTP calls the same way
/// `CronScheduler::tick` bridges its own sync/async boundary, via
/// `spawn_blocking`'s blocking-pool runtime context.
pub struct MarketplaceAutoUpdateHandler {
    store: Arc<MarketplaceStore>,
    index_url: String,
    extra_hosts: Vec<String>,
}

impl MarketplaceAutoUpdateHandler {
    pub fn new(store: Arc<MarketplaceStore>) -> Self {
        MarketplaceAutoUpdateHandler { store, index_url: DEFAULT_INDEX_URL.to_string(), extra_hosts: Vec::new() }
    }

    pub fn with_index_url(mut self, index_url: impl Into<String>) -> Self {
        self.index_url = index_url.into();
        self
    }
}

impl crate::cron::store::SystemJobHandler for MarketplaceAutoUpdateHandler {
    fn run_system_job(&self, name: &str, text: &str) -> Result<String, String> {
        if name != SYSTEM_AUTO_UPDATE_NAME {
            return Err(format!("system job desconhecido: {name}"));
        }
        let payload: AutoUpdatePayload = serde_json::from_str(text).map_err(|err| format!("payload inválido: {err}"))?;
        if payload.action != "skill-auto-update" {
            return Err(format!("action inesperada: {}", payload.action));
        }

        let store = self.store.clone();
        let index_url = self.index_url.clone();
        let extra_hosts = self.extra_hosts.clone();
        let slugs = payload.slugs;
        let strict = payload.strict;

        let report = tokio::runtime::Handle::current()
            .block_on(async move { store.update_skills(&index_url, &extra_hosts, slugs.as_deref(), false, strict, false).await })
            .map_err(|err| err.to_string())?;

        Ok(serde_json::json!({
            "updated": report.updated.len(),
            "skipped": report.skipped.len(),
            "blocked": report.blocked.len(),
            "missing": report.missing.len(),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_update_payload_round_trips() {
        let text = build_auto_update_runtime_payload(Some(&["weather-cli".to_string()]), true);
        let parsed: AutoUpdatePayload = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.action, "skill-auto-update");
        assert_eq!(parsed.slugs.unwrap(), vec!["weather-cli".to_string()]);
        assert!(parsed.strict);
    }
}
