//! Runtime self-update. Grounded on
//! `original_source/clawlite/runtime/self_update.py`: channel resolution,
//! remote target lookup with a small on-disk cache, and re-invocation of the
//! install step. The original shells out to `pip install --upgrade
//! --force-reinstall --no-deps git+<repo>@<ref>`; the idiomatic Rust
//! equivalent here is `cargo install --force --git <repo> [--rev <ref>]`,
//! which is the crate-ecosystem analogue of the same "reinstall from source
//! at a pinned ref" operation.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

pub const VALID_UPDATE_CHANNELS: [&str; 3] = ["stable", "beta", "dev"];
pub const DEFAULT_UPDATE_CHANNEL: &str = "stable";
pub const DEFAULT_REPO_URL: &str = "https://github.com/eobarretooo/ClawLite";
const DEFAULT_CHECK_INTERVAL_SECS: i64 = 6 * 3600;
const MIN_CHECK_INTERVAL_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum SelfUpdateError {
    #[error("canal de atualização inválido: {0}")]
    InvalidChannel(String),
    #[error("não foi possível localizar uma versão remota para o canal {0}")]
    NoRemoteTarget(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tags digit parts `0`, non-digit parts `1` — the *opposite* convention from
/// `marketplace::skills::marketplace_version_key`. Both schemes exist,
/// unreconciled, in the original codebase (`self_update.py::
/// _parse_version_components` vs `marketplace.py::_version_key`); this keeps
/// that inconsistency faithful rather than silently unifying the two.
fn self_update_version_key(version: &str) -> Vec<(u8, super::version::VersionComponent)> {
    use super::version::VersionComponent;
    version
        .split(['.', '-', '+', '_'])
        .map(|part| {
            if !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()) {
                (0u8, VersionComponent::Num(part.parse().unwrap_or(0)))
            } else {
                (1u8, VersionComponent::Str(part.to_string()))
            }
        })
        .collect()
}

pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    self_update_version_key(candidate) > self_update_version_key(current)
}

pub fn resolve_update_channel(explicit: Option<&str>, cfg: &Config) -> Result<String, SelfUpdateError> {
    let channel = explicit
        .map(|s| s.to_string())
        .or_else(|| std::env::var("CLAWLITE_UPDATE_CHANNEL").ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| cfg.update.channel.clone())
        .trim()
        .to_lowercase();
    let channel = if channel.is_empty() { DEFAULT_UPDATE_CHANNEL.to_string() } else { channel };
    if !VALID_UPDATE_CHANNELS.contains(&channel.as_str()) {
        return Err(SelfUpdateError::InvalidChannel(channel));
    }
    Ok(channel)
}

fn check_interval_secs() -> i64 {
    std::env::var("CLAWLITE_UPDATE_CHECK_INTERVAL_SEC")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > MIN_CHECK_INTERVAL_SECS)
        .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS)
}

static BETA_DOT_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

/// Rewrites `X.Y.Z.beta[.suffix]` tags to `X.Y.Z-beta[.suffix]` and strips a
/// leading `refs/tags/`/`v`, mirroring `_extract_version_from_ref`.
fn normalize_release_tag(tag: &str) -> String {
    let tag = tag.strip_prefix("refs/tags/").unwrap_or(tag);
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    let re = BETA_DOT_RE.get_or_init(|| regex::Regex::new(r"^(\d+\.\d+\.\d+)\.beta(.*)$").unwrap());
    re.replace(tag, "$1-beta$2").to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTarget {
    pub channel: String,
    pub version: String,
    pub target_ref: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub current_version: String,
    pub channel: String,
    pub latest_version: Option<String>,
    pub target_ref: Option<String>,
    pub source: Option<String>,
    pub checked_at: String,
    pub update_available: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UpdateCache {
    #[serde(flatten)]
    entries: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct GithubRelease {
    tag_name: String,
    draft: bool,
    prerelease: bool,
}

fn cache_path(state_root: &Path) -> PathBuf {
    state_root.join("update-cache.json")
}

fn load_cache(state_root: &Path) -> UpdateCache {
    let path = cache_path(state_root);
    std::fs::read_to_string(path).ok().and_then(|raw| serde_json::from_str(&raw).ok()).unwrap_or_default()
}

fn save_cache(state_root: &Path, cache: &UpdateCache) -> Result<(), SelfUpdateError> {
    std::fs::create_dir_all(state_root)?;
    std::fs::write(cache_path(state_root), serde_json::to_string_pretty(cache)?)?;
    Ok(())
}

async fn fetch_main_branch_version(client: &reqwest::Client, repo_url: &str) -> Result<String, SelfUpdateError> {
    let raw_url = repo_url
        .replace("github.com", "raw.githubusercontent.com")
        .trim_end_matches('/')
        .to_string()
        + "/main/Cargo.toml";
    let body = client.get(&raw_url).send().await?.text().await?;
    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("version") {
            if let Some(eq) = rest.find('=') {
                let value = rest[eq + 1..].trim().trim_matches('"').to_string();
                if !value.is_empty() {
                    return Ok(value);
                }
            }
        }
    }
    Err(SelfUpdateError::NoRemoteTarget("main".to_string()))
}

async fn fetch_releases(client: &reqwest::Client, repo_url: &str, query: &str) -> Result<Vec<GithubRelease>, SelfUpdateError> {
    let api_base = repo_url.replace("github.com", "api.github.com/repos");
    let url = format!("{}/releases{}", api_base.trim_end_matches('/'), query);
    let resp = client.get(&url).header("User-Agent", "clawlite-self-update").send().await?;
    if !resp.status().is_success() {
        return Ok(Vec::new());
    }
    Ok(resp.json().await.unwrap_or_default())
}

async fn fetch_remote_target(channel: &str, repo_url: &str) -> Result<UpdateTarget, SelfUpdateError> {
    let client = crate::utils::http::shared_client();

    match channel {
        "dev" => {
            let version = fetch_main_branch_version(client, repo_url).await?;
            Ok(UpdateTarget { channel: channel.to_string(), version, target_ref: "main".to_string(), source: "main-branch".to_string() })
        }
        "stable" => {
            let latest = fetch_releases(client, repo_url, "/latest").await;
            if let Ok(releases) = latest {
                if let Some(release) = releases.into_iter().find(|r| !r.draft && !r.prerelease) {
                    let version = normalize_release_tag(&release.tag_name);
                    return Ok(UpdateTarget { channel: channel.to_string(), version: version.clone(), target_ref: release.tag_name, source: "github-release".to_string() });
                }
            }
            let releases = fetch_releases(client, repo_url, "?per_page=1").await?;
            if let Some(release) = releases.into_iter().find(|r| !r.draft && !r.prerelease) {
                let version = normalize_release_tag(&release.tag_name);
                return Ok(UpdateTarget { channel: channel.to_string(), version, target_ref: release.tag_name, source: "github-release".to_string() });
            }
            let version = fetch_main_branch_version(client, repo_url).await?;
            Ok(UpdateTarget { channel: channel.to_string(), version, target_ref: "main".to_string(), source: "main-branch-fallback".to_string() })
        }
        "beta" => {
            let releases = fetch_releases(client, repo_url, "?per_page=30").await.unwrap_or_default();
            if let Some(release) = releases.into_iter().find(|r| !r.draft && r.prerelease) {
                let version = normalize_release_tag(&release.tag_name);
                return Ok(UpdateTarget { channel: channel.to_string(), version, target_ref: release.tag_name, source: "github-prerelease".to_string() });
            }
            match Box::pin(fetch_remote_target("stable", repo_url)).await {
                Ok(target) => Ok(UpdateTarget { channel: channel.to_string(), ..target }),
                Err(_) => {
                    let version = fetch_main_branch_version(client, repo_url).await?;
                    Ok(UpdateTarget { channel: channel.to_string(), version, target_ref: "main".to_string(), source: "main-branch-fallback".to_string() })
                }
            }
        }
        other => Err(SelfUpdateError::InvalidChannel(other.to_string())),
    }
}

fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

pub async fn check_for_updates(state_root: &Path, current_version: &str, channel: &str, repo_url: &str, force_refresh: bool) -> Result<UpdateStatus, SelfUpdateError> {
    let mut cache = load_cache(state_root);
    let checked_key = format!("checked_at_{channel}");
    let version_key = format!("latest_version_{channel}");
    let ref_key = format!("target_ref_{channel}");
    let source_key = format!("source_{channel}");

    let stale = force_refresh
        || cache
            .entries
            .get(&checked_key)
            .and_then(|v| v.as_i64())
            .map(|last| now_epoch() - last > check_interval_secs())
            .unwrap_or(true);

    if stale {
        match fetch_remote_target(channel, repo_url).await {
            Ok(target) => {
                cache.entries.insert(version_key.clone(), serde_json::json!(target.version));
                cache.entries.insert(ref_key.clone(), serde_json::json!(target.target_ref));
                cache.entries.insert(source_key.clone(), serde_json::json!(target.source));
                cache.entries.insert(checked_key, serde_json::json!(now_epoch()));
                save_cache(state_root, &cache)?;
            }
            Err(err) => {
                tracing::warn!(channel, "self-update check failed: {err}");
            }
        }
    }

    let latest_version = cache.entries.get(&version_key).and_then(|v| v.as_str()).map(str::to_string);
    let target_ref = cache.entries.get(&ref_key).and_then(|v| v.as_str()).map(str::to_string);
    let source = cache.entries.get(&source_key).and_then(|v| v.as_str()).map(str::to_string);
    let update_available = latest_version.as_deref().is_some_and(|v| is_newer_version(v, current_version));

    Ok(UpdateStatus {
        current_version: current_version.to_string(),
        channel: channel.to_string(),
        latest_version,
        target_ref,
        source,
        checked_at: Utc::now().to_rfc3339(),
        update_available,
    })
}

pub fn format_update_notice(status: &UpdateStatus) -> Option<String> {
    if !status.update_available {
        return None;
    }
    let latest = status.latest_version.as_deref().unwrap_or("?");
    Some(format!(
        "Uma nova versão está disponível ({} -> {}) no canal '{}'. Rode `clawlite update` para atualizar.",
        status.current_version, latest, status.channel
    ))
}

/// Where the actual re-exec happens: `cargo install --force --git <repo>`,
/// pinned to `target_ref` unless it's the implicit "main" branch default.
/// Refuses to run against a dirty local checkout, same as the original's
/// `_repo_is_clean` guard.
pub fn build_cargo_install_command(target: &UpdateTarget, repo_url: &str) -> Vec<String> {
    let mut cmd = vec!["cargo".to_string(), "install".to_string(), "--force".to_string(), "--git".to_string(), repo_url.to_string()];
    if target.target_ref != "main" {
        cmd.push("--rev".to_string());
        cmd.push(target.target_ref.clone());
    }
    cmd
}

pub fn find_local_repo_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(".git").is_dir() && dir.join("Cargo.toml").is_file() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

pub fn repo_is_clean(repo_root: &Path) -> bool {
    std::process::Command::new("git")
        .arg("status")
        .arg("--porcelain")
        .current_dir(repo_root)
        .output()
        .map(|out| out.status.success() && out.stdout.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_resolution_prefers_explicit_over_config() {
        let cfg = Config::default();
        let channel = resolve_update_channel(Some("beta"), &cfg).unwrap();
        assert_eq!(channel, "beta");
    }

    #[test]
    fn channel_resolution_defaults_to_config_value() {
        let mut cfg = Config::default();
        cfg.update.channel = "dev".to_string();
        let channel = resolve_update_channel(None, &cfg).unwrap();
        assert_eq!(channel, "dev");
    }

    #[test]
    fn rejects_unknown_channel() {
        let cfg = Config::default();
        assert!(resolve_update_channel(Some("nightly"), &cfg).is_err());
    }

    #[test]
    fn version_comparison_treats_numeric_as_newer_at_same_position() {
        assert!(is_newer_version("1.2.0", "1.1.9"));
        assert!(!is_newer_version("1.1.9", "1.2.0"));
    }

    #[test]
    fn release_tag_normalizes_beta_dot_to_hyphen() {
        assert_eq!(normalize_release_tag("v1.2.3.beta.1"), "1.2.3-beta.1");
        assert_eq!(normalize_release_tag("refs/tags/v2.0.0"), "2.0.0");
    }

    #[test]
    fn cargo_install_command_pins_non_main_ref() {
        let target = UpdateTarget { channel: "stable".to_string(), version: "1.0.0".to_string(), target_ref: "v1.0.0".to_string(), source: "github-release".to_string() };
        let cmd = build_cargo_install_command(&target, DEFAULT_REPO_URL);
        assert!(cmd.contains(&"--rev".to_string()));
        assert!(cmd.contains(&"v1.0.0".to_string()));
    }

    #[test]
    fn cargo_install_command_omits_rev_for_main() {
        let target = UpdateTarget { channel: "dev".to_string(), version: "1.0.0".to_string(), target_ref: "main".to_string(), source: "main-branch".to_string() };
        let cmd = build_cargo_install_command(&target, DEFAULT_REPO_URL);
        assert!(!cmd.contains(&"--rev".to_string()));
    }

    #[tokio::test]
    async fn check_for_updates_uses_cache_when_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = UpdateCache::default();
        cache.entries.insert("checked_at_stable".to_string(), serde_json::json!(now_epoch()));
        cache.entries.insert("latest_version_stable".to_string(), serde_json::json!("9.9.9"));
        save_cache(dir.path(), &cache).unwrap();

        let status = check_for_updates(dir.path(), "1.0.0", "stable", DEFAULT_REPO_URL, false).await.unwrap();
        assert_eq!(status.latest_version.as_deref(), Some("9.9.9"));
        assert!(status.update_available);
    }
}
