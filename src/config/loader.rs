//! Deep-merge-over-defaults config loading with atomic, permission-locked
//! saves, matching the teacher's `config::loader` contract.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::schema::Config;
use crate::errors::{ClawLiteError, Result};

pub fn default_config_path() -> PathBuf {
    clawlite_home().join("config.json")
}

pub fn clawlite_home() -> PathBuf {
    if let Ok(home) = std::env::var("CLAWLITE_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".clawlite")
}

/// Loads `path`, deep-merging its JSON object over `Config::default()`'s
/// JSON representation so that a config file missing newly-added keys
/// never fails to parse and never silently drops user overrides for keys
/// the on-disk file does carry.
pub fn load_config(path: &Path) -> Result<Config> {
    let default_value = serde_json::to_value(Config::default())?;

    if !path.exists() {
        return Ok(Config::default());
    }

    let raw = fs::read_to_string(path)?;
    let on_disk: Value = serde_json::from_str(&raw)?;
    let merged = deep_merge(default_value, on_disk);
    let config: Config = serde_json::from_value(merged)
        .map_err(|e| ClawLiteError::InvalidConfig(e.to_string()))?;
    Ok(config)
}

/// Atomically persists `config` to `path`: write to a sibling temp file,
/// `fsync`, then rename over the target so readers never observe a
/// truncated file. Restricts the file to `0600` on Unix.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.model, Config::default().model);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = Config::default();
        cfg.model = "anthropic/claude-haiku".to_string();
        cfg.gateway.port = 9999;
        save_config(&cfg, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.model, "anthropic/claude-haiku");
        assert_eq!(loaded.gateway.port, 9999);
    }

    #[test]
    fn missing_keys_in_file_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"model": "groq/llama"}"#).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.model, "groq/llama");
        assert_eq!(loaded.gateway.port, Config::default().gateway.port);
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        save_config(&Config::default(), &path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
