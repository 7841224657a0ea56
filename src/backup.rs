//! Full-state backup/restore. Grounded on
//! `original_source/clawlite/runtime/backup.py` (`create_backup`,
//! `list_backups`, `restore_backup`, `_safe_members`), using `tar`+`flate2`
//! the way the pack's own archive code does (gzip-compressed tarball, one
//! archive per call, simple mtime-based retention).

use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

pub const DEFAULT_KEEP_LAST: usize = 7;
const CRITICAL_FILES: &[&str] = &["config.json", "mcp.json", "pairing.json", "dashboard_settings.json"];
const CRITICAL_DB_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];
const CRITICAL_DIRS: &[&str] = &["workspace", "dashboard"];

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("no critical state found under {0}")]
    NoSources(PathBuf),
    #[error("backup archive not found: {0}")]
    ArchiveNotFound(PathBuf),
    #[error("backup archive has no entries safe to restore")]
    NoSafeEntries,
    #[error("unsafe archive entry: {0}")]
    UnsafeEntry(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupReport {
    pub archive: PathBuf,
    pub entries: Vec<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupListing {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RestoreReport {
    pub archive: PathBuf,
    pub restored_entries: Vec<String>,
    pub target_dir: PathBuf,
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label.trim().to_lowercase().chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_').collect();
    if cleaned.is_empty() {
        "manual".to_string()
    } else {
        cleaned
    }
}

fn collect_sources(config_dir: &Path) -> Vec<PathBuf> {
    let mut sources = Vec::new();
    for filename in CRITICAL_FILES {
        let candidate = config_dir.join(filename);
        if candidate.is_file() {
            sources.push(candidate);
        }
    }
    if let Ok(entries) = std::fs::read_dir(config_dir) {
        let mut dbs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()).is_some_and(|ext| CRITICAL_DB_EXTENSIONS.contains(&ext)))
            .collect();
        dbs.sort();
        sources.extend(dbs);
    }
    for dirname in CRITICAL_DIRS {
        let candidate = config_dir.join(dirname);
        if candidate.is_dir() {
            sources.push(candidate);
        }
    }
    sources
}

/// Creates `<config_dir>/backups/clawlite_backup_<ts>_<label>.tar.gz`
/// containing config files, every sqlite database, and the `workspace`/
/// `dashboard` directories, then prunes down to `keep_last` archives.
pub fn create_backup(config_dir: &Path, label: &str, keep_last: usize) -> Result<BackupReport, BackupError> {
    let backup_dir = config_dir.join("backups");
    std::fs::create_dir_all(&backup_dir)?;

    let sources = collect_sources(config_dir);
    if sources.is_empty() {
        return Err(BackupError::NoSources(config_dir.to_path_buf()));
    }

    let safe_label = sanitize_label(label);
    let archive_path = backup_dir.join(format!("clawlite_backup_{}_{safe_label}.tar.gz", Utc::now().format("%Y%m%d_%H%M%S")));

    let file = std::fs::File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut entries = Vec::new();
    for src in &sources {
        let name = src.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        if src.is_dir() {
            builder.append_dir_all(&name, src)?;
        } else {
            builder.append_path_with_name(src, &name)?;
        }
        entries.push(name);
    }
    builder.into_inner()?.finish()?;

    if keep_last > 0 {
        prune_old_archives(&backup_dir, keep_last)?;
    }

    let size_bytes = std::fs::metadata(&archive_path)?.len();
    Ok(BackupReport { archive: archive_path, entries, size_bytes })
}

fn prune_old_archives(backup_dir: &Path, keep_last: usize) -> Result<(), BackupError> {
    let mut archives: Vec<(PathBuf, std::time::SystemTime)> = std::fs::read_dir(backup_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("clawlite_backup_") && n.ends_with(".tar.gz")))
        .filter_map(|p| std::fs::metadata(&p).ok().and_then(|m| m.modified().ok()).map(|m| (p, m)))
        .collect();
    archives.sort_by(|a, b| b.1.cmp(&a.1));
    for (old_path, _) in archives.into_iter().skip(keep_last) {
        let _ = std::fs::remove_file(old_path);
    }
    Ok(())
}

/// Lists backup archives newest-first.
pub fn list_backups(config_dir: &Path) -> Result<Vec<BackupListing>, BackupError> {
    let backup_dir = config_dir.join("backups");
    if !backup_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut rows: Vec<(BackupListing, std::time::SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(&backup_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        if !(name.starts_with("clawlite_backup_") && name.ends_with(".tar.gz")) {
            continue;
        }
        let meta = entry.metadata()?;
        let modified = meta.modified()?;
        let modified_at: chrono::DateTime<Utc> = modified.into();
        rows.push((BackupListing { path: path.clone(), name, size_bytes: meta.len(), modified_at: modified_at.to_rfc3339() }, modified));
    }
    rows.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(rows.into_iter().map(|(row, _)| row).collect())
}

/// Extracts `archive_path` into `config_dir`, rejecting any member whose
/// path is absolute or escapes the destination via `..`.
pub fn restore_backup(archive_path: &Path, config_dir: &Path) -> Result<RestoreReport, BackupError> {
    if !archive_path.is_file() {
        return Err(BackupError::ArchiveNotFound(archive_path.to_path_buf()));
    }
    std::fs::create_dir_all(config_dir)?;

    let file = std::fs::File::open(archive_path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let mut restored = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        let name = relative.to_string_lossy().to_string();
        if relative.is_absolute() || relative.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(BackupError::UnsafeEntry(name));
        }
        let out_path = config_dir.join(&relative);
        if !out_path.starts_with(config_dir) {
            return Err(BackupError::UnsafeEntry(name));
        }
        entry.unpack(&out_path)?;
        restored.push(name);
    }

    if restored.is_empty() {
        return Err(BackupError::NoSafeEntries);
    }

    Ok(RestoreReport { archive: archive_path.to_path_buf(), restored_entries: restored, target_dir: config_dir.to_path_buf() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_label_strips_unsafe_characters() {
        assert_eq!(sanitize_label("Nightly Run #3!"), "nightlyrun3");
        assert_eq!(sanitize_label("  "), "manual");
    }

    #[test]
    fn backup_then_restore_round_trips_config_file() {
        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("config.json"), r#"{"model":"test"}"#).unwrap();
        std::fs::create_dir_all(src_dir.path().join("workspace")).unwrap();
        std::fs::write(src_dir.path().join("workspace").join("IDENTITY.md"), "sou eu").unwrap();

        let report = create_backup(src_dir.path(), "manual", 7).unwrap();
        assert!(report.entries.contains(&"config.json".to_string()));
        assert!(report.size_bytes > 0);

        let restore_dir = tempfile::tempdir().unwrap();
        let restored = restore_backup(&report.archive, restore_dir.path()).unwrap();
        assert!(!restored.restored_entries.is_empty());
        assert_eq!(std::fs::read_to_string(restore_dir.path().join("config.json")).unwrap(), r#"{"model":"test"}"#);
        assert_eq!(std::fs::read_to_string(restore_dir.path().join("workspace").join("IDENTITY.md")).unwrap(), "sou eu");
    }

    #[test]
    fn create_backup_fails_with_no_critical_sources() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(create_backup(dir.path(), "manual", 7), Err(BackupError::NoSources(_))));
    }

    #[test]
    fn list_backups_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        create_backup(dir.path(), "one", 7).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        create_backup(dir.path(), "two", 7).unwrap();

        let listing = list_backups(dir.path()).unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing[0].name.contains("two"));
    }

    #[test]
    fn prune_keeps_only_the_requested_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        for i in 0..3 {
            create_backup(dir.path(), &format!("run{i}"), 2).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1100));
        }
        assert_eq!(list_backups(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn restore_rejects_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.tar.gz");
        assert!(matches!(restore_backup(&missing, dir.path()), Err(BackupError::ArchiveNotFound(_))));
    }
}
