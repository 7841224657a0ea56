//! Safe display of filesystem paths in LLM-facing text.
//!
//! Paths under the workspace or the user's home are collapsed to a
//! tilde-relative form; paths outside both are redacted to their filename
//! only, so error messages never leak unrelated directory structure back to
//! the model. System paths (neither under home nor the workspace) pass
//! through unchanged, since they carry no user-identifying structure.

use std::path::Path;

pub fn sanitize_path(path: &Path, workspace_root: &Path) -> String {
    let path_str = path.to_string_lossy();

    if let Ok(rel) = path.strip_prefix(workspace_root) {
        return format!("~workspace/{}", rel.to_string_lossy());
    }

    if let Some(home) = dirs::home_dir() {
        if let Ok(rel) = path.strip_prefix(&home) {
            return format!("~/{}", rel.to_string_lossy());
        }
        if path_str.starts_with(&*home.to_string_lossy()) {
            return path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "<arquivo>".to_string());
        }
    }

    path_str.to_string()
}

/// Rewrites any absolute path mentioned in an error message into its
/// sanitized form, used before error text reaches the model or a channel.
pub fn sanitize_error_message(message: &str, workspace_root: &Path) -> String {
    let mut out = String::with_capacity(message.len());
    for token in message.split_inclusive(char::is_whitespace) {
        let trimmed = token.trim_end();
        let suffix = &token[trimmed.len()..];
        if trimmed.starts_with('/') || trimmed.starts_with("~/") {
            out.push_str(&sanitize_path(Path::new(trimmed), workspace_root));
        } else {
            out.push_str(trimmed);
        }
        out.push_str(suffix);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_workspace_paths() {
        let ws = Path::new("/home/bot/.clawlite/workspace");
        let p = ws.join("memory/notes.md");
        assert_eq!(sanitize_path(&p, ws), "~workspace/memory/notes.md");
    }

    #[test]
    fn leaves_system_paths_unchanged() {
        let ws = Path::new("/home/bot/.clawlite/workspace");
        assert_eq!(sanitize_path(Path::new("/etc/hosts"), ws), "/etc/hosts");
    }
}
