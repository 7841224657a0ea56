//! The handful of concrete tools this crate ships out of the box —
//! `read_file`/`write_file` (workspace-rooted, path-traversal-checked),
//! `exec_cmd` (argv-only, same scrubbed-`Command` approach
//! `queue::worker` uses), `memory_search` (bridges `memory::MemoryStore`).
//! Names match the defaults already classified in `trust::policy`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::tools::base::{Tool, ToolResult};
use crate::memory::MemoryStore;

fn resolve_under_root(root: &Path, relative: &str) -> anyhow::Result<PathBuf> {
    let joined = root.join(relative);
    let root_canon = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let parent = joined.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| root.to_path_buf());
    std::fs::create_dir_all(&parent).ok();
    let resolved = joined.canonicalize().unwrap_or(joined);
    if !resolved.starts_with(&root_canon) {
        anyhow::bail!("path escapes the workspace root");
    }
    Ok(resolved)
}

pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: PathBuf) -> Self {
        ReadFileTool { root }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read a text file from the agent workspace."
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]})
    }
    async fn execute(&self, params: Value) -> anyhow::Result<ToolResult> {
        let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
        let resolved = resolve_under_root(&self.root, path)?;
        match std::fs::read_to_string(&resolved) {
            Ok(text) => Ok(ToolResult::new(text)),
            Err(err) => Ok(ToolResult::error(format!("falha ao ler {path}: {err}"))),
        }
    }
}

pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: PathBuf) -> Self {
        WriteFileTool { root }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write a text file inside the agent workspace, creating parent directories as needed."
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"path": {"type": "string"}, "content": {"type": "string"}}, "required": ["path", "content"]})
    }
    async fn execute(&self, params: Value) -> anyhow::Result<ToolResult> {
        let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
        let content = params.get("content").and_then(Value::as_str).unwrap_or_default();
        let resolved = resolve_under_root(&self.root, path)?;
        std::fs::write(&resolved, content)?;
        Ok(ToolResult::new(format!("{path} escrito ({} bytes)", content.len())))
    }
}

pub struct ExecCmdTool;

#[async_trait]
impl Tool for ExecCmdTool {
    fn name(&self) -> &str {
        "exec_cmd"
    }
    fn description(&self) -> &str {
        "Execute a whitelisted local command with argv-only arguments (no shell interpretation)."
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"program": {"type": "string"}, "args": {"type": "array", "items": {"type": "string"}}}, "required": ["program"]})
    }
    async fn execute(&self, params: Value) -> anyhow::Result<ToolResult> {
        let program = params.get("program").and_then(Value::as_str).unwrap_or_default();
        let args: Vec<String> = params.get("args").and_then(Value::as_array).map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default();
        let output = crate::utils::subprocess::scrubbed_tokio_command(program, &args).output().await?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.stderr.is_empty() {
            text.push_str("\n--- stderr ---\n");
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        let truncated: String = text.chars().take(4000).collect();
        if output.status.success() {
            Ok(ToolResult::new(truncated))
        } else {
            Ok(ToolResult::error(truncated))
        }
    }
}

pub struct MemorySearchTool {
    memory: Arc<MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        MemorySearchTool { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }
    fn description(&self) -> &str {
        "Search long-term memory for snippets relevant to a query."
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]})
    }
    async fn execute(&self, params: Value) -> anyhow::Result<ToolResult> {
        let query = params.get("query").and_then(Value::as_str).unwrap_or_default();
        let hits = self.memory.search(query)?;
        if hits.is_empty() {
            return Ok(ToolResult::new("nenhuma memória relevante encontrada"));
        }
        let rendered = hits.into_iter().map(|h| format!("- ({:.2}) {}", h.score, h.text)).collect::<Vec<_>>().join("\n");
        Ok(ToolResult::new(rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WriteFileTool::new(dir.path().to_path_buf());
        writer.execute(json!({"path": "notes/today.md", "content": "hello"})).await.unwrap();
        let reader = ReadFileTool::new(dir.path().to_path_buf());
        let result = reader.execute(json!({"path": "notes/today.md"})).await.unwrap();
        assert_eq!(result.content, "hello");
    }

    #[tokio::test]
    async fn exec_cmd_captures_stdout() {
        let tool = ExecCmdTool;
        let result = tool.execute(json!({"program": "echo", "args": ["hi"]})).await.unwrap();
        assert!(result.content.contains("hi"));
        assert!(!result.is_error);
    }
}
