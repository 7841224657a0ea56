//! Identity/prompt plumbing. Minimal by design — `spec.md` treats
//! workspace/prompt/config as external to the core except for the exact
//! contract the Agent Loop needs. Grounded on
//! `original_source/clawlite/workspace/loader.py` (`WorkspaceLoader.read`/
//! `system_context`) and `core/prompt.py::PromptBuilder`.

use std::path::{Path, PathBuf};

const IDENTITY_FILES: &[&str] = &["IDENTITY.md", "SOUL.md", "USER.md", "AGENTS.md"];

/// An installed skill's `SKILL.md` front matter, enough to render the
/// active-skills prompt block (`spec.md` §4.15/§4.16).
#[derive(Debug, Clone)]
pub struct SkillSummary {
    pub name: String,
    pub description: String,
    pub active: bool,
}

pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Workspace { root: root.into() }
    }

    pub fn default_root() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".clawlite").join("workspace")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads a workspace file, treating a missing file as empty rather than
    /// an error — `spec.md` §4.15: "missing files are treated as empty".
    pub fn read_file(&self, filename: &str) -> String {
        std::fs::read_to_string(self.root.join(filename)).unwrap_or_default().trim().to_string()
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.root.join("HEARTBEAT.md")
    }

    /// Concatenates the identity blocks in the fixed order
    /// IDENTITY -> SOUL -> USER -> AGENTS, each headed by its filename,
    /// skipping any that are empty. Mirrors `PromptBuilder._read_workspace_files`.
    fn identity_block(&self) -> String {
        let mut parts = Vec::new();
        for name in IDENTITY_FILES {
            let text = self.read_file(name);
            if !text.is_empty() {
                parts.push(format!("## {name}\n{text}"));
            }
        }
        parts.join("\n\n")
    }

    /// Renders the active-skills block: one line per skill whose `SKILL.md`
    /// front matter marks it `active: true`.
    fn active_skills_block(skills: &[SkillSummary]) -> String {
        let lines: Vec<String> = skills.iter().filter(|s| s.active).map(|s| format!("- {}: {}", s.name, s.description)).collect();
        if lines.is_empty() {
            String::new()
        } else {
            format!("[Skills]\n{}", lines.join("\n"))
        }
    }

    pub fn render_system_prompt(&self, skills: &[SkillSummary]) -> String {
        let sections: Vec<String> = [self.identity_block(), Self::active_skills_block(skills)].into_iter().filter(|s| !s.is_empty()).collect();
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_identity_files_render_to_empty_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        assert_eq!(ws.render_system_prompt(&[]), "");
    }

    #[test]
    fn identity_files_are_concatenated_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "Be direct").unwrap();
        std::fs::write(dir.path().join("IDENTITY.md"), "I am Claw").unwrap();
        let ws = Workspace::new(dir.path());
        let prompt = ws.render_system_prompt(&[]);
        assert!(prompt.find("IDENTITY.md").unwrap() < prompt.find("SOUL.md").unwrap());
    }

    #[test]
    fn only_active_skills_are_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let skills = vec![
            SkillSummary { name: "cron".to_string(), description: "schedule tasks".to_string(), active: true },
            SkillSummary { name: "dormant".to_string(), description: "unused".to_string(), active: false },
        ];
        let prompt = ws.render_system_prompt(&skills);
        assert!(prompt.contains("cron: schedule tasks"));
        assert!(!prompt.contains("dormant"));
    }
}
