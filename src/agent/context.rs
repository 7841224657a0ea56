//! Context assembly: system prompt + recent session history + memory
//! snippets, and the budget check that decides whether compaction runs.
//! Grounded on `original_source/clawlite/core/prompt.py::PromptBuilder`
//! and the teacher's `agent/context.rs` token-accounting shape.

use crate::agent::workspace::{SkillSummary, Workspace};
use crate::memory::MemoryStore;
use crate::providers::base::Message;
use crate::session::SessionStore;

const DEFAULT_HISTORY_TURNS: usize = 20;
/// Compact once the running estimate crosses this fraction of the model's
/// context window — mirrors the teacher's token-budget threshold.
const COMPACTION_THRESHOLD: f64 = 0.75;

pub struct ContextBundle {
    pub system_prompt: String,
    pub history: Vec<Message>,
    pub memory_snippets: Vec<String>,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

pub fn build_context(workspace: &Workspace, sessions: &SessionStore, memory: &MemoryStore, sid: &str, user_prompt: &str, skills: &[SkillSummary]) -> ContextBundle {
    let system_prompt = workspace.render_system_prompt(skills);

    let turns = sessions.read(sid, DEFAULT_HISTORY_TURNS).unwrap_or_default();
    let history = turns.into_iter().map(|t| Message { role: t.role, content: t.content, ..Default::default() }).collect();

    let memory_snippets = memory.search(user_prompt).map(|hits| hits.into_iter().map(|h| h.text).collect()).unwrap_or_default();

    ContextBundle { system_prompt, history, memory_snippets }
}

/// `spec.md` §4.4 step 3: "if over threshold, compact older turns into a
/// summary block and prepend it."
pub fn over_budget(messages: &[Message], context_window: u32) -> bool {
    let used: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
    used as f64 > context_window as f64 * COMPACTION_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_history_is_under_budget() {
        let messages = vec![Message::user("hi")];
        assert!(!over_budget(&messages, 128_000));
    }

    #[test]
    fn long_history_crosses_threshold() {
        let big = "word ".repeat(60_000);
        let messages = vec![Message::user(big)];
        assert!(over_budget(&messages, 1_000));
    }
}
