//! Tool policy (RBAC): `allow | review | deny` classification per call,
//! with a capped audit ring. Grounded on
//! `original_source/clawlite/core/rbac.py`.

use std::collections::{HashMap, VecDeque};

const DANGEROUS_TOOLS: &[&str] = &["exec_cmd", "write_file", "ssh", "docker"];
const SAFE_TOOLS: &[&str] =
    &["read_file", "web_search", "web_fetch", "memory_search", "browser_read", "browser_goto", "healthcheck", "weather"];
const AUDIT_LOG_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPolicy {
    Allow,
    Review,
    Deny,
}

impl ToolPolicy {
    pub fn parse(raw: &str) -> Option<ToolPolicy> {
        match raw {
            "allow" => Some(ToolPolicy::Allow),
            "review" => Some(ToolPolicy::Review),
            "deny" => Some(ToolPolicy::Deny),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub tool: String,
    pub policy: ToolPolicy,
    pub identity: String,
    pub arguments_preview: String,
    pub timestamp_unix: u64,
}

pub struct ToolPolicyEngine {
    explicit_policies: HashMap<String, ToolPolicy>,
    audit_log: VecDeque<AuditEntry>,
}

impl ToolPolicyEngine {
    pub fn new(explicit_policies: HashMap<String, ToolPolicy>) -> Self {
        ToolPolicyEngine { explicit_policies, audit_log: VecDeque::new() }
    }

    /// Default classification: explicit config wins; else the fixed
    /// dangerous/safe sets; else unknown tools default to `review`.
    pub fn get_tool_policy(&self, tool_name: &str, can_execute_tools: bool) -> ToolPolicy {
        if let Some(policy) = self.explicit_policies.get(tool_name) {
            return *policy;
        }
        if !can_execute_tools {
            return ToolPolicy::Deny;
        }
        if DANGEROUS_TOOLS.contains(&tool_name) {
            return ToolPolicy::Review;
        }
        if SAFE_TOOLS.contains(&tool_name) {
            return ToolPolicy::Allow;
        }
        ToolPolicy::Review
    }

    /// Checks and audits a call; returns `(allowed, reason_or_policy)`.
    pub fn check_tool_approval(
        &mut self,
        tool_name: &str,
        arguments_preview: &str,
        identity: &str,
        can_execute_tools: bool,
    ) -> (bool, String) {
        let policy = self.get_tool_policy(tool_name, can_execute_tools);

        self.audit_log.push_back(AuditEntry {
            tool: tool_name.to_string(),
            policy,
            identity: identity.to_string(),
            arguments_preview: arguments_preview.chars().take(200).collect(),
            timestamp_unix: std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs(),
        });
        if self.audit_log.len() > AUDIT_LOG_CAP {
            self.audit_log.pop_front();
        }

        match policy {
            ToolPolicy::Deny => (false, format!("Ferramenta '{tool_name}' bloqueada pela política de segurança")),
            ToolPolicy::Review => {
                tracing::info!(tool = tool_name, identity, "tool call under review policy, allowed");
                (true, "review".to_string())
            }
            ToolPolicy::Allow => (true, "allow".to_string()),
        }
    }

    pub fn audit_log(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit_log.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangerous_tool_defaults_to_review() {
        let engine = ToolPolicyEngine::new(HashMap::new());
        assert_eq!(engine.get_tool_policy("exec_cmd", true), ToolPolicy::Review);
    }

    #[test]
    fn safe_tool_defaults_to_allow() {
        let engine = ToolPolicyEngine::new(HashMap::new());
        assert_eq!(engine.get_tool_policy("read_file", true), ToolPolicy::Allow);
    }

    #[test]
    fn unknown_tool_defaults_to_review() {
        let engine = ToolPolicyEngine::new(HashMap::new());
        assert_eq!(engine.get_tool_policy("frobnicate", true), ToolPolicy::Review);
    }

    #[test]
    fn explicit_policy_overrides_defaults() {
        let mut explicit = HashMap::new();
        explicit.insert("read_file".to_string(), ToolPolicy::Deny);
        let engine = ToolPolicyEngine::new(explicit);
        assert_eq!(engine.get_tool_policy("read_file", true), ToolPolicy::Deny);
    }

    #[test]
    fn denied_tool_returns_portuguese_reason_and_audits() {
        let mut engine = ToolPolicyEngine::new(HashMap::new());
        let mut explicit = HashMap::new();
        explicit.insert("ssh".to_string(), ToolPolicy::Deny);
        engine.explicit_policies = explicit;

        let (allowed, reason) = engine.check_tool_approval("ssh", "{}", "agent", true);
        assert!(!allowed);
        assert!(reason.contains("bloqueada"));
        assert_eq!(engine.audit_log(1).len(), 1);
    }

    #[test]
    fn audit_log_caps_at_500_entries() {
        let mut engine = ToolPolicyEngine::new(HashMap::new());
        for i in 0..600 {
            engine.check_tool_approval(&format!("tool{i}"), "{}", "agent", true);
        }
        assert_eq!(engine.audit_log(usize::MAX).len(), AUDIT_LOG_CAP);
    }
}
