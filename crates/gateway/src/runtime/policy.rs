//! Tool policy: auto/ask/deny plus allow- and block-lists.
//!
//! Evaluation order: block-list, then allow-list (when non-empty, a tool
//! must match it), then the mode. `Ask` routes through an approval
//! elicitation before execution.

use serde::{Deserialize, Serialize};

use agently_tools::matches_pattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Auto,
    Ask,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    #[serde(default)]
    pub mode: PolicyMode,
    /// Patterns (exact, `*` suffix, service-only). Empty = everything.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Ask,
    Deny { reason: String },
}

impl ToolPolicy {
    pub fn evaluate(&self, tool_name: &str) -> PolicyDecision {
        if self.block.iter().any(|p| matches_pattern(tool_name, p)) {
            return PolicyDecision::Deny {
                reason: format!("{tool_name} is block-listed"),
            };
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|p| matches_pattern(tool_name, p)) {
            return PolicyDecision::Deny {
                reason: format!("{tool_name} is not on the allow-list"),
            };
        }
        match self.mode {
            PolicyMode::Auto => PolicyDecision::Allow,
            PolicyMode::Ask => PolicyDecision::Ask,
            PolicyMode::Deny => PolicyDecision::Deny {
                reason: "policy mode is deny".into(),
            },
        }
    }

    /// Whether the catalogue should expose a tool at all.
    pub fn exposes(&self, tool_name: &str) -> bool {
        !matches!(self.evaluate(tool_name), PolicyDecision::Deny { .. })
    }

    /// Redactable snapshot persisted on the turn row.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_list_wins_over_allow_list() {
        let policy = ToolPolicy {
            mode: PolicyMode::Auto,
            allow: vec!["system:*".into()],
            block: vec!["system:exec".into()],
        };
        assert!(matches!(
            policy.evaluate("system:exec"),
            PolicyDecision::Deny { .. }
        ));
        assert_eq!(policy.evaluate("system:env"), PolicyDecision::Allow);
    }

    #[test]
    fn empty_allow_list_permits_everything() {
        let policy = ToolPolicy::default();
        assert_eq!(policy.evaluate("math:add"), PolicyDecision::Allow);
    }

    #[test]
    fn non_empty_allow_list_is_exclusive() {
        let policy = ToolPolicy {
            allow: vec!["math:add".into()],
            ..Default::default()
        };
        assert_eq!(policy.evaluate("math:add"), PolicyDecision::Allow);
        assert!(matches!(
            policy.evaluate("system:exec"),
            PolicyDecision::Deny { .. }
        ));
    }

    #[test]
    fn ask_mode_defers_to_approval() {
        let policy = ToolPolicy {
            mode: PolicyMode::Ask,
            ..Default::default()
        };
        assert_eq!(policy.evaluate("math:add"), PolicyDecision::Ask);
    }

    #[test]
    fn snapshot_round_trips() {
        let policy = ToolPolicy {
            mode: PolicyMode::Ask,
            allow: vec!["math:*".into()],
            block: vec![],
        };
        let snapshot = policy.snapshot();
        assert_eq!(snapshot["mode"], "ask");
        assert_eq!(snapshot["allow"][0], "math:*");
    }
}
