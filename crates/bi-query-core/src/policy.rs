//! Policy Gate: pre-generation query authorization and post-execution
//! column masking.
//!
//! The injection-signature table is a private, non-extensible rule list —
//! grounded on the pack's SQL rule-engine shape (`RuleInfo{id, name,
//! severity, category}` plus a `check` method) but intentionally not wired
//! to any public plugin system, since spec.md scopes the Gate's "MUST
//! reject" list as closed (Non-goals: "full policy engine semantics beyond
//! the two decisions the core consumes").

use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Masking strategy applied to a single column's values before returning
/// rows to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskType {
    None,
    Partial,
    Full,
    Hash,
    Redacted,
}

impl MaskType {
    pub fn apply(&self, value: &serde_json::Value) -> serde_json::Value {
        match self {
            MaskType::None => value.clone(),
            MaskType::Full => serde_json::Value::String("***".to_string()),
            MaskType::Redacted => serde_json::Value::String("[redacted]".to_string()),
            MaskType::Partial => match value.as_str() {
                Some(s) if s.len() > 4 => {
                    let visible = &s[s.len() - 4..];
                    serde_json::Value::String(format!("***{visible}"))
                }
                _ => serde_json::Value::String("***".to_string()),
            },
            MaskType::Hash => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(value.to_string().as_bytes());
                serde_json::Value::String(format!("{:x}", hasher.finalize()))
            }
        }
    }
}

/// Minimal shape of a proposed query the Gate decides on, per spec.md §4.2:
/// "at minimum {proposed_sql_skeleton, source_tables_touched}".
#[derive(Debug, Clone)]
pub struct QueryShape {
    pub proposed_sql_skeleton: String,
    pub source_tables_touched: Vec<String>,
}

/// The principal making the request: roles drive both allow/deny and the
/// mask plan.
#[derive(Debug, Clone)]
pub struct Principal {
    pub roles: Vec<String>,
}

/// Allow/deny decision from the Gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

struct InjectionRule {
    id: &'static str,
    description: &'static str,
    check: fn(&str) -> bool,
}

fn rule_table() -> &'static [InjectionRule] {
    &[
        InjectionRule {
            id: "stacked-statement",
            description: "stacked-statement separator outside literals",
            check: |sql| crate::sqlsafety::SqlValidator::validate_read_only(sql)
                .warnings
                .iter()
                .any(|w| w.contains("stacked")),
        },
        InjectionRule {
            id: "comment-introducer",
            description: "comment introducer outside literals",
            check: |sql| crate::sqlsafety::SqlValidator::validate_read_only(sql)
                .warnings
                .iter()
                .any(|w| w.contains("comment")),
        },
        InjectionRule {
            id: "union-select-chain",
            description: "UNION SELECT meta-chain",
            check: |sql| crate::sqlsafety::SqlValidator::validate_read_only(sql)
                .warnings
                .iter()
                .any(|w| w.contains("UNION")),
        },
        InjectionRule {
            id: "always-true-predicate",
            description: "always-true predicate",
            check: |sql| crate::sqlsafety::SqlValidator::validate_read_only(sql)
                .warnings
                .iter()
                .any(|w| w.contains("always-true")),
        },
        InjectionRule {
            id: "dangerous-function",
            description: "time-based dangerous function",
            check: |sql| crate::sqlsafety::SqlValidator::validate_read_only(sql)
                .warnings
                .iter()
                .any(|w| w.contains("disallowed function")),
        },
        InjectionRule {
            id: "dml-ddl-keyword",
            description: "DML/DDL keyword",
            check: |sql| crate::sqlsafety::SqlValidator::validate_read_only(sql)
                .warnings
                .iter()
                .any(|w| w.contains("disallowed keyword")),
        },
        InjectionRule {
            id: "non-select-start",
            description: "statement is not a single SELECT",
            check: |sql| crate::sqlsafety::SqlValidator::validate_read_only(sql)
                .warnings
                .iter()
                .any(|w| w.contains("does not begin with SELECT")),
        },
    ]
}

/// Pure, deterministic decision point. No I/O beyond reading policy data;
/// default is deny.
pub struct PolicyGate {
    /// role → table → mask type, the static policy data the Gate reads.
    mask_policy: HashMap<String, HashMap<String, MaskType>>,
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self {
            mask_policy: HashMap::new(),
        }
    }
}

impl PolicyGate {
    pub fn new(mask_policy: HashMap<String, HashMap<String, MaskType>>) -> Self {
        Self { mask_policy }
    }

    /// Runs the closed rule table over the proposed SQL in parallel
    /// (grounded on the pack's parallel rule-evaluation pattern) and denies
    /// on the first violation found.
    pub fn allow(&self, query_shape: &QueryShape, _principal: &Principal) -> PolicyDecision {
        let violations: Vec<&'static str> = rule_table()
            .par_iter()
            .filter(|rule| (rule.check)(&query_shape.proposed_sql_skeleton))
            .map(|rule| rule.description)
            .collect();

        if let Some(reason) = violations.first() {
            tracing::info!(reason = %reason, "policy gate denied query");
            return PolicyDecision::Deny {
                reason: reason.to_string(),
            };
        }

        PolicyDecision::Allow
    }

    /// Returns a column → mask-type mapping for the given principal's roles,
    /// unioning per-role policy and preferring the strictest mask when roles
    /// disagree on the same column.
    pub fn mask_plan(
        &self,
        columns: &[String],
        principal: &Principal,
    ) -> HashMap<String, MaskType> {
        let mut plan = HashMap::new();

        for column in columns {
            let mut strictest = MaskType::None;
            for role in &principal.roles {
                if let Some(role_policy) = self.mask_policy.get(role) {
                    if let Some(mask) = role_policy.get(column) {
                        if strictness(*mask) > strictness(strictest) {
                            strictest = *mask;
                        }
                    }
                }
            }
            plan.insert(column.clone(), strictest);
        }

        plan
    }
}

fn strictness(mask: MaskType) -> u8 {
    match mask {
        MaskType::None => 0,
        MaskType::Partial => 1,
        MaskType::Hash => 2,
        MaskType::Redacted => 3,
        MaskType::Full => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(roles: &[&str]) -> Principal {
        Principal {
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn allows_plain_select() {
        let gate = PolicyGate::default();
        let shape = QueryShape {
            proposed_sql_skeleton: "SELECT id FROM patients".to_string(),
            source_tables_touched: vec!["patients".to_string()],
        };
        assert_eq!(
            gate.allow(&shape, &principal(&["analyst"])),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn denies_dml() {
        let gate = PolicyGate::default();
        let shape = QueryShape {
            proposed_sql_skeleton: "DELETE FROM patients".to_string(),
            source_tables_touched: vec!["patients".to_string()],
        };
        assert!(matches!(
            gate.allow(&shape, &principal(&["analyst"])),
            PolicyDecision::Deny { .. }
        ));
    }

    #[test]
    fn denies_stacked_statement_injection() {
        let gate = PolicyGate::default();
        let shape = QueryShape {
            proposed_sql_skeleton: "SELECT * FROM patients; DROP TABLE patients".to_string(),
            source_tables_touched: vec!["patients".to_string()],
        };
        assert!(matches!(
            gate.allow(&shape, &principal(&["analyst"])),
            PolicyDecision::Deny { .. }
        ));
    }

    #[test]
    fn mask_plan_picks_strictest_role() {
        let mut policy = HashMap::new();
        let mut analyst = HashMap::new();
        analyst.insert("ssn".to_string(), MaskType::Partial);
        let mut guest = HashMap::new();
        guest.insert("ssn".to_string(), MaskType::Full);
        policy.insert("analyst".to_string(), analyst);
        policy.insert("guest".to_string(), guest);

        let gate = PolicyGate::new(policy);
        let plan = gate.mask_plan(
            &["ssn".to_string()],
            &principal(&["analyst", "guest"]),
        );

        assert_eq!(plan["ssn"], MaskType::Full);
    }
}
