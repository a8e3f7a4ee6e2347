//! Approval policy.
//!
//! A pure evaluation: given a policy and a plan-derived context, decide
//! whether human approval is required and why. Evaluated once per plan,
//! immediately after decomposition.
//!
//! Numeric values arriving from JSON may be integers or floats; coercion is
//! explicit via [`coerce_f64`] and [`coerce_u64`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::taskweave::types::DecompositionResult;

/// When approval is required before executing a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Plans at or above this complexity require approval.
    pub complexity_threshold: f64,
    /// Plans projected to spend at least this many tokens require approval;
    /// `None` disables the trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
    /// Tools whose suggested use requires approval.
    #[serde(default)]
    pub require_approval_tools: Vec<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            complexity_threshold: 0.8,
            token_budget: None,
            require_approval_tools: Vec::new(),
        }
    }
}

/// Plan-level aggregates the policy is evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalContext {
    pub complexity_score: f64,
    pub projected_tokens: u64,
    pub suggested_tools: Vec<String>,
}

impl ApprovalContext {
    /// Aggregate a decomposition into an approval context: plan complexity,
    /// total projected tokens, and the union of suggested tools.
    pub fn from_plan(plan: &DecompositionResult) -> Self {
        let mut tools: Vec<String> = Vec::new();
        for subtask in &plan.subtasks {
            for tool in &subtask.suggested_tools {
                if !tools.contains(tool) {
                    tools.push(tool.clone());
                }
            }
        }
        Self {
            complexity_score: plan.complexity_score,
            projected_tokens: plan.total_estimated_tokens,
            suggested_tools: tools,
        }
    }

    /// Build a context from a JSON bag, coercing numerics explicitly.
    pub fn from_json(value: &Value) -> Self {
        Self {
            complexity_score: value
                .get("complexity_score")
                .and_then(coerce_f64)
                .unwrap_or(0.0),
            projected_tokens: value
                .get("projected_tokens")
                .and_then(coerce_u64)
                .unwrap_or(0),
            suggested_tools: value
                .get("suggested_tools")
                .and_then(Value::as_array)
                .map(|tools| {
                    tools
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalCheck {
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Evaluate the policy. Triggers, checked in order: complexity at or above
/// the threshold; projected tokens at or above the budget; any suggested
/// tool on the require-approval list.
pub fn evaluate(policy: &ApprovalPolicy, context: &ApprovalContext) -> ApprovalCheck {
    if context.complexity_score >= policy.complexity_threshold {
        return ApprovalCheck {
            required: true,
            reason: Some(format!(
                "complexity {:.2} >= {:.2}",
                context.complexity_score, policy.complexity_threshold
            )),
        };
    }
    if let Some(budget) = policy.token_budget {
        if context.projected_tokens >= budget {
            return ApprovalCheck {
                required: true,
                reason: Some(format!(
                    "projected {} tokens >= budget {}",
                    context.projected_tokens, budget
                )),
            };
        }
    }
    for tool in &context.suggested_tools {
        if policy.require_approval_tools.iter().any(|t| t == tool) {
            return ApprovalCheck {
                required: true,
                reason: Some(format!("tool {} requires approval", tool)),
            };
        }
    }
    ApprovalCheck {
        required: false,
        reason: None,
    }
}

/// Coerce a JSON number (integer or float) to `f64`.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .or_else(|| number.as_i64().map(|i| i as f64))
            .or_else(|| number.as_u64().map(|u| u as f64)),
        _ => None,
    }
}

/// Coerce a JSON number (integer or float) to `u64`, truncating floats.
pub fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().map(|f| f.max(0.0) as u64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskweave::types::Subtask;
    use serde_json::json;

    fn policy() -> ApprovalPolicy {
        ApprovalPolicy {
            complexity_threshold: 0.7,
            token_budget: Some(10_000),
            require_approval_tools: vec!["shell".into()],
        }
    }

    #[test]
    fn test_complexity_trigger() {
        let check = evaluate(
            &policy(),
            &ApprovalContext {
                complexity_score: 0.75,
                projected_tokens: 100,
                suggested_tools: vec![],
            },
        );
        assert!(check.required);
        assert!(check.reason.unwrap().contains("complexity"));
    }

    #[test]
    fn test_token_budget_trigger() {
        let check = evaluate(
            &policy(),
            &ApprovalContext {
                complexity_score: 0.1,
                projected_tokens: 10_000,
                suggested_tools: vec![],
            },
        );
        assert!(check.required);
        assert!(check.reason.unwrap().contains("tokens"));
    }

    #[test]
    fn test_tool_trigger() {
        let check = evaluate(
            &policy(),
            &ApprovalContext {
                complexity_score: 0.1,
                projected_tokens: 100,
                suggested_tools: vec!["web_search".into(), "shell".into()],
            },
        );
        assert!(check.required);
        assert!(check.reason.unwrap().contains("shell"));
    }

    #[test]
    fn test_no_trigger() {
        let check = evaluate(
            &policy(),
            &ApprovalContext {
                complexity_score: 0.1,
                projected_tokens: 100,
                suggested_tools: vec!["web_search".into()],
            },
        );
        assert!(!check.required);
        assert!(check.reason.is_none());
    }

    #[test]
    fn test_numeric_coercion_from_json() {
        // JSON may deliver integers where floats are expected and vice versa.
        let context = ApprovalContext::from_json(&json!({
            "complexity_score": 1,
            "projected_tokens": 1500.7,
            "suggested_tools": ["shell"]
        }));
        assert!((context.complexity_score - 1.0).abs() < f64::EPSILON);
        assert_eq!(context.projected_tokens, 1500);
        assert_eq!(context.suggested_tools, vec!["shell"]);
    }

    #[test]
    fn test_context_from_plan_unions_tools() {
        let plan = DecompositionResult {
            mode: "standard".into(),
            complexity_score: 0.4,
            subtasks: vec![
                Subtask::new("s1", "one").with_suggested_tool("web_search"),
                Subtask::new("s2", "two")
                    .with_suggested_tool("web_search")
                    .with_suggested_tool("calculator"),
            ],
            total_estimated_tokens: 300,
            execution_strategy: "parallel".into(),
            cognitive_strategy: String::new(),
            confidence: 0.9,
            fallback_strategy: None,
            token_estimates: Default::default(),
            concurrency_limit: 2,
        };
        let context = ApprovalContext::from_plan(&plan);
        assert_eq!(context.suggested_tools, vec!["web_search", "calculator"]);
        assert_eq!(context.projected_tokens, 300);
    }
}
