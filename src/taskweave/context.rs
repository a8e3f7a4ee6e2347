//! Context bags and workflow correlation.
//!
//! Agent requests carry an open JSON context map. The helpers here implement
//! the merge rules the activities rely on:
//!
//! - [`merge_context`] adds keys from an additional map **without overriding**
//!   values the caller already set.
//! - [`ensure_context_value`] fills a key only when it is missing or invalid
//!   (null, empty or whitespace string, wrong type) — a valid caller value is
//!   never replaced.
//! - [`mirror_prompt_params`] copies request body fields into `prompt_params`
//!   without clobbering pre-existing keys.
//!
//! [`CorrelationContext`] carries the workflow identity into outbound HTTP
//! requests as `X-Workflow-ID`, `X-Parent-Workflow-ID`, and `X-Agent-ID`
//! headers.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};

/// Header carrying the workflow id of the calling workflow.
pub const HEADER_WORKFLOW_ID: &str = "X-Workflow-ID";
/// Header carrying the parent workflow id, for child workflows.
pub const HEADER_PARENT_WORKFLOW_ID: &str = "X-Parent-Workflow-ID";
/// Header carrying the executing agent id.
pub const HEADER_AGENT_ID: &str = "X-Agent-ID";

/// Correlation identity injected into outbound HTTP calls made from inside a
/// workflow context.
#[derive(Debug, Clone, Default)]
pub struct CorrelationContext {
    pub workflow_id: Option<String>,
    pub parent_workflow_id: Option<String>,
    pub agent_id: Option<String>,
}

impl CorrelationContext {
    /// Correlation for a top-level workflow.
    pub fn for_workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            parent_workflow_id: None,
            agent_id: None,
        }
    }

    /// Builder: set the parent workflow id.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_workflow_id = Some(parent.into());
        self
    }

    /// Builder: set the agent id.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Render the correlation headers. Values that are not valid header
    /// strings are skipped rather than failing the request.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let pairs = [
            (HEADER_WORKFLOW_ID, &self.workflow_id),
            (HEADER_PARENT_WORKFLOW_ID, &self.parent_workflow_id),
            (HEADER_AGENT_ID, &self.agent_id),
        ];
        for (name, value) in pairs {
            if let Some(value) = value {
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => log::warn!("skipping invalid correlation header {}={:?}", name, value),
                }
            }
        }
        headers
    }
}

/// Whether a context value is considered valid for identity-like keys.
///
/// Null, non-strings, and empty or whitespace-only strings are invalid and
/// may be overwritten by [`ensure_context_value`].
pub fn is_valid_context_value(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.trim().is_empty(),
        _ => false,
    }
}

/// Fill `key` with `value` when it is missing or invalid. A valid caller
/// value is never overridden.
///
/// ```
/// use serde_json::{json, Map, Value};
/// use taskweave::context::ensure_context_value;
///
/// let mut ctx = Map::new();
/// ctx.insert("session_id".into(), json!(""));
/// ensure_context_value(&mut ctx, "session_id", "session-empty-fix");
/// assert_eq!(ctx["session_id"], json!("session-empty-fix"));
///
/// ensure_context_value(&mut ctx, "session_id", "other");
/// assert_eq!(ctx["session_id"], json!("session-empty-fix"));
/// ```
pub fn ensure_context_value(context: &mut Map<String, Value>, key: &str, value: &str) {
    let needs_fill = match context.get(key) {
        None => true,
        Some(existing) => !is_valid_context_value(existing),
    };
    if needs_fill {
        context.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// Merge `additional` into `base` without overriding existing keys.
///
/// ```
/// use serde_json::{json, Map, Value};
/// use taskweave::context::merge_context;
///
/// let mut base: Map<String, Value> = Map::new();
/// base.insert("role".into(), json!("existing_role"));
///
/// let mut additional = Map::new();
/// additional.insert("role".into(), json!("new_role"));
/// additional.insert("extra".into(), json!("x"));
///
/// merge_context(&mut base, &additional);
/// assert_eq!(base["role"], json!("existing_role"));
/// assert_eq!(base["extra"], json!("x"));
/// ```
pub fn merge_context(base: &mut Map<String, Value>, additional: &Map<String, Value>) {
    for (key, value) in additional {
        if !base.contains_key(key) {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Mirror request body fields into `prompt_params`, skipping keys already
/// present so explicit prompt parameters always win.
pub fn mirror_prompt_params(body: &Map<String, Value>, prompt_params: &mut Map<String, Value>) {
    for (key, value) in body {
        if key == "prompt_params" {
            continue;
        }
        if !prompt_params.contains_key(key) {
            prompt_params.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_context_values() {
        assert!(is_valid_context_value(&json!("session-1")));
        assert!(!is_valid_context_value(&json!("")));
        assert!(!is_valid_context_value(&json!("   ")));
        assert!(!is_valid_context_value(&Value::Null));
        assert!(!is_valid_context_value(&json!(42)));
        assert!(!is_valid_context_value(&json!({"nested": true})));
    }

    #[test]
    fn test_ensure_fills_wrong_type() {
        let mut ctx = Map::new();
        ctx.insert("agent_id".into(), json!(7));
        ensure_context_value(&mut ctx, "agent_id", "agent-1");
        assert_eq!(ctx["agent_id"], json!("agent-1"));
    }

    #[test]
    fn test_ensure_fills_missing() {
        let mut ctx = Map::new();
        ensure_context_value(&mut ctx, "session_id", "session-1");
        assert_eq!(ctx["session_id"], json!("session-1"));
    }

    #[test]
    fn test_merge_keeps_existing() {
        let mut base = Map::new();
        base.insert("role".into(), json!("existing_role"));
        let mut additional = Map::new();
        additional.insert("role".into(), json!("new_role"));
        additional.insert("extra".into(), json!("x"));
        merge_context(&mut base, &additional);
        assert_eq!(base["role"], json!("existing_role"));
        assert_eq!(base["extra"], json!("x"));
    }

    #[test]
    fn test_mirror_prompt_params_no_override() {
        let mut body = Map::new();
        body.insert("query".into(), json!("q"));
        body.insert("persona".into(), json!("analyst"));
        body.insert("prompt_params".into(), json!({"ignored": true}));

        let mut params = Map::new();
        params.insert("persona".into(), json!("pre-set"));
        mirror_prompt_params(&body, &mut params);

        assert_eq!(params["persona"], json!("pre-set"));
        assert_eq!(params["query"], json!("q"));
        assert!(!params.contains_key("ignored"));
    }

    #[test]
    fn test_correlation_headers() {
        let ctx = CorrelationContext::for_workflow("wf-1")
            .with_parent("wf-0")
            .with_agent("agent-7");
        let headers = ctx.headers();
        assert_eq!(headers.get(HEADER_WORKFLOW_ID).unwrap(), "wf-1");
        assert_eq!(headers.get(HEADER_PARENT_WORKFLOW_ID).unwrap(), "wf-0");
        assert_eq!(headers.get(HEADER_AGENT_ID).unwrap(), "agent-7");

        let empty = CorrelationContext::default().headers();
        assert!(empty.is_empty());
    }
}
