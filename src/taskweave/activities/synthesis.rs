//! Result synthesis.
//!
//! Two strategies: a concatenative fallback ("simple") that never fails, and
//! LLM-backed synthesis that selects a role-aware prompt, instructs the model
//! to answer in the query's language (detected from Unicode blocks), and
//! enforces a citation floor derived from the available citations. Per-agent
//! content is capped inside the prompt; the output token allowance scales
//! with the number of agents and is not hard-capped.
//!
//! On success the activity emits an ordered event triplet: `LLM_OUTPUT` with
//! the final text, `DATA_PROCESSING` with the token summary, and
//! `DATA_PROCESSING` with a ready status. A response that cannot be decoded
//! falls back to simple synthesis with the raw body logged truncated.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{json, Map, Value};

use crate::taskweave::activities::{bounded, retry_with_backoff, ActivityContext, ActivityRegistry};
use crate::taskweave::error::Result;
use crate::taskweave::event_bus::EventType;
use crate::taskweave::stores::AgentQueryRequest;
use crate::taskweave::types::{AgentExecutionResult, Citation};

/// Cap on each agent's contribution inside the synthesis prompt, characters.
const PER_AGENT_CHAR_CAP: usize = 4000;

/// Base output token allowance per contributing agent.
const OUTPUT_TOKENS_PER_AGENT: u64 = 1024;

/// Minimum citation floor when at least that many citations exist.
const CITATION_FLOOR_MIN: usize = 3;

/// Default citation target when plenty of citations are available.
const CITATION_FLOOR_DEFAULT: usize = 6;

/// Synthesis strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStrategy {
    /// Concatenate agent responses. Never calls the LLM.
    Simple,
    /// LLM-backed synthesis with language matching and citations.
    Llm,
}

/// Input to [`ActivityRegistry::synthesize`].
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    pub query: String,
    pub results: Vec<AgentExecutionResult>,
    pub citations: Vec<Citation>,
    /// Role key selecting the prompt template (e.g. `"researcher"`).
    pub role: Option<String>,
    pub strategy: SynthesisStrategy,
}

/// Output of synthesis.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SynthesisResult {
    pub text: String,
    pub tokens_used: u64,
    /// The citation floor that was enforced.
    pub citation_floor: usize,
    /// Detected script of the query, as an instruction tag.
    pub language: String,
}

/// Script detected from Unicode blocks, used to instruct language matching.
///
/// A small table by block is sufficient here; full language identification
/// is out of scope.
pub fn detect_script(text: &str) -> &'static str {
    let mut counts: [usize; 8] = [0; 8];
    for ch in text.chars() {
        let code = ch as u32;
        let bucket = match code {
            0x4E00..=0x9FFF | 0x3040..=0x30FF => 1, // CJK + kana
            0xAC00..=0xD7AF => 2,                   // Hangul
            0x0400..=0x04FF => 3,                   // Cyrillic
            0x0600..=0x06FF => 4,                   // Arabic
            0x0590..=0x05FF => 5,                   // Hebrew
            0x0370..=0x03FF => 6,                   // Greek
            0x0900..=0x097F => 7,                   // Devanagari
            c if c < 128 && (c as u8).is_ascii_alphabetic() => 0,
            _ => continue,
        };
        counts[bucket] += 1;
    }
    let (best, &count) = counts
        .iter()
        .enumerate()
        .max_by_key(|(_, &count)| count)
        .expect("non-empty buckets");
    if count == 0 {
        return "latin";
    }
    match best {
        1 => "cjk",
        2 => "hangul",
        3 => "cyrillic",
        4 => "arabic",
        5 => "hebrew",
        6 => "greek",
        7 => "devanagari",
        _ => "latin",
    }
}

/// Citation floor derived from the number of available citations.
///
/// With no citations the floor is zero; with fewer than the minimum the
/// floor is whatever exists; otherwise it is clamped between the minimum (3)
/// and the default target (6).
///
/// ```
/// use taskweave::activities::synthesis::citation_floor;
///
/// assert_eq!(citation_floor(0), 0);
/// assert_eq!(citation_floor(2), 2);
/// assert_eq!(citation_floor(4), 4);
/// assert_eq!(citation_floor(10), 6);
/// ```
pub fn citation_floor(available: usize) -> usize {
    if available <= CITATION_FLOOR_MIN {
        return available;
    }
    available.min(CITATION_FLOOR_DEFAULT)
}

/// Concatenative fallback synthesis.
pub fn simple_synthesis(results: &[AgentExecutionResult]) -> String {
    let mut out = String::new();
    for result in results.iter().filter(|r| r.success) {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("[{}]\n{}", result.agent_id, result.response));
    }
    out
}

/// Built-in role templates, overridable by files in the configured
/// templates directory (`<role>.txt`).
fn role_template(role: &str, templates_dir: Option<&Path>) -> String {
    if let Some(dir) = templates_dir {
        let candidate = dir.join(format!("{}.txt", role));
        if let Ok(template) = std::fs::read_to_string(&candidate) {
            return template;
        }
    }
    let builtin: HashMap<&str, &str> = HashMap::from([
        (
            "researcher",
            "You are a research synthesizer. Combine the findings below into a \
             rigorous, well-structured answer. Attribute claims to sources.",
        ),
        (
            "analyst",
            "You are an analyst. Synthesize the agent findings below into a \
             concise assessment with clear conclusions.",
        ),
        (
            "default",
            "Synthesize the agent results below into one coherent answer to \
             the user's question.",
        ),
    ]);
    builtin
        .get(role)
        .or_else(|| builtin.get("default"))
        .expect("default template exists")
        .to_string()
}

fn language_instruction(script: &str) -> String {
    match script {
        "latin" => "Answer in the same language as the question.".to_string(),
        other => format!(
            "The question uses the {} script; answer in the question's language.",
            other
        ),
    }
}

impl ActivityRegistry {
    /// Synthesize agent results into a final answer.
    ///
    /// The simple strategy, and any decode failure of the LLM path, produce
    /// a concatenative answer so synthesis never leaves the workflow without
    /// output.
    pub async fn synthesize(
        &self,
        ctx: &ActivityContext,
        input: &SynthesisInput,
    ) -> Result<SynthesisResult> {
        ctx.heartbeat("synthesis:start");
        let script = detect_script(&input.query);
        let floor = citation_floor(input.citations.len());

        let result = match input.strategy {
            SynthesisStrategy::Simple => SynthesisResult {
                text: simple_synthesis(&input.results),
                tokens_used: 0,
                citation_floor: floor,
                language: script.to_string(),
            },
            SynthesisStrategy::Llm => match self.llm_synthesis(ctx, input, script, floor).await {
                Ok(result) => result,
                Err(err) if !err.is_retryable() => {
                    log::warn!("LLM synthesis failed ({}), falling back to simple", err);
                    SynthesisResult {
                        text: simple_synthesis(&input.results),
                        tokens_used: 0,
                        citation_floor: floor,
                        language: script.to_string(),
                    }
                }
                Err(err) => return Err(err),
            },
        };
        ctx.heartbeat("synthesis:done");

        // Ordered completion triplet.
        ctx.events.emit_with(
            EventType::LlmOutput,
            result.text.clone(),
            Some("synthesizer"),
            None,
        );
        ctx.events.emit_with(
            EventType::DataProcessing,
            "synthesis token summary",
            Some("synthesizer"),
            Some(json!({
                "tokens_used": result.tokens_used,
                "agents": input.results.len(),
                "citation_floor": result.citation_floor,
            })),
        );
        ctx.events.emit_with(
            EventType::DataProcessing,
            "synthesis ready",
            Some("synthesizer"),
            Some(json!({"status": "ready"})),
        );

        Ok(result)
    }

    async fn llm_synthesis(
        &self,
        ctx: &ActivityContext,
        input: &SynthesisInput,
        script: &'static str,
        floor: usize,
    ) -> Result<SynthesisResult> {
        let role = input.role.as_deref().unwrap_or("default");
        let template = role_template(role, self.config.synthesis_templates_dir.as_deref());

        let mut prompt = String::new();
        prompt.push_str(&template);
        prompt.push_str("\n\n");
        prompt.push_str(&language_instruction(script));
        if floor > 0 {
            prompt.push_str(&format!(
                "\nCite at least {} of the provided sources inline as [n].",
                floor
            ));
        }
        prompt.push_str(&format!("\n\nQuestion:\n{}\n\nAgent findings:\n", input.query));
        for result in input.results.iter().filter(|r| r.success) {
            let mut content = result.response.clone();
            if content.len() > PER_AGENT_CHAR_CAP {
                let mut cut = PER_AGENT_CHAR_CAP;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
                content.push('…');
            }
            prompt.push_str(&format!("--- {} ---\n{}\n", result.agent_id, content));
        }
        if !input.citations.is_empty() {
            prompt.push_str("\nSources:\n");
            for (index, citation) in input.citations.iter().enumerate() {
                prompt.push_str(&format!("[{}] {} — {}\n", index + 1, citation.title, citation.url));
            }
        }

        // Output allowance scales with agent count; no hard cap.
        let max_tokens = OUTPUT_TOKENS_PER_AGENT * input.results.len().max(1) as u64;
        let mut context = Map::new();
        context.insert("role".into(), Value::String(role.to_string()));
        let request = AgentQueryRequest {
            query: prompt,
            context,
            allowed_tools: Vec::new(),
            agent_id: "synthesizer".into(),
            max_tokens: Some(max_tokens),
        };

        let correlation = ctx.correlation(Some("synthesizer"));
        let deadline = self.config.timeouts.verify; // synthesis shares the long deadline
        let response = retry_with_backoff(&self.retry, |_| {
            bounded(ctx, deadline, self.llm.query(&request, &correlation))
        })
        .await?;

        Ok(SynthesisResult {
            text: response.response,
            tokens_used: response.tokens_used.max(
                response.metadata.input_tokens + response.metadata.output_tokens,
            ),
            citation_floor: floor,
            language: script.to_string(),
        })
    }
}
