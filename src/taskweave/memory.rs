//! Hierarchical memory retrieval and the session write path.
//!
//! Retrieval composes three sources into one deduplicated, optionally
//! diversity-re-ranked sequence used to condition prompts:
//!
//! - **Recent session**: the latest-k messages scoped by session and tenant.
//! - **Semantic**: the query embedding against stored question/answer pairs,
//!   chunk-aware — long answers are chunked on write and reconstructed on
//!   read by ordering chunks sharing a `parent_id`.
//! - **Summaries**: compression summaries from their own collection.
//!
//! Each returned item carries its [`MemorySource`] tag; the sequence is
//! truncated to a configured maximum and contains no two items with the same
//! dedup key.
//!
//! The write path redacts PII when asked, embeds with the configured
//! embedder, and upserts with stable content-derived ids so writes are
//! idempotent.
//!
//! Compression is gated, not automatic: [`compression_due`] says when the
//! workflow may call the compression activity, based on estimated history
//! tokens, new-message count, and elapsed time.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::taskweave::config::MemoryConfig;
use crate::taskweave::error::Result;
use crate::taskweave::stores::in_memory::cosine_similarity;
use crate::taskweave::stores::{
    Embedder, ScoredPoint, SearchFilter, Session, SessionStore, VectorPoint, VectorStore,
};
use crate::taskweave::types::CompressionState;

/// Collection holding stored question/answer memories and their chunks.
pub const MEMORY_COLLECTION: &str = "task_memories";
/// Collection holding compression summaries.
pub const SUMMARY_COLLECTION: &str = "session_summaries";

/// Session metadata key under which [`CompressionState`] is stored.
pub const COMPRESSION_STATE_KEY: &str = "compression_state";

/// Which tier a retrieved item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    Recent,
    Semantic,
    Summary,
}

/// One retrieved memory item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    /// Stored point id, when the item has one.
    #[serde(default)]
    pub id: String,
    /// Original query, for question/answer memories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// The memory content.
    pub answer: String,
    /// Retrieval score; `1.0` for recent-session items.
    pub score: f64,
    /// Source tier tag (`_source` on the wire).
    #[serde(rename = "_source")]
    pub source: MemorySource,
    /// Summary id, for summary items lacking a point id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_id: Option<String>,
    /// Embedding of the item when the store returned one; used by MMR.
    #[serde(skip)]
    pub vector: Option<Vec<f32>>,
}

/// Dedup key for a retrieved item.
///
/// Preference order: the stored point id; then a composite of the query and
/// the first 100 characters of the answer; then `"summary_" + summary_id`;
/// finally the answer prefix alone.
///
/// ```
/// use taskweave::memory::{dedup_key, MemoryHit, MemorySource};
///
/// let hit = MemoryHit {
///     id: "point-1".into(),
///     query: Some("q".into()),
///     answer: "a".into(),
///     score: 0.9,
///     source: MemorySource::Semantic,
///     summary_id: None,
///     vector: None,
/// };
/// assert_eq!(dedup_key(&hit), "point-1");
/// ```
pub fn dedup_key(hit: &MemoryHit) -> String {
    if !hit.id.trim().is_empty() {
        return hit.id.clone();
    }
    if let Some(query) = &hit.query {
        if !query.is_empty() {
            return format!("{}{}", query, answer_prefix(&hit.answer));
        }
    }
    if let Some(summary_id) = &hit.summary_id {
        return format!("summary_{}", summary_id);
    }
    answer_prefix(&hit.answer).to_string()
}

fn answer_prefix(answer: &str) -> &str {
    let mut cut = answer.len().min(100);
    while !answer.is_char_boundary(cut) {
        cut -= 1;
    }
    &answer[..cut]
}

/// Drop items whose dedup key was already seen, preserving first-seen order.
pub fn dedup_hits(hits: Vec<MemoryHit>) -> Vec<MemoryHit> {
    let mut seen = std::collections::HashSet::new();
    hits.into_iter()
        .filter(|hit| seen.insert(dedup_key(hit)))
        .collect()
}

/// Rough token estimate used for chunking and the compression gate.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

/// Jaccard similarity of the word sets of two texts, in `[0,1]`.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<String> =
        a.split_whitespace().map(|w| w.to_lowercase()).collect();
    let set_b: std::collections::HashSet<String> =
        b.split_whitespace().map(|w| w.to_lowercase()).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Maximal Marginal Relevance re-ranking.
///
/// Selects up to `k` items balancing relevance (the retrieval score) against
/// diversity among already-selected items: `λ · rel − (1−λ) · max_sim`.
/// λ near 1 favours relevance, λ near 0 favours diversity. Similarity uses
/// embedding cosine when both items carry vectors, word-set Jaccard
/// otherwise.
pub fn mmr_rerank(candidates: Vec<MemoryHit>, lambda: f64, k: usize) -> Vec<MemoryHit> {
    let lambda = lambda.clamp(0.0, 1.0);
    let mut pool = candidates;
    let mut selected: Vec<MemoryHit> = Vec::new();

    while selected.len() < k && !pool.is_empty() {
        let mut best_index = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (index, candidate) in pool.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|chosen| hit_similarity(candidate, chosen))
                .fold(0.0f64, f64::max);
            let mmr = lambda * candidate.score - (1.0 - lambda) * max_sim;
            if mmr > best_score {
                best_score = mmr;
                best_index = index;
            }
        }
        selected.push(pool.remove(best_index));
    }
    selected
}

fn hit_similarity(a: &MemoryHit, b: &MemoryHit) -> f64 {
    match (&a.vector, &b.vector) {
        (Some(va), Some(vb)) => cosine_similarity(va, vb),
        _ => jaccard_similarity(&a.answer, &b.answer),
    }
}

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex");
    static ref PHONE_RE: Regex =
        Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("phone regex");
}

/// Redact emails and phone numbers from a text.
///
/// ```
/// use taskweave::memory::redact_pii;
///
/// let redacted = redact_pii("mail me at jane@example.com or +1 (555) 123-4567");
/// assert!(!redacted.contains("jane@example.com"));
/// assert!(!redacted.contains("555"));
/// assert!(redacted.contains("[redacted-email]"));
/// assert!(redacted.contains("[redacted-phone]"));
/// ```
pub fn redact_pii(text: &str) -> String {
    let redacted = EMAIL_RE.replace_all(text, "[redacted-email]");
    PHONE_RE.replace_all(&redacted, "[redacted-phone]").into_owned()
}

/// Split a text into chunks of roughly `chunk_tokens` tokens with
/// `overlap_tokens` of overlap between consecutive chunks.
pub fn split_into_chunks(text: &str, chunk_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let chunk_chars = chunk_tokens.max(1) * 4;
    let overlap_chars = overlap_tokens * 4;
    let stride = chunk_chars.saturating_sub(overlap_chars).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_chars).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

/// Stable content-derived id for an upserted memory.
pub fn content_id(session_id: &str, query: &str, answer: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(query.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(answer.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 32)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

/// Whether the compression gate is open.
///
/// All three conditions must hold: estimated history tokens above the window
/// fraction, enough new messages since the last compression, and enough time
/// elapsed.
pub fn compression_due(
    config: &MemoryConfig,
    state: &CompressionState,
    history_tokens: usize,
    message_count: usize,
    now: DateTime<Utc>,
) -> bool {
    let window_limit =
        (config.model_window as f64 * config.compression_window_fraction) as usize;
    if history_tokens <= window_limit {
        return false;
    }
    if message_count.saturating_sub(state.last_message_count) < config.compression_min_new_messages
    {
        return false;
    }
    match state.last_compressed_at {
        None => true,
        Some(last) => {
            let min_interval = ChronoDuration::from_std(config.compression_min_interval)
                .unwrap_or_else(|_| ChronoDuration::minutes(30));
            now - last >= min_interval
        }
    }
}

/// Read the compression state from a session's metadata bag.
pub fn load_compression_state(session: &Session) -> CompressionState {
    session
        .metadata
        .get(COMPRESSION_STATE_KEY)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

/// Write the compression state into a session's metadata bag.
pub fn store_compression_state(session: &mut Session, state: &CompressionState) {
    session.metadata.insert(
        COMPRESSION_STATE_KEY.to_string(),
        serde_json::to_value(state).expect("compression state serializes"),
    );
}

/// A retrieval request.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    pub session_id: String,
    pub tenant_id: String,
}

/// A write-path request.
#[derive(Debug, Clone)]
pub struct RecordQueryRequest {
    pub session_id: String,
    pub tenant_id: String,
    pub query: String,
    pub answer: String,
    pub agent_id: Option<String>,
    /// Redact emails/phone numbers before persisting.
    pub redact_pii: bool,
}

/// Hierarchical memory over a vector store, a session store, and an embedder.
pub struct MemoryService {
    vector: Arc<dyn VectorStore>,
    sessions: Arc<dyn SessionStore>,
    embedder: Arc<dyn Embedder>,
    config: MemoryConfig,
}

impl MemoryService {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        sessions: Arc<dyn SessionStore>,
        embedder: Arc<dyn Embedder>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            vector,
            sessions,
            embedder,
            config,
        }
    }

    /// Retrieve conditioning memory for a query: recent session items, then
    /// semantic hits (MMR re-ranked when configured), then summaries —
    /// deduplicated and truncated to the configured maximum.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<Vec<MemoryHit>> {
        let mut hits: Vec<MemoryHit> = Vec::new();

        // Recent session tier.
        if let Some(session) = self.sessions.get_session(&request.session_id).await? {
            let start = session.messages.len().saturating_sub(self.config.recent_k);
            for message in &session.messages[start..] {
                hits.push(MemoryHit {
                    id: String::new(),
                    query: None,
                    answer: message.content.clone(),
                    score: 1.0,
                    source: MemorySource::Recent,
                    summary_id: None,
                    vector: None,
                });
            }
        }

        let query_vector = self.embedder.embed(&request.query).await?;
        let filter = SearchFilter::scoped(&request.session_id, &request.tenant_id);

        // Semantic tier, chunk-aware.
        let pool = if self.config.mmr_lambda.is_some() {
            self.config.semantic_k * self.config.mmr_pool_multiplier.max(1)
        } else {
            self.config.semantic_k
        };
        let raw = self
            .vector
            .search(
                MEMORY_COLLECTION,
                &query_vector,
                &filter,
                pool,
                self.config.score_threshold,
            )
            .await?;
        let mut semantic = reconstruct_chunks(raw);
        if let Some(lambda) = self.config.mmr_lambda {
            semantic = mmr_rerank(semantic, lambda, self.config.semantic_k);
        } else {
            semantic.truncate(self.config.semantic_k);
        }
        hits.extend(semantic);

        // Summary tier. MMR is intentionally not applied here.
        let summaries = self
            .vector
            .search(
                SUMMARY_COLLECTION,
                &query_vector,
                &filter,
                self.config.summary_k,
                self.config.score_threshold,
            )
            .await?;
        for point in summaries {
            let answer = point
                .payload
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            hits.push(MemoryHit {
                id: point.id.clone(),
                query: None,
                answer,
                score: point.score,
                source: MemorySource::Summary,
                summary_id: Some(point.id),
                vector: point.vector,
            });
        }

        let mut hits = dedup_hits(hits);
        hits.truncate(self.config.max_total);
        Ok(hits)
    }

    /// Persist a query/answer pair. Long answers are split into overlapping
    /// chunks, each carrying `parent_id`, `chunk_index`, and `chunk_count`.
    /// Ids are content-derived, so re-recording the same pair is a no-op.
    pub async fn record_query(&self, request: &RecordQueryRequest) -> Result<String> {
        let (query, answer) = if request.redact_pii {
            (redact_pii(&request.query), redact_pii(&request.answer))
        } else {
            (request.query.clone(), request.answer.clone())
        };

        let parent_id = content_id(&request.session_id, &query, &answer);
        let base_payload = |extra: Value| {
            let mut payload = json!({
                "session_id": request.session_id,
                "tenant_id": request.tenant_id,
                "query": query,
            });
            if let Some(agent_id) = &request.agent_id {
                payload["agent_id"] = json!(agent_id);
            }
            if let Value::Object(extra) = extra {
                for (key, value) in extra {
                    payload[key] = value;
                }
            }
            payload
        };

        let mut points = Vec::new();
        if estimate_tokens(&answer) > self.config.chunk_tokens {
            let chunks =
                split_into_chunks(&answer, self.config.chunk_tokens, self.config.chunk_overlap);
            let chunk_count = chunks.len();
            for (index, chunk) in chunks.into_iter().enumerate() {
                let vector = self.embedder.embed(&chunk).await?;
                points.push(VectorPoint {
                    id: format!("{}_c{}", parent_id, index),
                    vector,
                    payload: base_payload(json!({
                        "type": "qa_chunk",
                        "answer": chunk,
                        "parent_id": parent_id,
                        "chunk_index": index,
                        "chunk_count": chunk_count,
                    })),
                });
            }
        } else {
            let vector = self.embedder.embed(&query).await?;
            points.push(VectorPoint {
                id: parent_id.clone(),
                vector,
                payload: base_payload(json!({
                    "type": "qa",
                    "answer": answer,
                })),
            });
        }

        self.vector.upsert(MEMORY_COLLECTION, points).await?;
        Ok(parent_id)
    }

    /// Persist a compression summary to the summary collection. Returns the
    /// summary's content-derived id.
    pub async fn record_summary(
        &self,
        session_id: &str,
        tenant_id: &str,
        summary: &str,
    ) -> Result<String> {
        let id = content_id(session_id, "summary", summary);
        let vector = self.embedder.embed(summary).await?;
        self.vector
            .upsert(
                SUMMARY_COLLECTION,
                vec![VectorPoint {
                    id: id.clone(),
                    vector,
                    payload: json!({
                        "type": "summary",
                        "session_id": session_id,
                        "tenant_id": tenant_id,
                        "summary": summary,
                    }),
                }],
            )
            .await?;
        Ok(id)
    }

    /// Memory configuration in effect.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The backing session store.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }
}

/// Merge chunk hits into reconstructed answers, ordering chunks of the same
/// parent by `chunk_index`. Non-chunk hits pass through unchanged.
fn reconstruct_chunks(raw: Vec<ScoredPoint>) -> Vec<MemoryHit> {
    use std::collections::BTreeMap;

    let mut ordered: Vec<MemoryHit> = Vec::new();
    // parent_id -> (position in `ordered`, chunk_index -> chunk text, best score)
    let mut parents: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut parts: Vec<BTreeMap<u64, String>> = Vec::new();

    for point in raw {
        let payload = &point.payload;
        let answer = payload
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let query = payload
            .get("query")
            .and_then(Value::as_str)
            .map(str::to_string);

        match payload.get("parent_id").and_then(Value::as_str) {
            Some(parent_id) => {
                let chunk_index = payload
                    .get("chunk_index")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                match parents.get(parent_id) {
                    Some(&position) => {
                        parts[position].insert(chunk_index, answer);
                        if point.score > ordered[position].score {
                            ordered[position].score = point.score;
                        }
                    }
                    None => {
                        parents.insert(parent_id.to_string(), ordered.len());
                        let mut chunk_map = BTreeMap::new();
                        chunk_map.insert(chunk_index, answer);
                        parts.push(chunk_map);
                        ordered.push(MemoryHit {
                            id: parent_id.to_string(),
                            query,
                            answer: String::new(),
                            score: point.score,
                            source: MemorySource::Semantic,
                            summary_id: None,
                            vector: point.vector,
                        });
                    }
                }
            }
            None => {
                parents.insert(point.id.clone(), ordered.len());
                parts.push(BTreeMap::new());
                ordered.push(MemoryHit {
                    id: point.id,
                    query,
                    answer,
                    score: point.score,
                    source: MemorySource::Semantic,
                    summary_id: None,
                    vector: point.vector,
                });
            }
        }
    }

    for (position, chunk_map) in parts.into_iter().enumerate() {
        if !chunk_map.is_empty() {
            let joined: Vec<String> = chunk_map.into_values().collect();
            ordered[position].answer = joined.join("");
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, query: Option<&str>, answer: &str, score: f64) -> MemoryHit {
        MemoryHit {
            id: id.to_string(),
            query: query.map(str::to_string),
            answer: answer.to_string(),
            score,
            source: MemorySource::Semantic,
            summary_id: None,
            vector: None,
        }
    }

    #[test]
    fn test_dedup_key_preference_chain() {
        assert_eq!(dedup_key(&hit("p1", Some("q"), "a", 0.9)), "p1");
        assert_eq!(dedup_key(&hit("", Some("q"), "answer", 0.9)), "qanswer");
        let summary = MemoryHit {
            id: String::new(),
            query: None,
            answer: "s".into(),
            score: 0.5,
            source: MemorySource::Summary,
            summary_id: Some("sum-1".into()),
            vector: None,
        };
        assert_eq!(dedup_key(&summary), "summary_sum-1");
    }

    #[test]
    fn test_dedup_preserves_first_seen_order() {
        let hits = vec![
            hit("a", None, "first", 0.9),
            hit("b", None, "second", 0.8),
            hit("a", None, "duplicate", 0.7),
        ];
        let deduped = dedup_hits(hits);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].answer, "first");
        assert_eq!(deduped[1].answer, "second");
    }

    #[test]
    fn test_mmr_lambda_one_is_pure_relevance() {
        let candidates = vec![
            hit("a", None, "alpha beta", 0.5),
            hit("b", None, "alpha beta", 0.9),
            hit("c", None, "gamma delta", 0.7),
        ];
        let ranked = mmr_rerank(candidates, 1.0, 2);
        assert_eq!(ranked[0].id, "b");
        assert_eq!(ranked[1].id, "c");
    }

    #[test]
    fn test_mmr_low_lambda_prefers_diversity() {
        // "b" is nearly identical to "a"; with low lambda the diverse "c"
        // wins the second slot even though "b" scores higher.
        let candidates = vec![
            hit("a", None, "rust async workflow engine", 0.95),
            hit("b", None, "rust async workflow engine", 0.94),
            hit("c", None, "citrus fruit cultivation notes", 0.60),
        ];
        let ranked = mmr_rerank(candidates, 0.1, 2);
        assert_eq!(ranked[0].id, "a");
        assert_eq!(ranked[1].id, "c");
    }

    #[test]
    fn test_split_into_chunks_overlap() {
        let text = "x".repeat(4 * 100); // ~100 tokens
        let chunks = split_into_chunks(&text, 40, 10);
        assert!(chunks.len() > 2);
        // Each chunk is at most 40 tokens worth of characters.
        assert!(chunks.iter().all(|c| c.chars().count() <= 160));
        // Full coverage: total stride reaches the end.
        let rebuilt: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(rebuilt >= text.chars().count());
    }

    #[test]
    fn test_content_id_stable() {
        let a = content_id("s1", "q", "answer");
        let b = content_id("s1", "q", "answer");
        let c = content_id("s1", "q", "different");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_compression_gate() {
        let config = MemoryConfig::default(); // window 16k, fraction 0.75
        let now = Utc::now();

        let fresh = CompressionState::default();
        // Below the token limit: closed.
        assert!(!compression_due(&config, &fresh, 11_000, 40, now));
        // Above tokens, enough messages, never compressed: open.
        assert!(compression_due(&config, &fresh, 12_500, 40, now));

        // Not enough new messages since last compression.
        let state = CompressionState {
            last_compressed_at: Some(now - ChronoDuration::hours(2)),
            last_message_count: 30,
            total_compressions: 1,
        };
        assert!(!compression_due(&config, &state, 12_500, 45, now));
        assert!(compression_due(&config, &state, 12_500, 55, now));

        // Too soon after the last compression.
        let recent = CompressionState {
            last_compressed_at: Some(now - ChronoDuration::minutes(10)),
            last_message_count: 0,
            total_compressions: 1,
        };
        assert!(!compression_due(&config, &recent, 12_500, 40, now));
    }

    #[test]
    fn test_reconstruct_chunks_orders_by_index() {
        let raw = vec![
            ScoredPoint {
                id: "p_c1".into(),
                score: 0.8,
                payload: json!({"parent_id": "p", "chunk_index": 1, "answer": "world", "query": "q"}),
                vector: None,
            },
            ScoredPoint {
                id: "p_c0".into(),
                score: 0.9,
                payload: json!({"parent_id": "p", "chunk_index": 0, "answer": "hello ", "query": "q"}),
                vector: None,
            },
        ];
        let hits = reconstruct_chunks(raw);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].answer, "hello world");
        assert_eq!(hits[0].id, "p");
        assert!((hits[0].score - 0.9).abs() < 1e-9);
    }
}
