//! In-memory reference implementations of the store contracts.
//!
//! Used by tests and local runs. All implementations are concurrency-safe
//! and honour the same semantics as their remote counterparts: idempotent
//! upserts by id, cosine search with filters and thresholds, TTL expiry on
//! the key-value store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::taskweave::error::{Error, Result};
use crate::taskweave::stores::{
    Embedder, KvStore, ScoredPoint, SearchFilter, Session, SessionMessage, SessionStore,
    VectorPoint, VectorStore,
};

/// Cosine similarity of two vectors; `0.0` when either has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// In-memory [`VectorStore`] with cosine search.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: Mutex<HashMap<String, HashMap<String, VectorPoint>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points in a collection, for tests.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .expect("vector store poisoned")
            .get(collection)
            .map(|points| points.len())
            .unwrap_or(0)
    }

    /// Whether a collection is empty or absent.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut collections = self.collections.lock().expect("vector store poisoned");
        let entry = collections.entry(collection.to_string()).or_default();
        for point in points {
            entry.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        filter: &SearchFilter,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.lock().expect("vector store poisoned");
        let Some(points) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<ScoredPoint> = points
            .values()
            .filter(|point| filter.matches(&point.payload))
            .filter_map(|point| {
                let score = cosine_similarity(query_vector, &point.vector);
                if score >= threshold {
                    Some(ScoredPoint {
                        id: point.id.clone(),
                        score,
                        payload: point.payload.clone(),
                        vector: Some(point.vector.clone()),
                    })
                } else {
                    None
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.lock().expect("session store poisoned");
        Ok(sessions.get(session_id).cloned())
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn add_message(&self, session_id: &str, message: SessionMessage) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, ""));
        session.messages.push(message);
        Ok(())
    }
}

/// In-memory [`KvStore`] with TTL expiry checked on read.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().expect("kv store poisoned");
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().expect("kv store poisoned");
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("kv store poisoned");
        entries.remove(key);
        Ok(())
    }
}

/// A [`KvStore`] wrapper that fails every operation, for exercising the
/// fatal-on-store-failure paths in tests.
pub struct FailingKvStore;

#[async_trait]
impl KvStore for FailingKvStore {
    async fn set_with_ttl(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
        Err(Error::store("kv store unavailable"))
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::store("kv store unavailable"))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(Error::store("kv store unavailable"))
    }
}

/// Deterministic embedding over token hashes.
///
/// Not a semantic embedding — it exists so the memory layer can run without
/// a remote embeddings service. Identical texts embed identically and texts
/// sharing words land near each other, which is enough for tests and local
/// smoke runs.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    /// Default dimensionality used by the in-memory stack.
    pub const DEFAULT_DIMS: usize = 64;

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMS)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dims];
        for word in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(word.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().expect("digest length"))
                as usize
                % self.dims;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_vector_store_upsert_idempotent() {
        let store = InMemoryVectorStore::new();
        let point = VectorPoint {
            id: "p1".into(),
            vector: vec![1.0, 0.0],
            payload: json!({"session_id": "s1"}),
        };
        store.upsert("memories", vec![point.clone()]).await.unwrap();
        store.upsert("memories", vec![point]).await.unwrap();
        assert_eq!(store.len("memories"), 1);
    }

    #[tokio::test]
    async fn test_vector_store_filter_and_threshold() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "memories",
                vec![
                    VectorPoint {
                        id: "in-session".into(),
                        vector: vec![1.0, 0.0],
                        payload: json!({"session_id": "s1", "tenant_id": "t1"}),
                    },
                    VectorPoint {
                        id: "other-session".into(),
                        vector: vec![1.0, 0.0],
                        payload: json!({"session_id": "s2", "tenant_id": "t1"}),
                    },
                    VectorPoint {
                        id: "dissimilar".into(),
                        vector: vec![0.0, 1.0],
                        payload: json!({"session_id": "s1", "tenant_id": "t1"}),
                    },
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search("memories", &[1.0, 0.0], &SearchFilter::scoped("s1", "t1"), 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "in-session");
    }

    #[tokio::test]
    async fn test_kv_ttl_expiry() {
        let store = InMemoryKvStore::new();
        store
            .set_with_ttl("review:wf", "{}".into(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store.get("review:wf").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("review:wf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("rust orchestrator").await.unwrap();
        let b = embedder.embed("rust orchestrator").await.unwrap();
        assert_eq!(a, b);
        let c = embedder.embed("completely different words").await.unwrap();
        assert!(cosine_similarity(&a, &c) < cosine_similarity(&a, &b));
    }
}
