use std::sync::Arc;

use taskweave::config::MemoryConfig;
use taskweave::memory::{
    dedup_key, MemoryService, MemorySource, RecordQueryRequest, RetrievalRequest,
    MEMORY_COLLECTION, SUMMARY_COLLECTION,
};
use taskweave::stores::in_memory::{HashEmbedder, InMemorySessionStore, InMemoryVectorStore};
use taskweave::stores::{Embedder, SessionMessage, SessionStore, VectorStore};

struct Fixture {
    vector: Arc<InMemoryVectorStore>,
    sessions: Arc<InMemorySessionStore>,
    service: MemoryService,
}

fn fixture(config: MemoryConfig) -> Fixture {
    let vector = Arc::new(InMemoryVectorStore::new());
    let sessions = Arc::new(InMemorySessionStore::new());
    let service = MemoryService::new(
        Arc::clone(&vector) as Arc<dyn VectorStore>,
        Arc::clone(&sessions) as Arc<dyn SessionStore>,
        Arc::new(HashEmbedder::default()),
        config,
    );
    Fixture {
        vector,
        sessions,
        service,
    }
}

fn low_threshold_config() -> MemoryConfig {
    MemoryConfig {
        score_threshold: 0.0,
        ..MemoryConfig::default()
    }
}

#[tokio::test]
async fn test_retrieval_layers_and_source_tags() {
    let fx = fixture(low_threshold_config());

    fx.sessions
        .add_message("session-1", SessionMessage::new("user", "earlier question"))
        .await
        .unwrap();
    fx.sessions
        .add_message("session-1", SessionMessage::new("assistant", "earlier answer"))
        .await
        .unwrap();

    fx.service
        .record_query(&RecordQueryRequest {
            session_id: "session-1".into(),
            tenant_id: "tenant-1".into(),
            query: "how do orchestrators plan work".into(),
            answer: "they decompose queries into subtasks".into(),
            agent_id: None,
            redact_pii: false,
        })
        .await
        .unwrap();

    fx.service
        .record_summary("session-1", "tenant-1", "session covered planning basics")
        .await
        .unwrap();

    let hits = fx
        .service
        .retrieve(&RetrievalRequest {
            query: "how do orchestrators plan work".into(),
            session_id: "session-1".into(),
            tenant_id: "tenant-1".into(),
        })
        .await
        .unwrap();

    assert!(hits.iter().any(|h| h.source == MemorySource::Recent));
    assert!(hits.iter().any(|h| h.source == MemorySource::Semantic));
    assert!(hits.iter().any(|h| h.source == MemorySource::Summary));

    // No two items share a dedup key.
    let mut keys: Vec<String> = hits.iter().map(dedup_key).collect();
    let before = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), before);
}

#[tokio::test]
async fn test_retrieval_scoped_by_session() {
    let fx = fixture(low_threshold_config());

    fx.service
        .record_query(&RecordQueryRequest {
            session_id: "session-other".into(),
            tenant_id: "tenant-1".into(),
            query: "private question".into(),
            answer: "private answer".into(),
            agent_id: None,
            redact_pii: false,
        })
        .await
        .unwrap();

    let hits = fx
        .service
        .retrieve(&RetrievalRequest {
            query: "private question".into(),
            session_id: "session-1".into(),
            tenant_id: "tenant-1".into(),
        })
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_long_answer_chunked_and_reconstructed() {
    let config = MemoryConfig {
        score_threshold: 0.0,
        chunk_tokens: 20,
        chunk_overlap: 0,
        ..MemoryConfig::default()
    };
    let fx = fixture(config);

    // ~75 tokens worth of characters, far above the 20-token chunk size.
    let long_answer = "orchestrators plan decompose execute verify synthesize "
        .repeat(6);
    fx.service
        .record_query(&RecordQueryRequest {
            session_id: "session-1".into(),
            tenant_id: "tenant-1".into(),
            query: "what do orchestrators do".into(),
            answer: long_answer.clone(),
            agent_id: None,
            redact_pii: false,
        })
        .await
        .unwrap();

    // Only chunk points were written.
    assert!(fx.vector.len(MEMORY_COLLECTION) > 1);

    let hits = fx
        .service
        .retrieve(&RetrievalRequest {
            query: "what do orchestrators do".into(),
            session_id: "session-1".into(),
            tenant_id: "tenant-1".into(),
        })
        .await
        .unwrap();

    let semantic: Vec<_> = hits
        .iter()
        .filter(|h| h.source == MemorySource::Semantic)
        .collect();
    // Chunks sharing a parent reconstruct into one hit.
    assert_eq!(semantic.len(), 1);
    assert!(semantic[0].answer.len() >= long_answer.len() / 2);
}

#[tokio::test]
async fn test_write_idempotent_by_content_id() {
    let fx = fixture(low_threshold_config());
    let request = RecordQueryRequest {
        session_id: "session-1".into(),
        tenant_id: "tenant-1".into(),
        query: "idempotent?".into(),
        answer: "yes".into(),
        agent_id: None,
        redact_pii: false,
    };

    let id_a = fx.service.record_query(&request).await.unwrap();
    let id_b = fx.service.record_query(&request).await.unwrap();
    assert_eq!(id_a, id_b);
    assert_eq!(fx.vector.len(MEMORY_COLLECTION), 1);
}

#[tokio::test]
async fn test_pii_redacted_before_persisting() {
    let fx = fixture(low_threshold_config());
    fx.service
        .record_query(&RecordQueryRequest {
            session_id: "session-1".into(),
            tenant_id: "tenant-1".into(),
            query: "contact jane@example.com".into(),
            answer: "call +1 (555) 123-4567 tomorrow".into(),
            agent_id: None,
            redact_pii: true,
        })
        .await
        .unwrap();

    let embedder = HashEmbedder::default();
    let query_vector = embedder.embed("contact").await.unwrap();
    let hits = fx
        .vector
        .search(
            MEMORY_COLLECTION,
            &query_vector,
            &taskweave::stores::SearchFilter::scoped("session-1", "tenant-1"),
            10,
            0.0,
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    let payload = serde_json::to_string(&hits[0].payload).unwrap();
    assert!(!payload.contains("jane@example.com"));
    assert!(!payload.contains("555"));
    assert!(payload.contains("[redacted-email]"));
    assert!(payload.contains("[redacted-phone]"));
}

#[tokio::test]
async fn test_truncated_to_max_total() {
    let config = MemoryConfig {
        score_threshold: 0.0,
        max_total: 3,
        recent_k: 10,
        ..MemoryConfig::default()
    };
    let fx = fixture(config);

    for n in 0..8 {
        fx.sessions
            .add_message("session-1", SessionMessage::new("user", format!("message {}", n)))
            .await
            .unwrap();
    }

    let hits = fx
        .service
        .retrieve(&RetrievalRequest {
            query: "anything".into(),
            session_id: "session-1".into(),
            tenant_id: "tenant-1".into(),
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
}

#[tokio::test]
async fn test_summary_collection_separate() {
    let fx = fixture(low_threshold_config());
    fx.service
        .record_summary("session-1", "tenant-1", "the summary")
        .await
        .unwrap();
    assert_eq!(fx.vector.len(SUMMARY_COLLECTION), 1);
    assert_eq!(fx.vector.len(MEMORY_COLLECTION), 0);
}
