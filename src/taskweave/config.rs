//! Configuration for taskweave.
//!
//! All tunables live in typed structs with documented defaults. Users
//! construct them manually — no file parsing dependencies are required.
//! Environment overrides for the handful of operationally relevant knobs are
//! applied by the `from_env` constructors:
//!
//! | Variable | Effect |
//! |---|---|
//! | `LLM_SERVICE_URL` | Base URL of the agent/LLM HTTP service |
//! | `QDRANT_URL` / `QDRANT_HOST` | Base URL of the vector store |
//! | `REDIS_URL` | Address of the session/key-value store |
//! | `BACKPRESSURE_THRESHOLD` | Utilisation ratio at which backpressure starts |
//! | `MAX_BACKPRESSURE_DELAY_MS` | Cap on the suggested backpressure delay |
//! | `DECOMPOSE_TIMEOUT_SECONDS` | Decomposition activity deadline |
//! | `AGENT_LOOP_STEP_TIMEOUT_SECONDS` | Agent loop step deadline |
//! | `SYNTHESIS_TEMPLATES_DIR` | Directory of role synthesis templates |
//!
//! # Example
//!
//! ```rust
//! use taskweave::config::TaskweaveConfig;
//!
//! let config = TaskweaveConfig::default();
//! assert_eq!(config.llm_service_url, "http://llm-service:8000");
//! assert!((config.backpressure.threshold - 0.8).abs() < f64::EPSILON);
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Default base URL of the LLM agent service.
pub const DEFAULT_LLM_SERVICE_URL: &str = "http://llm-service:8000";

/// Global configuration for the orchestrator core.
#[derive(Debug, Clone)]
pub struct TaskweaveConfig {
    /// Base URL of the agent/LLM HTTP service.
    pub llm_service_url: String,
    /// Base URL of the vector store, when an HTTP-backed store is used.
    pub vector_store_url: Option<String>,
    /// Address of the session/key-value store, when a remote store is used.
    pub session_store_url: Option<String>,
    /// Budget ledger defaults and failure semantics.
    pub budget: BudgetConfig,
    /// Backpressure curve.
    pub backpressure: BackpressureConfig,
    /// Per-user circuit breaker thresholds.
    pub breaker: BreakerConfig,
    /// Memory retrieval and compression tunables.
    pub memory: MemoryConfig,
    /// Per-activity deadlines.
    pub timeouts: ActivityTimeouts,
    /// Optional directory of role-keyed synthesis prompt templates.
    pub synthesis_templates_dir: Option<PathBuf>,
}

impl Default for TaskweaveConfig {
    fn default() -> Self {
        Self {
            llm_service_url: DEFAULT_LLM_SERVICE_URL.to_string(),
            vector_store_url: None,
            session_store_url: None,
            budget: BudgetConfig::default(),
            backpressure: BackpressureConfig::default(),
            breaker: BreakerConfig::default(),
            memory: MemoryConfig::default(),
            timeouts: ActivityTimeouts::default(),
            synthesis_templates_dir: None,
        }
    }
}

impl TaskweaveConfig {
    /// Build a config from defaults plus recognised environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env_string("LLM_SERVICE_URL") {
            config.llm_service_url = url;
        }
        config.vector_store_url = env_string("QDRANT_URL").or_else(|| env_string("QDRANT_HOST"));
        config.session_store_url = env_string("REDIS_URL");
        config.backpressure = BackpressureConfig::from_env();
        config.timeouts = ActivityTimeouts::from_env();
        config.synthesis_templates_dir = env_string("SYNTHESIS_TEMPLATES_DIR").map(PathBuf::from);
        config
    }
}

/// Token ledger defaults and failure semantics for the budget manager.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Default per-user budget applied when no ledger exists yet.
    pub default_user_budget: u64,
    /// Default per-session budget.
    pub default_session_budget: u64,
    /// Default per-task budget.
    pub default_task_budget: u64,
    /// Whether exceeding a budget blocks (`true`) or merely warns (`false`).
    pub hard_limit: bool,
    /// Fraction of a budget at which a warning is recorded. Default: `0.8`.
    pub warning_threshold: f64,
    /// When `true`, a ledger read failure lets the step proceed with a logged
    /// warning. Default is `false`: fail closed.
    pub fail_open: bool,
    /// Number of ledger shards. Each shard has its own lock.
    pub shards: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_user_budget: 200_000,
            default_session_budget: 50_000,
            default_task_budget: 20_000,
            hard_limit: true,
            warning_threshold: 0.8,
            fail_open: false,
            shards: 16,
        }
    }
}

/// Backpressure curve keyed by projected-utilisation band.
///
/// The suggested delay is a *value* returned to the workflow; the budget
/// manager never sleeps.
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Projected utilisation at which backpressure activates. Default: `0.8`.
    pub threshold: f64,
    /// Band boundary for medium pressure. Default: `0.85`.
    pub medium_threshold: f64,
    /// Band boundary for high pressure. Default: `0.95`.
    pub high_threshold: f64,
    /// Delay suggested in the low band, milliseconds. Default: `50`.
    pub low_delay_ms: u64,
    /// Delay suggested in the medium band, milliseconds. Default: `150`.
    pub medium_delay_ms: u64,
    /// Cap on any suggested delay; also the high-band delay. Default: `500`.
    pub max_delay_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            medium_threshold: 0.85,
            high_threshold: 0.95,
            low_delay_ms: 50,
            medium_delay_ms: 150,
            max_delay_ms: 500,
        }
    }
}

impl BackpressureConfig {
    /// Defaults with `BACKPRESSURE_THRESHOLD` and `MAX_BACKPRESSURE_DELAY_MS`
    /// overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(threshold) = env_f64("BACKPRESSURE_THRESHOLD") {
            config.threshold = threshold;
        }
        if let Some(max_delay) = env_u64("MAX_BACKPRESSURE_DELAY_MS") {
            config.max_delay_ms = max_delay;
        }
        config
    }
}

/// Per-user circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker. Default: `5`.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing. Default: `30s`.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close. Default: `2`.
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_requests: 2,
        }
    }
}

/// Memory retrieval, write-path, and compression tunables.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Latest-k recent session payloads. Default: `5`.
    pub recent_k: usize,
    /// Top-k semantic hits. Default: `8`.
    pub semantic_k: usize,
    /// Top-k summaries. Default: `3`.
    pub summary_k: usize,
    /// Cosine score floor for semantic hits. Default: `0.7`.
    pub score_threshold: f64,
    /// Cap on the total returned sequence. Default: `20`.
    pub max_total: usize,
    /// MMR λ in `[0,1]`; `None` disables diversity re-ranking. λ near 1
    /// favours relevance, near 0 favours diversity.
    pub mmr_lambda: Option<f64>,
    /// Candidate pool multiplier for MMR. Default: `3`.
    pub mmr_pool_multiplier: usize,
    /// Estimated tokens per chunk on the write path. Default: `512`.
    pub chunk_tokens: usize,
    /// Token overlap between consecutive chunks. Default: `64`.
    pub chunk_overlap: usize,
    /// Redact emails and phone numbers before persisting. Default: `false`.
    pub redact_pii: bool,
    /// Model context window used by the compression gate. Default: `16_000`.
    pub model_window: usize,
    /// Fraction of the window at which compression becomes eligible.
    /// Default: `0.75`.
    pub compression_window_fraction: f64,
    /// Minimum new messages since the last compression. Default: `20`.
    pub compression_min_new_messages: usize,
    /// Minimum interval between compressions. Default: `30` minutes.
    pub compression_min_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recent_k: 5,
            semantic_k: 8,
            summary_k: 3,
            score_threshold: 0.7,
            max_total: 20,
            mmr_lambda: None,
            mmr_pool_multiplier: 3,
            chunk_tokens: 512,
            chunk_overlap: 64,
            redact_pii: false,
            model_window: 16_000,
            compression_window_fraction: 0.75,
            compression_min_new_messages: 20,
            compression_min_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// Per-activity deadlines. A deadline overrun is a retryable timeout unless
/// the caller marks the activity fatal.
#[derive(Debug, Clone)]
pub struct ActivityTimeouts {
    /// Decomposition deadline. Default: `30s`.
    pub decompose: Duration,
    /// Single agent execution / loop step deadline. Default: `60s`.
    pub agent_step: Duration,
    /// Claim verification deadline. Default: `120s`.
    pub verify: Duration,
    /// Batch verification deadline. Default: `180s`.
    pub verify_batch: Duration,
    /// Research-plan generation deadline. Default: `60s`.
    pub research_plan: Duration,
    /// Context compression deadline. Default: `60s`.
    pub compress: Duration,
}

impl Default for ActivityTimeouts {
    fn default() -> Self {
        Self {
            decompose: Duration::from_secs(30),
            agent_step: Duration::from_secs(60),
            verify: Duration::from_secs(120),
            verify_batch: Duration::from_secs(180),
            research_plan: Duration::from_secs(60),
            compress: Duration::from_secs(60),
        }
    }
}

impl ActivityTimeouts {
    /// Defaults with `DECOMPOSE_TIMEOUT_SECONDS` and
    /// `AGENT_LOOP_STEP_TIMEOUT_SECONDS` overrides applied.
    pub fn from_env() -> Self {
        let mut timeouts = Self::default();
        if let Some(secs) = env_u64("DECOMPOSE_TIMEOUT_SECONDS") {
            timeouts.decompose = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("AGENT_LOOP_STEP_TIMEOUT_SECONDS") {
            timeouts.agent_step = Duration::from_secs(secs);
        }
        timeouts
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(name: &str) -> Option<f64> {
    match env_string(name) {
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("ignoring unparsable {}={:?}", name, raw);
                None
            }
        },
        None => None,
    }
}

fn env_u64(name: &str) -> Option<u64> {
    match env_string(name) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("ignoring unparsable {}={:?}", name, raw);
                None
            }
        },
        None => None,
    }
}
