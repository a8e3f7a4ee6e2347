// src/lib.rs

// Import the top-level `taskweave` module.
pub mod taskweave;

// Re-exporting key items for easier external access.
pub use taskweave::activities::{ActivityContext, ActivityRegistry, EventSink, RetryPolicy};
pub use taskweave::budget::{BudgetCheckRequest, BudgetManager, BudgetPressure};
pub use taskweave::circuit_breaker::CircuitBreaker;
pub use taskweave::config::TaskweaveConfig;
pub use taskweave::error::{Error, Result};
pub use taskweave::event_bus::{EventBus, EventType, WorkflowEvent};
pub use taskweave::memory::MemoryService;
pub use taskweave::persistence::PersistenceQueue;
pub use taskweave::types::WorkflowIdentity;
pub use taskweave::workflows::{
    ApprovalPolicy, ReviewWorkflow, TaskInput, TaskOrchestrator, TaskOutcome, WorkflowCtx,
};

// Module path shortcuts used throughout the crate's documentation examples.
pub use taskweave::activities;
pub use taskweave::budget;
pub use taskweave::circuit_breaker;
pub use taskweave::config;
pub use taskweave::context;
pub use taskweave::error;
pub use taskweave::event_bus;
pub use taskweave::memory;
pub use taskweave::persistence;
pub use taskweave::stores;
pub use taskweave::types;
pub use taskweave::workflows;
