//! ragdesk-core - orchestration layer for a RAG chat client
//!
//! Sits between a single-threaded UI and a hosted, rate-limited AI service:
//! - Streaming chat turns with retry, cancellation and incremental cost accounting
//! - Document collections for file search, kept in sync with the remote store
//! - Configuration and credentials
//!
//! ## Primary API
//!
//! Build a [`Dispatcher`], call intents on it from the UI thread, and apply the
//! [`StateUpdate`]s that arrive on its [`StateObserver`].

pub mod chat;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod knowledge;
pub mod pricing;
pub mod prompts;
pub mod provider;
pub mod resilience;
pub mod secrets;
pub mod stream;
pub mod transcript;

pub use chat::{ChatSettings, TurnRunner};
pub use config::{Config, ConfigError};
pub use dispatcher::{
    AppState, Channel, DispatchError, Dispatcher, OperationId, StateObserver, StateUpdate,
};
pub use error::{Failure, FailureClass, FailureKind, FailureReason, Outcome, RemoteError};
pub use knowledge::{
    DocumentStore, FileBlob, KnowledgeView, MemoryStore, OpenAiDocumentStore, Synchronizer,
};
pub use pricing::{Cost, CostLedger, PriceTable, PricingUnavailable, TurnCost};
pub use resilience::{RetryEvent, RetryPolicy};
pub use secrets::{ApiKey, CredentialSource, EnvCredentials, StaticCredentials};

// Provider exports
pub use provider::{
    ChatRequest, OpenAiProvider, Provider, ReasoningEffort, Role, StreamFragment, TokenUsage,
    Tool, Turn,
};
