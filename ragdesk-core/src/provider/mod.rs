//! Remote AI service abstraction.
//!
//! This module defines the streaming interface the dispatcher talks to, the OpenAI
//! Responses API implementation, and a scripted implementation for offline use.

mod types;
pub mod openai;
pub mod scripted;

pub use types::{
    ChatRequest, FragmentStream, Provider, ReasoningEffort, Result, Role, StreamFragment,
    TokenUsage, Tool, Turn,
};

pub use openai::OpenAiProvider;
pub use scripted::{Script, ScriptStep, ScriptedProvider};
