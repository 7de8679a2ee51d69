//! Chat turn assembly and execution.
//!
//! Builds the request for one turn from the session settings and the conversation, then
//! runs it against the provider under the retry policy. Every retry restarts the stream
//! from scratch: fragments are not resumable, so a fresh accumulator is used per attempt
//! and callers are told through [`TurnEvent::AttemptStarted`] to discard partial text.

use crate::config::Config;
use crate::provider::{ChatRequest, Provider, ReasoningEffort, Tool, Turn};
use crate::resilience::{Attempted, RetryError, RetryEvent, RetryPolicy};
use crate::stream::{accumulate, Progress, SealedTurn, TurnError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// User-adjustable settings that shape every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    pub model: String,
    pub system_prompt: String,
    pub prompt_mode: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Collection searched by the file-search tool, if enabled.
    pub file_search: Option<String>,
}

impl From<&Config> for ChatSettings {
    fn from(config: &Config) -> Self {
        Self {
            model: config.llm.model.clone(),
            system_prompt: config.system_prompt.clone(),
            prompt_mode: config.prompt_mode.clone(),
            reasoning_effort: config.llm.reasoning_effort,
            file_search: config.knowledge.active_collection.clone(),
        }
    }
}

impl ChatSettings {
    /// Request for the next turn. `history` must already end with the new user turn.
    pub fn build_request(&self, history: &[Turn]) -> ChatRequest {
        let tools = self
            .file_search
            .iter()
            .map(|id| Tool::FileSearch {
                collection_ids: vec![id.clone()],
            })
            .collect();

        ChatRequest::new(self.model.clone(), history.to_vec())
            .with_system_prompt(self.system_prompt.clone())
            .with_reasoning_effort(self.reasoning_effort)
            .with_tools(tools)
    }
}

/// Progress of one turn across all of its attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A new attempt is starting; anything streamed before is void.
    AttemptStarted(u32),
    Progress(Progress),
    Retrying(RetryEvent),
}

/// Runs chat turns against a provider.
#[derive(Clone)]
pub struct TurnRunner {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
}

impl TurnRunner {
    pub fn new(provider: Arc<dyn Provider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Streams one turn to completion, retrying transient failures from the start.
    pub async fn run(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
        events: &(dyn Fn(TurnEvent) + Send + Sync),
    ) -> Result<Attempted<SealedTurn>, RetryError<TurnError>> {
        info!(model = %request.model, turns = request.history.len(), "Starting chat turn");

        let provider = &*self.provider;
        let request = &request;
        let mut attempt = 0;

        let result = self
            .retry
            .run_with(
                cancel,
                TurnError::failure_class,
                |event| events(TurnEvent::Retrying(event)),
                move || {
                    attempt += 1;
                    let current = attempt;
                    async move {
                        events(TurnEvent::AttemptStarted(current));
                        let stream = provider.stream(request.clone()).await?;
                        accumulate(stream, cancel, |progress| {
                            events(TurnEvent::Progress(progress))
                        })
                        .await
                    }
                },
            )
            .await;

        match &result {
            Ok(done) => debug!(
                attempts = done.attempts,
                chars = done.value.text.len(),
                "Chat turn sealed"
            ),
            Err(err) => debug!(error = %err, "Chat turn did not complete"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, RemoteError};
    use crate::provider::{Script, ScriptStep, ScriptedProvider, StreamFragment, TokenUsage};
    use std::sync::Mutex;

    fn settings() -> ChatSettings {
        ChatSettings {
            model: "gpt-5.2".into(),
            system_prompt: "Be concise.".into(),
            prompt_mode: None,
            reasoning_effort: Some(ReasoningEffort::Low),
            file_search: None,
        }
    }

    #[test]
    fn test_request_without_file_search() {
        let request = settings().build_request(&[Turn::user("hi")]);
        assert!(request.tools.is_empty());
        assert_eq!(request.system_prompt, "Be concise.");
        assert_eq!(request.reasoning_effort, Some(ReasoningEffort::Low));
    }

    #[test]
    fn test_request_with_file_search() {
        let mut settings = settings();
        settings.file_search = Some("vs_1".into());
        let request = settings.build_request(&[Turn::user("hi")]);
        assert_eq!(
            request.tools,
            vec![Tool::FileSearch {
                collection_ids: vec!["vs_1".into()]
            }]
        );
    }

    #[tokio::test]
    async fn test_retry_restarts_stream() {
        let provider = ScriptedProvider::new([
            Script::Steps(vec![
                ScriptStep::Emit(StreamFragment::TextDelta("lost".into())),
                ScriptStep::Emit(StreamFragment::Error(RemoteError::new(
                    FailureKind::ServerBusy,
                    "overloaded",
                ))),
            ]),
            Script::reply(["kept"], TokenUsage::new(3, 1)),
        ]);
        let runner = TurnRunner::new(Arc::new(provider.clone()), RetryPolicy::immediate(3));
        let events = Mutex::new(Vec::new());
        let sink = |event: TurnEvent| events.lock().unwrap().push(event);

        let done = runner
            .run(
                settings().build_request(&[Turn::user("q")]),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(done.attempts, 2);
        assert_eq!(done.value.text, "kept");
        let events = events.lock().unwrap();
        let starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::AttemptStarted(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_fatal_open_failure() {
        let provider = ScriptedProvider::new([Script::refuse(
            FailureKind::InvalidCredentials,
            "bad key",
        )]);
        let runner = TurnRunner::new(Arc::new(provider.clone()), RetryPolicy::immediate(5));

        let err = runner
            .run(
                settings().build_request(&[Turn::user("q")]),
                &CancellationToken::new(),
                &|_: TurnEvent| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Fatal { attempts: 1, .. }));
        assert_eq!(provider.calls(), 1);
    }
}
