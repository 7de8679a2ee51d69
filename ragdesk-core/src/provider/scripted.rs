//! Deterministic provider that replays prepared responses.
//!
//! Each call to [`Provider::stream`] consumes the next [`Script`]. Scripts can fail to
//! open, emit fragments, or park on a [`Notify`] so callers can observe an operation while
//! it is still running.

use super::types::*;
use crate::error::{FailureKind, RemoteError};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(StreamFragment),
    /// Wait until the notify is signalled before continuing.
    Hold(Arc<Notify>),
}

#[derive(Debug, Clone)]
pub enum Script {
    /// Opening the stream fails.
    Refuse(RemoteError),
    Steps(Vec<ScriptStep>),
}

impl Script {
    /// A successful response made of `deltas`, completed with `usage`.
    pub fn reply<I, S>(deltas: I, usage: TokenUsage) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps: Vec<ScriptStep> = deltas
            .into_iter()
            .map(|d| ScriptStep::Emit(StreamFragment::TextDelta(d.into())))
            .collect();
        steps.push(ScriptStep::Emit(StreamFragment::Completed { usage: Some(usage) }));
        Script::Steps(steps)
    }

    pub fn refuse(kind: FailureKind, message: impl Into<String>) -> Self {
        Script::Refuse(RemoteError::new(kind, message))
    }

    /// Inserts a hold point before the first step.
    pub fn held_by(self, gate: Arc<Notify>) -> Self {
        match self {
            Script::Steps(mut steps) => {
                steps.insert(0, ScriptStep::Hold(gate));
                Script::Steps(steps)
            }
            refuse => refuse,
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    scripts: VecDeque<Script>,
    requests: Vec<ChatRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    inner: Arc<Mutex<Recorded>>,
}

impl ScriptedProvider {
    pub fn new<I: IntoIterator<Item = Script>>(scripts: I) -> Self {
        let provider = Self::default();
        for script in scripts {
            provider.push(script);
        }
        provider
    }

    pub fn push(&self, script: Script) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.scripts.push_back(script);
        }
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.inner
            .lock()
            .map(|inner| inner.requests.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.inner.lock().map(|inner| inner.requests.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn stream(&self, request: ChatRequest) -> Result<FragmentStream> {
        let script = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| RemoteError::new(FailureKind::Malformed, "script state poisoned"))?;
            inner.requests.push(request);
            inner.scripts.pop_front()
        };

        let steps = match script {
            Some(Script::Steps(steps)) => steps,
            Some(Script::Refuse(err)) => return Err(err),
            None => {
                return Err(RemoteError::new(
                    FailureKind::InvalidRequest,
                    "no scripted response left",
                ))
            }
        };

        let fragments = futures::stream::unfold(VecDeque::from(steps), |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    ScriptStep::Emit(fragment) => return Some((fragment, steps)),
                    ScriptStep::Hold(gate) => gate.notified().await,
                }
            }
        });

        Ok(fragments.boxed())
    }
}
