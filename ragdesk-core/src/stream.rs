//! Folding a streamed response into a sealed turn.
//!
//! The accumulator owns the partial text and the latest usage snapshot of exactly one
//! response. Text deltas are appended in transport order and each produces at most one
//! [`Progress::PartialText`] notification. A completion marker seals the turn; an error
//! marker, a premature end of stream, or cancellation discard everything.

use crate::error::{FailureClass, FailureKind, RemoteError};
use crate::provider::{StreamFragment, TokenUsage};
use futures::{Stream, StreamExt};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Incremental notification emitted while a response streams in.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    ResponseCreated(String),
    PartialText(String),
    Usage(TokenUsage),
}

/// A completed assistant response.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedTurn {
    pub text: String,
    pub usage: TokenUsage,
    pub response_id: Option<String>,
    /// Set when the service stopped the response early.
    pub incomplete: Option<String>,
}

/// What to do after feeding one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue(Option<Progress>),
    Sealed(SealedTurn),
    Failed(RemoteError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnError {
    Remote(RemoteError),
    Cancelled,
}

impl TurnError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            TurnError::Remote(err) => err.failure_class(),
            TurnError::Cancelled => FailureClass::Fatal,
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::Remote(err) => err.fmt(f),
            TurnError::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl From<RemoteError> for TurnError {
    fn from(err: RemoteError) -> Self {
        TurnError::Remote(err)
    }
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    usage: TokenUsage,
    response_id: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn push(&mut self, fragment: StreamFragment) -> Step {
        match fragment {
            StreamFragment::ResponseCreated { id } => {
                self.response_id = Some(id.clone());
                Step::Continue(Some(Progress::ResponseCreated(id)))
            }
            StreamFragment::TextDelta(delta) => {
                if delta.is_empty() {
                    return Step::Continue(None);
                }
                self.text.push_str(&delta);
                Step::Continue(Some(Progress::PartialText(delta)))
            }
            StreamFragment::Usage(usage) => {
                self.usage = usage;
                Step::Continue(Some(Progress::Usage(usage)))
            }
            StreamFragment::Completed { usage } => Step::Sealed(self.seal(usage, None)),
            StreamFragment::Incomplete { usage, reason } => {
                debug!(reason = %reason, "Sealing incomplete response");
                Step::Sealed(self.seal(usage, Some(reason)))
            }
            StreamFragment::Error(err) => {
                self.text.clear();
                Step::Failed(err)
            }
        }
    }

    fn seal(&mut self, usage: Option<TokenUsage>, incomplete: Option<String>) -> SealedTurn {
        if let Some(usage) = usage {
            self.usage = usage;
        }
        SealedTurn {
            text: std::mem::take(&mut self.text),
            usage: self.usage,
            response_id: self.response_id.take(),
            incomplete,
        }
    }
}

/// Drains `stream` into a sealed turn, reporting progress along the way.
///
/// Cancellation is observed at every fragment boundary, including while waiting for the
/// next fragment to arrive.
pub async fn accumulate<S, P>(
    mut stream: S,
    cancel: &CancellationToken,
    mut on_progress: P,
) -> Result<SealedTurn, TurnError>
where
    S: Stream<Item = StreamFragment> + Unpin,
    P: FnMut(Progress),
{
    let mut acc = StreamAccumulator::new();

    loop {
        let fragment = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(buffered = acc.text().len(), "Stream cancelled");
                return Err(TurnError::Cancelled);
            }
            next = stream.next() => next,
        };

        let Some(fragment) = fragment else {
            return Err(TurnError::Remote(RemoteError::new(
                FailureKind::ConnectionReset,
                "stream ended before the response completed",
            )));
        };

        match acc.push(fragment) {
            Step::Continue(Some(progress)) => on_progress(progress),
            Step::Continue(None) => {}
            Step::Sealed(turn) => return Ok(turn),
            Step::Failed(err) => return Err(TurnError::Remote(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use proptest::prelude::*;

    fn run(fragments: Vec<StreamFragment>) -> (Result<SealedTurn, TurnError>, Vec<Progress>) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let result = runtime.block_on(accumulate(
            stream::iter(fragments),
            &cancel,
            |p| seen.push(p),
        ));
        (result, seen)
    }

    #[test]
    fn test_seals_on_completion() {
        let (result, progress) = run(vec![
            StreamFragment::ResponseCreated { id: "resp_1".into() },
            StreamFragment::TextDelta("Hel".into()),
            StreamFragment::TextDelta("lo".into()),
            StreamFragment::Usage(TokenUsage::new(10, 1)),
            StreamFragment::Completed {
                usage: Some(TokenUsage::new(10, 2)),
            },
        ]);

        let turn = result.unwrap();
        assert_eq!(turn.text, "Hello");
        assert_eq!(turn.usage, TokenUsage::new(10, 2));
        assert_eq!(turn.response_id.as_deref(), Some("resp_1"));
        assert_eq!(progress.len(), 4);
    }

    #[test]
    fn test_completion_without_usage_keeps_last_snapshot() {
        let (result, _) = run(vec![
            StreamFragment::TextDelta("x".into()),
            StreamFragment::Usage(TokenUsage::new(7, 3)),
            StreamFragment::Completed { usage: None },
        ]);
        assert_eq!(result.unwrap().usage, TokenUsage::new(7, 3));
    }

    #[test]
    fn test_incomplete_response_keeps_text_and_reason() {
        let (result, _) = run(vec![
            StreamFragment::TextDelta("half an ans".into()),
            StreamFragment::Incomplete {
                usage: Some(TokenUsage::new(5, 64)),
                reason: "max_output_tokens".into(),
            },
        ]);
        let turn = result.unwrap();
        assert_eq!(turn.text, "half an ans");
        assert_eq!(turn.usage, TokenUsage::new(5, 64));
        assert_eq!(turn.incomplete.as_deref(), Some("max_output_tokens"));
    }

    #[test]
    fn test_completed_response_is_not_incomplete() {
        let (result, _) = run(vec![StreamFragment::Completed { usage: None }]);
        assert_eq!(result.unwrap().incomplete, None);
    }

    #[test]
    fn test_error_marker_yields_no_turn() {
        let err = RemoteError::new(FailureKind::ServerBusy, "overloaded");
        let (result, _) = run(vec![
            StreamFragment::TextDelta("partial".into()),
            StreamFragment::Error(err.clone()),
            StreamFragment::Completed { usage: None },
        ]);
        assert_eq!(result, Err(TurnError::Remote(err)));
    }

    #[test]
    fn test_truncated_stream_is_transient() {
        let (result, _) = run(vec![StreamFragment::TextDelta("cut".into())]);
        match result {
            Err(TurnError::Remote(err)) => assert!(err.is_transient()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_empty_delta_is_silent() {
        let (_, progress) = run(vec![
            StreamFragment::TextDelta(String::new()),
            StreamFragment::Completed { usage: None },
        ]);
        assert!(progress.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = accumulate(stream::pending(), &cancel, |_| {}).await;
        assert_eq!(result, Err(TurnError::Cancelled));
    }

    proptest! {
        #[test]
        fn prop_sealed_text_is_concatenation(
            deltas in prop::collection::vec(".{0,12}", 0..20),
            snapshots in prop::collection::vec((0u64..10_000, 0u64..10_000), 1..5),
        ) {
            let mut fragments: Vec<StreamFragment> =
                deltas.iter().cloned().map(StreamFragment::TextDelta).collect();
            for (input, output) in &snapshots {
                fragments.push(StreamFragment::Usage(TokenUsage::new(*input, *output)));
            }
            fragments.push(StreamFragment::Completed { usage: None });

            let (result, progress) = run(fragments);
            let turn = result.unwrap();
            let (input, output) = *snapshots.last().unwrap();

            prop_assert_eq!(turn.text, deltas.concat());
            prop_assert_eq!(turn.usage, TokenUsage::new(input, output));
            let partials = progress.iter().filter(|p| matches!(p, Progress::PartialText(_))).count();
            prop_assert_eq!(partials, deltas.iter().filter(|d| !d.is_empty()).count());
        }
    }
}
