//! Failure taxonomy shared by the remote collaborators and the dispatcher.
//!
//! Remote calls fail with a [`RemoteError`] whose [`FailureKind`] decides whether the
//! resilience layer may retry it. At the dispatcher boundary every failure is resolved into
//! an [`Outcome`], so no transport error value ever reaches the UI unclassified.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Fatal,
}

/// Classified cause of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    ServerBusy,
    ConnectionReset,
    Timeout,
    InvalidCredentials,
    InvalidRequest,
    QuotaExhausted,
    UnsupportedModel,
    ContextTooLong,
    ReasoningUnsupported,
    NotFound,
    Conflict,
    Malformed,
}

impl FailureKind {
    pub fn class(self) -> FailureClass {
        match self {
            FailureKind::RateLimited
            | FailureKind::ServerBusy
            | FailureKind::ConnectionReset
            | FailureKind::Timeout => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }

    /// Maps an HTTP status plus response body onto a failure kind.
    ///
    /// The body is inspected because several distinct conditions share a status code
    /// (quota exhaustion and rate limiting are both 429, for instance).
    pub fn from_status(status: u16, body: &str) -> Self {
        if let Some(kind) = Self::from_text(body) {
            return kind;
        }

        match status {
            401 | 403 => FailureKind::InvalidCredentials,
            404 => FailureKind::NotFound,
            408 | 504 => FailureKind::Timeout,
            409 => FailureKind::Conflict,
            429 => FailureKind::RateLimited,
            500..=599 => FailureKind::ServerBusy,
            400..=499 => FailureKind::InvalidRequest,
            _ => FailureKind::Malformed,
        }
    }

    /// Maps an error code reported inside a response stream.
    pub fn from_code(code: Option<&str>, message: &str) -> Self {
        let by_code = code.and_then(|code| match code {
            "rate_limit_exceeded" => Some(FailureKind::RateLimited),
            "server_error" | "server_is_overloaded" | "internal_error" => {
                Some(FailureKind::ServerBusy)
            }
            "insufficient_quota" => Some(FailureKind::QuotaExhausted),
            "invalid_api_key" => Some(FailureKind::InvalidCredentials),
            "context_length_exceeded" => Some(FailureKind::ContextTooLong),
            "model_not_found" => Some(FailureKind::UnsupportedModel),
            "invalid_request_error" | "invalid_prompt" => Some(FailureKind::InvalidRequest),
            _ => None,
        });

        by_code
            .or_else(|| Self::from_text(message))
            .unwrap_or(FailureKind::InvalidRequest)
    }

    fn from_text(text: &str) -> Option<Self> {
        let lower = text.to_ascii_lowercase();

        if lower.contains("insufficient_quota") || lower.contains("exceeded your current quota") {
            Some(FailureKind::QuotaExhausted)
        } else if lower.contains("invalid_api_key") || lower.contains("incorrect api key") {
            Some(FailureKind::InvalidCredentials)
        } else if lower.contains("model_not_found") {
            Some(FailureKind::UnsupportedModel)
        } else if lower.contains("context_length_exceeded")
            || lower.contains("maximum context length")
        {
            Some(FailureKind::ContextTooLong)
        } else if lower.contains("reasoning.effort") || lower.contains("reasoning effort") {
            Some(FailureKind::ReasoningUnsupported)
        } else if lower.contains("overloaded") {
            Some(FailureKind::ServerBusy)
        } else {
            None
        }
    }

    /// User-facing explanation of the failure.
    pub fn describe(self) -> &'static str {
        match self {
            FailureKind::RateLimited => "The service is rate limiting requests.",
            FailureKind::ServerBusy => "The service is temporarily unavailable.",
            FailureKind::ConnectionReset => "The connection to the service was interrupted.",
            FailureKind::Timeout => "The service did not respond in time.",
            FailureKind::InvalidCredentials => {
                "Authentication failed: the API key is invalid or lacks access."
            }
            FailureKind::InvalidRequest => "The service rejected the request.",
            FailureKind::QuotaExhausted => {
                "Usage limit reached: the account quota or balance is exhausted."
            }
            FailureKind::UnsupportedModel => "The selected model is not available.",
            FailureKind::ContextTooLong => {
                "The conversation and documents exceed the model's context window. \
                 Clear the conversation or narrow the question."
            }
            FailureKind::ReasoningUnsupported => {
                "The selected model does not support this reasoning effort."
            }
            FailureKind::NotFound => "The remote resource no longer exists.",
            FailureKind::Conflict => "The remote resource changed concurrently.",
            FailureKind::Malformed => "The service returned a response that could not be read.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::RateLimited => "rate limited",
            FailureKind::ServerBusy => "server busy",
            FailureKind::ConnectionReset => "connection reset",
            FailureKind::Timeout => "timeout",
            FailureKind::InvalidCredentials => "invalid credentials",
            FailureKind::InvalidRequest => "invalid request",
            FailureKind::QuotaExhausted => "quota exhausted",
            FailureKind::UnsupportedModel => "unsupported model",
            FailureKind::ContextTooLong => "context too long",
            FailureKind::ReasoningUnsupported => "reasoning effort unsupported",
            FailureKind::NotFound => "not found",
            FailureKind::Conflict => "conflict",
            FailureKind::Malformed => "malformed response",
        };
        f.write_str(name)
    }
}

/// A failed call against the AI service or the document store.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: FailureKind,
    pub message: String,
    pub status: Option<u16>,
}

impl RemoteError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Builds an error from a non-success HTTP response.
    ///
    /// OpenAI-style bodies (`{"error": {"message": ..., "code": ...}}`) contribute their
    /// message; anything else is kept verbatim.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|value| {
                value
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.trim().to_string());

        Self {
            kind: FailureKind::from_status(status, body),
            message,
            status: Some(status),
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        self.kind.class()
    }

    pub fn is_transient(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if err.is_decode() {
            FailureKind::Malformed
        } else if let Some(status) = err.status() {
            FailureKind::from_status(status.as_u16(), "")
        } else {
            FailureKind::ConnectionReset
        };

        Self {
            kind,
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(FailureKind::Malformed, err.to_string())
    }
}

/// Why an accepted operation did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Transient failures persisted past the attempt cap.
    RetryExhausted { attempts: u32, last: FailureKind },
    /// A failure that retrying cannot fix.
    Fatal { kind: FailureKind },
    /// The remote store diverged from the local optimistic view; a refresh was forced.
    SyncConflict,
    /// The background worker stopped without reporting a result.
    Internal,
}

/// A classified, user-presentable failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

impl Failure {
    pub fn exhausted(attempts: u32, last: &RemoteError) -> Self {
        Self {
            reason: FailureReason::RetryExhausted {
                attempts,
                last: last.kind,
            },
            detail: last.message.clone(),
        }
    }

    pub fn fatal(err: &RemoteError) -> Self {
        Self {
            reason: FailureReason::Fatal { kind: err.kind },
            detail: err.message.clone(),
        }
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::SyncConflict,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::Internal,
            detail: detail.into(),
        }
    }

    /// Human-readable summary suitable for a status line or dialog.
    pub fn description(&self) -> String {
        match &self.reason {
            FailureReason::RetryExhausted { attempts, last } => format!(
                "{} Gave up after {} attempts.",
                last.describe(),
                attempts
            ),
            FailureReason::Fatal { kind } => kind.describe().to_string(),
            FailureReason::SyncConflict => format!(
                "The knowledge base changed on the server and was reloaded: {}",
                self.detail
            ),
            FailureReason::Internal => format!("The operation stopped unexpectedly: {}", self.detail),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Terminal result of one accepted dispatcher operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed(Failure),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(FailureKind::from_status(429, ""), FailureKind::RateLimited);
        assert_eq!(FailureKind::from_status(503, ""), FailureKind::ServerBusy);
        assert_eq!(FailureKind::from_status(401, ""), FailureKind::InvalidCredentials);
        assert_eq!(FailureKind::from_status(404, ""), FailureKind::NotFound);
        assert_eq!(FailureKind::from_status(400, "bad"), FailureKind::InvalidRequest);
    }

    #[test]
    fn test_quota_is_not_rate_limit() {
        let body = r#"{"error":{"message":"You exceeded your current quota","code":"insufficient_quota"}}"#;
        let err = RemoteError::from_status(429, body);
        assert_eq!(err.kind, FailureKind::QuotaExhausted);
        assert_eq!(err.message, "You exceeded your current quota");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_context_window_detected() {
        let body = r#"{"error":{"message":"This model's maximum context length is 128000 tokens"}}"#;
        assert_eq!(FailureKind::from_status(400, body), FailureKind::ContextTooLong);
    }

    #[test]
    fn test_stream_codes() {
        assert_eq!(
            FailureKind::from_code(Some("rate_limit_exceeded"), ""),
            FailureKind::RateLimited
        );
        assert_eq!(
            FailureKind::from_code(None, "The server is overloaded"),
            FailureKind::ServerBusy
        );
        assert_eq!(
            FailureKind::from_code(Some("something_new"), "no hint"),
            FailureKind::InvalidRequest
        );
    }

    #[test]
    fn test_transient_classes() {
        for kind in [
            FailureKind::RateLimited,
            FailureKind::ServerBusy,
            FailureKind::ConnectionReset,
            FailureKind::Timeout,
        ] {
            assert_eq!(kind.class(), FailureClass::Transient);
        }
        for kind in [
            FailureKind::InvalidCredentials,
            FailureKind::InvalidRequest,
            FailureKind::QuotaExhausted,
            FailureKind::UnsupportedModel,
        ] {
            assert_eq!(kind.class(), FailureClass::Fatal);
        }
    }

    #[test]
    fn test_failure_description_mentions_attempts() {
        let err = RemoteError::new(FailureKind::RateLimited, "slow down");
        let failure = Failure::exhausted(5, &err);
        assert!(failure.description().contains("5 attempts"));
    }
}
