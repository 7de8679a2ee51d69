//! OpenAI Responses API provider.
//!
//! Opens a streamed response (`POST /responses` with `stream: true`) and turns the
//! server-sent events into [`StreamFragment`]s. Events the client does not care about
//! (reasoning summaries, tool call progress) are skipped.

use super::types::*;
use crate::config::LlmConfig;
use crate::error::{FailureKind, RemoteError};
use crate::secrets::ApiKey;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Builds an HTTP client that authenticates every request with `api_key`.
pub(crate) fn authorized_client(api_key: &ApiKey, timeout: Duration) -> Result<reqwest::Client> {
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key.expose())).map_err(|_| {
        RemoteError::new(
            FailureKind::InvalidCredentials,
            "API key contains characters that cannot be sent in a header",
        )
    })?;
    auth.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, auth);

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(RemoteError::from)
}

/// Converts a non-success response into a classified error.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status.as_u16(), &body))
}

/// OpenAI HTTP API provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    base_url: String,
    http_client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig, api_key: &ApiKey) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client: authorized_client(
                api_key,
                Duration::from_secs(config.request_timeout_secs),
            )?,
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn stream(&self, request: ChatRequest) -> Result<FragmentStream> {
        let url = format!("{}/responses", self.base_url);
        let body = ResponsesRequest::from(&request);

        debug!(
            model = %request.model,
            turns = request.history.len(),
            tools = request.tools.len(),
            "Opening response stream"
        );

        let response = self.http_client.post(&url).json(&body).send().await?;
        let response = check_status(response).await?;

        let reader = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
        let fragments = FramedRead::new(reader, LinesCodec::new()).filter_map(|line| async move {
            match line {
                Ok(line) => parse_sse_line(&line),
                Err(err) => Some(StreamFragment::Error(RemoteError::new(
                    FailureKind::ConnectionReset,
                    err.to_string(),
                ))),
            }
        });

        Ok(fragments.boxed())
    }
}

/// Parses one line of the event stream. Only `data:` lines carry payloads.
pub(crate) fn parse_sse_line(line: &str) -> Option<StreamFragment> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<ResponseEvent>(data) {
        Ok(event) => event.into_fragment(),
        Err(err) => {
            warn!(error = %err, "Skipping unreadable stream event");
            None
        }
    }
}

// Wire format

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    instructions: String,
    input: Vec<InputMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningParam>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolParam>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct InputMessage {
    role: Role,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
struct ContentPart {
    #[serde(rename = "type")]
    part_type: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct ReasoningParam {
    effort: ReasoningEffort,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolParam {
    FileSearch { vector_store_ids: Vec<String> },
}

impl From<&ChatRequest> for ResponsesRequest {
    fn from(request: &ChatRequest) -> Self {
        let input = request
            .history
            .iter()
            .map(|turn| InputMessage {
                role: turn.role,
                content: vec![ContentPart {
                    part_type: match turn.role {
                        Role::Assistant => "output_text",
                        Role::User | Role::System => "input_text",
                    },
                    text: turn.content.clone(),
                }],
            })
            .collect();

        let tools = request
            .tools
            .iter()
            .map(|tool| match tool {
                Tool::FileSearch { collection_ids } => ToolParam::FileSearch {
                    vector_store_ids: collection_ids.clone(),
                },
            })
            .collect();

        Self {
            model: request.model.clone(),
            instructions: request.system_prompt.clone(),
            input,
            reasoning: request
                .reasoning_effort
                .map(|effort| ReasoningParam { effort }),
            tools,
            stream: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseEvent {
    #[serde(rename = "response.created")]
    Created { response: ResponseObject },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.completed")]
    Completed { response: ResponseObject },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: ResponseObject },
    #[serde(rename = "response.failed")]
    Failed { response: ResponseObject },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponseObject {
    id: String,
    #[serde(default)]
    usage: Option<UsageObject>,
    #[serde(default)]
    error: Option<ErrorObject>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
}

#[derive(Debug, Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageObject {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    input_tokens_details: Option<InputTokensDetails>,
    #[serde(default)]
    output_tokens_details: Option<OutputTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct InputTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OutputTokensDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

impl From<UsageObject> for TokenUsage {
    fn from(usage: UsageObject) -> Self {
        TokenUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            reasoning_tokens: usage.output_tokens_details.and_then(|d| d.reasoning_tokens),
            cached_input_tokens: usage
                .input_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
        }
    }
}

impl ResponseEvent {
    fn into_fragment(self) -> Option<StreamFragment> {
        match self {
            ResponseEvent::Created { response } => {
                Some(StreamFragment::ResponseCreated { id: response.id })
            }
            ResponseEvent::OutputTextDelta { delta } => Some(StreamFragment::TextDelta(delta)),
            ResponseEvent::Completed { response } => Some(StreamFragment::Completed {
                usage: response.usage.map(TokenUsage::from),
            }),
            ResponseEvent::Incomplete { response } => {
                let reason = response
                    .incomplete_details
                    .and_then(|d| d.reason)
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(id = %response.id, reason = %reason, "Response ended incomplete");
                Some(StreamFragment::Incomplete {
                    usage: response.usage.map(TokenUsage::from),
                    reason,
                })
            }
            ResponseEvent::Failed { response } => {
                let (code, message) = response
                    .error
                    .map(|e| (e.code, e.message))
                    .unwrap_or((None, format!("response {} failed", response.id)));
                Some(StreamFragment::Error(RemoteError::new(
                    FailureKind::from_code(code.as_deref(), &message),
                    message,
                )))
            }
            ResponseEvent::Error { code, message } => Some(StreamFragment::Error(
                RemoteError::new(FailureKind::from_code(code.as_deref(), &message), message),
            )),
            ResponseEvent::Other => None,
        }
    }
}
