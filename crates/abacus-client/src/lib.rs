use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use abacus_types::AiChatConfig;

/// Output-token cap sent with every completion request.
pub const MAX_COMPLETION_TOKENS: u32 = 4096;

pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_CAP_MS: u64 = 30_000;

pub const NOT_FOUND_HINT: &str = "endpoint path not found; check that the configured base URL \
     includes the provider's API version segment (for example `/v1`)";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub max_completion_tokens: u32,
    pub messages: &'a [ChatMessage],
    /// Omitted entirely when unset so the provider default applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl CompletionResponse {
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }

    /// True when the provider cut the completion at the output-token cap.
    pub fn is_truncated(&self) -> bool {
        self.finish_reason() == Some("length")
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("chat request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat endpoint returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("chat endpoint returned a malformed completion body: {detail}")]
    MalformedResponse { detail: String },
    #[error("chat request gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<ClientError>,
    },
    #[error("chat request cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Fail,
}

/// Retry only statuses that signal a transient provider condition.
pub fn disposition_for_status(status: u16) -> Disposition {
    match status {
        429 | 500 | 502 | 503 | 504 => Disposition::Retry,
        _ => Disposition::Fail,
    }
}

/// Exponential delay before retry `attempt` (0-based), capped at 30s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// Numeric `Retry-After` seconds, when the header carries one.
pub fn retry_after_delay(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?;
    let seconds = value.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

enum AttemptError {
    Fatal(ClientError),
    Transient {
        err: ClientError,
        retry_after: Option<Duration>,
    },
}

pub struct ChatClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl ChatClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        }
    }

    pub fn from_config(config: &AiChatConfig) -> Self {
        Self::new(
            config.endpoint.clone(),
            config.api_key.clone(),
            config.model.clone(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One logical completion call: up to `max_retries` re-sends on
    /// transient failures, with the delay overridable by a 429 Retry-After.
    /// The token aborts the HTTP wait and any backoff sleep immediately.
    pub async fn fetch_completion(
        &self,
        messages: &[ChatMessage],
        max_retries: u32,
        cancel: &CancellationToken,
        temperature: Option<f32>,
    ) -> Result<CompletionResponse, ClientError> {
        let url = format!(
            "{}/chat/completions",
            self.endpoint.trim_end_matches('/')
        );
        let body = CompletionRequest {
            model: &self.model,
            max_completion_tokens: MAX_COMPLETION_TOKENS,
            messages,
            temperature,
        };

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            tracing::debug!(model = %self.model, attempt, "dispatching chat completion");
            match self.attempt_once(&url, &body, cancel).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient { err, retry_after }) => {
                    if attempt >= max_retries {
                        return Err(ClientError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: Box::new(err),
                        });
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient chat failure, will retry"
                    );
                    sleep_cancellable(delay, cancel).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        url: &str,
        body: &CompletionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, AttemptError> {
        let mut req = self.http.post(url).json(body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let sent = tokio::select! {
            res = req.send() => res,
            _ = cancel.cancelled() => return Err(AttemptError::Fatal(ClientError::Cancelled)),
        };

        let response = match sent {
            Ok(response) => response,
            Err(err) => return Err(network_error(err)),
        };

        let status = response.status();
        if status.is_success() {
            // a connection dropped mid-body is as transient as one
            // refused at send time
            let text = response.text().await.map_err(network_error)?;
            return parse_completion(&text).map_err(AttemptError::Fatal);
        }

        let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
            retry_after_delay(response.headers())
        } else {
            None
        };
        let body_text = response.text().await.unwrap_or_default();
        let err = status_error(status.as_u16(), body_text);
        match disposition_for_status(status.as_u16()) {
            Disposition::Retry => Err(AttemptError::Transient { err, retry_after }),
            Disposition::Fail => Err(AttemptError::Fatal(err)),
        }
    }
}

/// Sleep that rejects with `Cancelled` the moment the token fires.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
    }
}

fn network_error(err: reqwest::Error) -> AttemptError {
    AttemptError::Transient {
        err: ClientError::Http(err),
        retry_after: None,
    }
}

fn parse_completion(text: &str) -> Result<CompletionResponse, ClientError> {
    let response: CompletionResponse =
        serde_json::from_str(text).map_err(|err| ClientError::MalformedResponse {
            detail: err.to_string(),
        })?;
    if response.choices.is_empty() {
        return Err(ClientError::MalformedResponse {
            detail: "response contained no choices".to_string(),
        });
    }
    Ok(response)
}

fn status_error(status: u16, body: String) -> ClientError {
    let mut detail = truncate_for_error(&body, 500);
    if detail.is_empty() {
        detail = "no response body".to_string();
    }
    if status == 404 {
        detail = format!("{detail}; {NOT_FOUND_HINT}");
    }
    ClientError::Status { status, detail }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.trim().to_string();
    }
    let mut cut = max_len;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &input[..cut])
}
