//! Response classification and the retry policy consulted by the client.
//!
//! Every attempt ends in either extracted text or an [`ErrorKind`]. The
//! [`RetryPolicy`] maps an error kind and the number of failures so far to a
//! [`RetryDecision`].

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use super::types::CompletionBody;

/// Error code the endpoint returns when a prompt is refused.
pub const CONTENT_POLICY_CODE: &str = "content_policy_violation";

/// Error code the endpoint returns when a key ran out of quota.
pub const QUOTA_EXCEEDED_CODE: &str = "insufficient_quota";

/// Classified failure of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Connection, TLS, DNS or similar failure before a response arrived.
    Transport(String),
    /// The request hit the client timeout.
    Timeout,
    /// The response body could not be understood.
    MalformedBody(String),
    /// The endpoint reported an error we do not treat specially.
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// The current key has no quota left.
    QuotaExceeded(String),
    /// The prompt was refused on content-policy grounds.
    ContentPolicy(String),
}

/// Policy class of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff.
    Retryable,
    /// Retry immediately with the next key.
    Quota,
    /// Never retried.
    Terminal,
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Transport(_)
            | ErrorKind::Timeout
            | ErrorKind::MalformedBody(_)
            | ErrorKind::Api { .. } => ErrorClass::Retryable,
            ErrorKind::QuotaExceeded(_) => ErrorClass::Quota,
            ErrorKind::ContentPolicy(_) => ErrorClass::Terminal,
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Transport(_) => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MalformedBody(_) => "malformed_body",
            ErrorKind::Api { .. } => "api_error",
            ErrorKind::QuotaExceeded(_) => "quota_exceeded",
            ErrorKind::ContentPolicy(_) => "content_policy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport(msg) => write!(f, "transport error: {}", msg),
            ErrorKind::Timeout => write!(f, "request timed out"),
            ErrorKind::MalformedBody(msg) => write!(f, "malformed response body: {}", msg),
            ErrorKind::Api {
                status,
                code,
                message,
            } => match code {
                Some(code) => write!(f, "API error ({}, {}): {}", status, code, message),
                None => write!(f, "API error ({}): {}", status, message),
            },
            ErrorKind::QuotaExceeded(msg) => write!(f, "quota exceeded: {}", msg),
            ErrorKind::ContentPolicy(msg) => write!(f, "content policy violation: {}", msg),
        }
    }
}

/// Turns a raw HTTP reply into the joined choice text or a classified error.
///
/// Error bodies are recognized both as `{"error": {"code": ..., "message": ...}}`
/// and as a bare top-level `{"code": ..., "message": ...}`, which some
/// OpenAI-compatible proxies return under load.
pub fn classify_reply(status: u16, body: &str) -> Result<String, ErrorKind> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            if (200..300).contains(&status) {
                return Err(ErrorKind::MalformedBody(e.to_string()));
            }
            return Err(ErrorKind::Api {
                status,
                code: None,
                message: truncate(body, 500),
            });
        }
    };

    if let Some(kind) = error_from_body(status, &value) {
        return Err(kind);
    }

    if !(200..300).contains(&status) {
        return Err(ErrorKind::Api {
            status,
            code: None,
            message: truncate(body, 500),
        });
    }

    let parsed: CompletionBody = serde_json::from_value(value)
        .map_err(|e| ErrorKind::MalformedBody(format!("Failed to parse API response: {}", e)))?;

    parsed
        .joined_text()
        .ok_or_else(|| ErrorKind::MalformedBody("response has no choice text".to_string()))
}

fn error_from_body(status: u16, value: &Value) -> Option<ErrorKind> {
    let error = match value.get("error") {
        Some(error) if !error.is_null() => error,
        _ if value.get("code").is_some() && value.get("choices").is_none() => value,
        _ => return None,
    };

    let code = error.get("code").and_then(code_as_string);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());

    Some(match code.as_deref() {
        Some(CONTENT_POLICY_CODE) => ErrorKind::ContentPolicy(message),
        Some(QUOTA_EXCEEDED_CODE) => ErrorKind::QuotaExceeded(message),
        _ => ErrorKind::Api {
            status,
            code,
            message,
        },
    })
}

fn code_as_string(code: &Value) -> Option<String> {
    match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// What the client does after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then retry with the same key.
    Backoff(Duration),
    /// Switch to the next key and retry at once.
    RotateKey,
    /// Stop; the item is permanently skipped.
    Skip,
    /// Stop; the retry budget is spent.
    GiveUp,
}

/// Fixed-backoff retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures tolerated before giving up; quota rotations do not count.
    pub max_retries: u32,
    /// Sleep between retryable failures.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Decides what follows a failure, given the retryable failures seen
    /// before this one.
    pub fn decide(&self, kind: &ErrorKind, failures_so_far: u32) -> RetryDecision {
        match kind.class() {
            ErrorClass::Terminal => RetryDecision::Skip,
            ErrorClass::Quota => RetryDecision::RotateKey,
            ErrorClass::Retryable if failures_so_far >= self.max_retries => RetryDecision::GiveUp,
            ErrorClass::Retryable => RetryDecision::Backoff(self.backoff),
        }
    }
}
