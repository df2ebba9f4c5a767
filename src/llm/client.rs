//! HTTP client for OpenAI-compatible completion endpoints.
//!
//! [`ApiClient`] owns the request/response cycle for one endpoint: it builds
//! the payload, sends it with the active API key, classifies the reply and
//! applies the [`RetryPolicy`]. A single client is shared by every worker.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::keys::{masked, ApiKeyCursor, Rotation};
use super::policy::{classify_reply, ErrorKind, RetryDecision, RetryPolicy};
use super::types::{
    build_payload, ChatPrompt, CompletionMode, GenerationOptions, DEFAULT_SYSTEM_PROMPT,
};
use crate::error::LlmError;
use crate::metrics::MetricsCollector;

/// Default OpenAI-compatible API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Final answer of the client for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatResponse {
    /// The endpoint answered; choice texts are joined.
    Completed { text: String },
    /// The endpoint refused the prompt for good.
    Rejected { kind: ErrorKind },
}

/// Trait for anything that can answer a prompt.
///
/// Errors returned here are either item-scoped (the caller may requeue the
/// item) or run-scoped, see [`LlmError::scope`].
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, prompt: &ChatPrompt) -> Result<ChatResponse, LlmError>;
}

/// Raw HTTP reply, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Sends one JSON POST; no retry logic.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<HttpReply, ErrorKind>;
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::ClientBuild(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<HttpReply, ErrorKind> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;

        Ok(HttpReply { status, body })
    }
}

fn transport_error(err: reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Transport(err.to_string())
    }
}

/// Settings for one endpoint.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Model identifier sent in every request.
    pub model: String,
    /// Name used to pick the key set and in logs (e.g. "openai").
    pub endpoint_name: String,
    /// Base URL without the trailing path.
    pub base_url: String,
    /// Ordered API keys; rotation only moves forward.
    pub api_keys: Vec<String>,
    /// Retryable failures tolerated per prompt.
    pub max_retries: u32,
    /// HTTP timeout per attempt.
    pub request_timeout: Duration,
    /// Sleep after a retryable failure.
    pub retry_backoff: Duration,
    /// Sleep after each successful request.
    pub request_interval: Duration,
    /// System prompt for chat requests; empty to omit.
    pub system_prompt: String,
    /// Forces an endpoint flavor; derived from the model name when unset.
    pub completion_mode: Option<CompletionMode>,
    /// Generation parameters.
    pub generation: GenerationOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            endpoint_name: "openai".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_keys: Vec::new(),
            max_retries: 10,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            retry_backoff: Duration::from_secs(5),
            request_interval: Duration::from_millis(200),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            completion_mode: None,
            generation: GenerationOptions::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.endpoint_name = name.into();
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_keys(mut self, keys: Vec<String>) -> Self {
        self.api_keys = keys;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.request_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        self.completion_mode = Some(mode);
        self
    }

    pub fn with_generation(mut self, generation: GenerationOptions) -> Self {
        self.generation = generation;
        self
    }

    /// Endpoint flavor in effect.
    pub fn mode(&self) -> CompletionMode {
        self.completion_mode
            .unwrap_or_else(|| CompletionMode::for_model(&self.model))
    }

    /// Full request URL.
    pub fn url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.mode().path())
    }
}

/// Shared client with retry, backoff, key rotation and rate limiting.
pub struct ApiClient<T = ReqwestTransport> {
    transport: T,
    config: ClientConfig,
    url: String,
    keys: ApiKeyCursor,
    policy: RetryPolicy,
    metrics: MetricsCollector,
}

impl ApiClient<ReqwestTransport> {
    /// Creates a client that talks HTTP through `reqwest`.
    pub fn new(config: ClientConfig) -> Result<Self, LlmError> {
        let transport = ReqwestTransport::new(config.request_timeout)?;
        Self::with_transport(config, transport)
    }
}

impl<T: HttpTransport> ApiClient<T> {
    /// Creates a client over a custom transport.
    ///
    /// Fails when no API key is configured.
    pub fn with_transport(config: ClientConfig, transport: T) -> Result<Self, LlmError> {
        if config.api_keys.is_empty() {
            return Err(LlmError::MissingApiKey(config.endpoint_name.clone()));
        }

        let policy = RetryPolicy::new(config.max_retries, config.retry_backoff);
        let keys = ApiKeyCursor::new(config.api_keys.clone());
        let url = config.url();

        Ok(Self {
            transport,
            config,
            url,
            keys,
            policy,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn keys(&self) -> &ApiKeyCursor {
        &self.keys
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn keys_exhausted(&self) -> LlmError {
        LlmError::KeysExhausted {
            endpoint: self.config.endpoint_name.clone(),
            keys: self.keys.len(),
        }
    }

    /// Runs one attempt and classifies its outcome.
    async fn attempt(&self, api_key: &str, body: &Value) -> Result<String, ErrorKind> {
        let started = Instant::now();
        let outcome = match self.transport.post_json(&self.url, api_key, body).await {
            Ok(reply) => classify_reply(reply.status, &reply.body),
            Err(kind) => Err(kind),
        };

        let status = match &outcome {
            Ok(_) => "success",
            Err(kind) => kind.label(),
        };
        self.metrics
            .record_llm_request(&self.config.model, status, started.elapsed().as_secs_f64());

        outcome
    }
}

#[async_trait]
impl<T: HttpTransport> LlmProvider for ApiClient<T> {
    async fn chat(&self, prompt: &ChatPrompt) -> Result<ChatResponse, LlmError> {
        let body = build_payload(
            &self.config.model,
            self.config.mode(),
            &self.config.system_prompt,
            prompt,
            &self.config.generation,
        )
        .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let mut failures = 0u32;

        loop {
            let Some((key_index, api_key)) = self.keys.current() else {
                return Err(self.keys_exhausted());
            };

            let kind = match self.attempt(api_key, &body).await {
                Ok(text) => {
                    if !self.config.request_interval.is_zero() {
                        tokio::time::sleep(self.config.request_interval).await;
                    }
                    return Ok(ChatResponse::Completed { text });
                }
                Err(kind) => kind,
            };

            match self.policy.decide(&kind, failures) {
                RetryDecision::Skip => {
                    tracing::debug!(error = %kind, "Prompt rejected by endpoint");
                    return Ok(ChatResponse::Rejected { kind });
                }
                RetryDecision::RotateKey => match self.keys.rotate_from(key_index) {
                    Rotation::Advanced(next) => {
                        tracing::warn!(
                            endpoint = %self.config.endpoint_name,
                            exhausted_key = %masked(api_key),
                            key_index = next,
                            "API key quota exceeded, rotating to next key"
                        );
                        self.metrics.record_key_rotation(&self.config.endpoint_name);
                    }
                    Rotation::AlreadyMoved(_) => {}
                    Rotation::Exhausted => {
                        tracing::error!(
                            endpoint = %self.config.endpoint_name,
                            keys = self.keys.len(),
                            "All API keys exceeded their quota"
                        );
                        return Err(self.keys_exhausted());
                    }
                },
                RetryDecision::Backoff(delay) => {
                    failures += 1;
                    tracing::warn!(
                        attempt = failures,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %kind,
                        "Request failed, will retry"
                    );
                    self.metrics.record_retry(&self.config.model, kind.label());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                RetryDecision::GiveUp => {
                    return Err(LlmError::RetriesExhausted {
                        max_retries: self.policy.max_retries,
                        last_error: kind.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies and records which key each call used.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<HttpReply, ErrorKind>>>,
        keys_used: Mutex<Vec<String>>,
        bodies: Mutex<Vec<Value>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<HttpReply, ErrorKind>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                keys_used: Mutex::new(Vec::new()),
                bodies: Mutex::new(Vec::new()),
            }
        }

        fn keys_used(&self) -> Vec<String> {
            self.keys_used.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn post_json(
            &self,
            _url: &str,
            api_key: &str,
            body: &Value,
        ) -> Result<HttpReply, ErrorKind> {
            self.keys_used.lock().unwrap().push(api_key.to_string());
            self.bodies.lock().unwrap().push(body.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ErrorKind::Transport("script exhausted".to_string())))
        }
    }

    fn ok(text: &str) -> Result<HttpReply, ErrorKind> {
        Ok(HttpReply {
            status: 200,
            body: serde_json::json!({"choices": [{"message": {"content": text}}]}).to_string(),
        })
    }

    fn api_error(status: u16, code: &str) -> Result<HttpReply, ErrorKind> {
        Ok(HttpReply {
            status,
            body: serde_json::json!({"error": {"code": code, "message": code}}).to_string(),
        })
    }

    fn config(keys: &[&str]) -> ClientConfig {
        ClientConfig::default()
            .with_api_keys(keys.iter().map(|k| k.to_string()).collect())
            .with_max_retries(2)
            .with_retry_backoff(Duration::ZERO)
            .with_request_interval(Duration::ZERO)
    }

    #[test]
    fn test_config_url_and_mode() {
        let cfg = ClientConfig::default().with_endpoint("local", "http://localhost:4000/v1/");
        assert_eq!(cfg.url(), "http://localhost:4000/v1/chat/completions");

        let cfg = cfg.with_model("gpt-3.5-turbo-instruct");
        assert_eq!(cfg.mode(), CompletionMode::Legacy);
        assert_eq!(cfg.url(), "http://localhost:4000/v1/completions");
    }

    #[test]
    fn test_missing_api_key() {
        let result = ApiClient::with_transport(config(&[]), ScriptedTransport::new(vec![]));
        assert!(matches!(result, Err(LlmError::MissingApiKey(ref name)) if name == "openai"));
    }

    #[tokio::test]
    async fn test_chat_success() {
        let client =
            ApiClient::with_transport(config(&["key-a"]), ScriptedTransport::new(vec![ok("hello")]))
                .unwrap();

        let response = client.chat(&ChatPrompt::text("hi")).await.unwrap();
        assert_eq!(
            response,
            ChatResponse::Completed {
                text: "hello".to_string()
            }
        );

        let bodies = client.transport.bodies.lock().unwrap();
        assert_eq!(bodies[0]["messages"][1]["content"], "hi");
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let transport = ScriptedTransport::new(vec![
            Err(ErrorKind::Timeout),
            api_error(500, "server_error"),
            ok("done"),
        ]);
        let client = ApiClient::with_transport(config(&["key-a"]), transport).unwrap();

        let response = client.chat(&ChatPrompt::text("hi")).await.unwrap();
        assert!(matches!(response, ChatResponse::Completed { ref text } if text == "done"));
        assert_eq!(client.transport.keys_used().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let transport = ScriptedTransport::new(vec![
            Err(ErrorKind::Timeout),
            Err(ErrorKind::Timeout),
            Err(ErrorKind::Timeout),
            ok("too late"),
        ]);
        let client = ApiClient::with_transport(config(&["key-a"]), transport).unwrap();

        let err = client.chat(&ChatPrompt::text("hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::RetriesExhausted { max_retries: 2, .. }));
        assert!(!err.is_run_fatal());
        // max_retries failures are retried, the next one gives up.
        assert_eq!(client.transport.keys_used().len(), 3);
    }

    #[tokio::test]
    async fn test_quota_rotates_key_without_using_retry_budget() {
        let transport = ScriptedTransport::new(vec![
            Err(ErrorKind::Timeout),
            Err(ErrorKind::Timeout),
            api_error(429, "insufficient_quota"),
            ok("from b"),
        ]);
        let client = ApiClient::with_transport(config(&["key-a", "key-b"]), transport).unwrap();

        let response = client.chat(&ChatPrompt::text("hi")).await.unwrap();
        assert!(matches!(response, ChatResponse::Completed { ref text } if text == "from b"));
        assert_eq!(
            client.transport.keys_used(),
            vec!["key-a", "key-a", "key-a", "key-b"]
        );
        assert_eq!(client.keys().position(), 1);
    }

    #[tokio::test]
    async fn test_all_keys_exhausted_is_run_fatal() {
        let transport = ScriptedTransport::new(vec![
            api_error(429, "insufficient_quota"),
            api_error(429, "insufficient_quota"),
        ]);
        let client = ApiClient::with_transport(config(&["key-a", "key-b"]), transport).unwrap();

        let err = client.chat(&ChatPrompt::text("hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::KeysExhausted { keys: 2, .. }));
        assert!(err.is_run_fatal());
        assert!(client.keys().exhausted());

        // Later calls fail fast without touching the network.
        let err = client.chat(&ChatPrompt::text("again")).await.unwrap_err();
        assert!(err.is_run_fatal());
        assert_eq!(client.transport.keys_used().len(), 2);
    }

    #[tokio::test]
    async fn test_content_policy_is_rejected_not_retried() {
        let transport = ScriptedTransport::new(vec![
            api_error(400, "content_policy_violation"),
            ok("unused"),
        ]);
        let client = ApiClient::with_transport(config(&["key-a"]), transport).unwrap();

        let response = client.chat(&ChatPrompt::text("bad")).await.unwrap();
        assert!(matches!(
            response,
            ChatResponse::Rejected {
                kind: ErrorKind::ContentPolicy(_)
            }
        ));
        assert_eq!(client.transport.keys_used().len(), 1);
    }

    #[tokio::test]
    async fn test_reqwest_transport_connection_error() {
        // Nothing listens on port 1, so the connection is refused at once.
        let cfg = config(&["key-a"])
            .with_endpoint("local", "http://127.0.0.1:1/v1")
            .with_max_retries(0)
            .with_request_timeout(Duration::from_secs(5));
        let client = ApiClient::new(cfg).unwrap();

        let err = client.chat(&ChatPrompt::text("hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::RetriesExhausted { max_retries: 0, .. }));
    }
}
