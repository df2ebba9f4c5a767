//! LLM endpoint access.
//!
//! The client issues requests to one OpenAI-compatible endpoint and hides
//! transient failures from its callers:
//!
//! - retryable failures (transport, timeout, malformed body, other API
//!   errors) are retried after a fixed backoff, up to a bound
//! - quota errors rotate to the next API key without using the retry budget
//! - content-policy refusals come back as [`ChatResponse::Rejected`]
//!
//! ```ignore
//! use llm_runner::llm::{ApiClient, ChatPrompt, ClientConfig, LlmProvider};
//!
//! let config = ClientConfig::default()
//!     .with_model("gpt-4o-mini")
//!     .with_api_keys(vec![std::env::var("OPENAI_API_KEY")?]);
//! let client = ApiClient::new(config)?;
//! let response = client.chat(&ChatPrompt::text("Say hello")).await?;
//! ```

pub mod client;
pub mod keys;
pub mod policy;
pub mod types;

pub use client::{
    ApiClient, ChatResponse, ClientConfig, HttpReply, HttpTransport, LlmProvider,
    ReqwestTransport, DEFAULT_BASE_URL,
};
pub use keys::{ApiKeyCursor, Rotation};
pub use policy::{classify_reply, ErrorClass, ErrorKind, RetryDecision, RetryPolicy};
pub use types::{
    build_payload, ChatPrompt, CompletionMode, GenerationOptions, Message, MessageContent,
    CHOICE_SEPARATOR, DEFAULT_SYSTEM_PROMPT,
};
