//! Request and response types for OpenAI-compatible completion endpoints.
//!
//! Covers the chat body (`messages`, optionally multimodal), the legacy
//! completions body (`prompt`), and extraction of choice texts from a
//! successful response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default system prompt sent ahead of every chat request.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Separator placed between the texts of multiple choices.
pub const CHOICE_SEPARATOR: &str = "\n\n";

/// What a request builder hands to the client for one item.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatPrompt {
    /// User prompt text.
    pub text: String,
    /// Optional image reference; turns the request into a multimodal one.
    pub image_url: Option<String>,
}

impl ChatPrompt {
    /// Creates a text-only prompt.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_url: None,
        }
    }

    /// Attaches an image reference.
    pub fn with_image(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }
}

/// Which endpoint flavor a model is served through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// `/chat/completions` with a `messages` array.
    #[default]
    Chat,
    /// `/completions` with a bare `prompt`, for instruct-only models.
    Legacy,
}

impl CompletionMode {
    /// Picks the mode a model needs: instruct models only speak the legacy API.
    pub fn for_model(model: &str) -> Self {
        if model.ends_with("-instruct") {
            CompletionMode::Legacy
        } else {
            CompletionMode::Chat
        }
    }

    /// Path appended to the endpoint base URL.
    pub fn path(&self) -> &'static str {
        match self {
            CompletionMode::Chat => "chat/completions",
            CompletionMode::Legacy => "completions",
        }
    }
}

/// Generation parameters shared by every request of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum number of tokens to generate per choice.
    pub max_tokens: u32,
    /// Number of choices to request.
    pub n: u32,
    /// `detail` hint for image inputs (e.g. "low", "high", "auto").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_detail: Option<String>,
    /// Extra body fields passed through verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 1000,
            n: 1,
            image_detail: None,
            extra: Map::new(),
        }
    }
}

impl GenerationOptions {
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_n(mut self, n: u32) -> Self {
        self.n = n;
        self
    }

    pub fn with_image_detail(mut self, detail: impl Into<String>) -> Self {
        self.image_detail = Some(detail.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender (e.g., "system", "user", "assistant").
    pub role: String,
    /// Content of the message.
    pub content: MessageContent,
}

impl Message {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a user message carrying text and an image.
    pub fn user_with_image(
        text: impl Into<String>,
        image_url: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url.into(),
                        detail,
                    },
                },
            ]),
        }
    }
}

/// Plain text or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Body of a `/chat/completions` request.
#[derive(Debug, Clone, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<Message>,
    temperature: f64,
    max_tokens: u32,
    n: u32,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

/// Body of a legacy `/completions` request.
#[derive(Debug, Clone, Serialize)]
struct LegacyRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f64,
    max_tokens: u32,
    n: u32,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

/// Builds the JSON body for one request.
pub fn build_payload(
    model: &str,
    mode: CompletionMode,
    system_prompt: &str,
    prompt: &ChatPrompt,
    options: &GenerationOptions,
) -> Result<Value, serde_json::Error> {
    match mode {
        CompletionMode::Legacy => serde_json::to_value(LegacyRequestBody {
            model,
            prompt: &prompt.text,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            n: options.n,
            extra: &options.extra,
        }),
        CompletionMode::Chat => {
            let user = match &prompt.image_url {
                Some(url) => {
                    Message::user_with_image(&prompt.text, url, options.image_detail.clone())
                }
                None => Message::user(&prompt.text),
            };
            let mut messages = Vec::with_capacity(2);
            if !system_prompt.is_empty() {
                messages.push(Message::system(system_prompt));
            }
            messages.push(user);

            serde_json::to_value(ChatRequestBody {
                model,
                messages,
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                n: options.n,
                extra: &options.extra,
            })
        }
    }
}

/// Successful response body; only the fields the runner reads.
#[derive(Debug, Deserialize)]
pub(crate) struct CompletionBody {
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionChoice {
    #[serde(default)]
    pub message: Option<ChoiceMessage>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl CompletionBody {
    /// Joins the text of every choice, in order.
    ///
    /// Returns `None` when there are no choices or a choice has no text.
    pub fn joined_text(&self) -> Option<String> {
        if self.choices.is_empty() {
            return None;
        }
        let texts: Option<Vec<&str>> = self
            .choices
            .iter()
            .map(|choice| {
                choice
                    .message
                    .as_ref()
                    .and_then(|m| m.content.as_deref())
                    .or(choice.text.as_deref())
            })
            .collect();
        texts.map(|texts| texts.join(CHOICE_SEPARATOR))
    }
}
