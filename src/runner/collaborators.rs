//! Narrow contracts the runner consumes, plus one default for each.
//!
//! - [`DatasetSource`] loads the full logical dataset
//! - [`RequestBuilder`] turns a work item into a prompt
//! - [`Postprocessor`] turns a finished envelope into a persisted record
//!
//! Plain closures implement the two synchronous traits, so callers can
//! inject a one-off builder without declaring a type.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DatasetError;
use crate::llm::ChatPrompt;
use crate::scheduler::{RecordId, ResultEnvelope, WorkItem};
use crate::storage::Record;

/// Template used when none is configured.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "{query}";

/// Field the default postprocessor stores the model output under.
pub const RESPONSE_FIELD: &str = "response";

/// Loads the full logical dataset.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn load(&self) -> Result<Vec<WorkItem>, DatasetError>;
}

/// Produces the request for one item.
pub trait RequestBuilder: Send + Sync {
    fn build(&self, item: &WorkItem) -> anyhow::Result<ChatPrompt>;
}

impl<F> RequestBuilder for F
where
    F: Fn(&WorkItem) -> anyhow::Result<ChatPrompt> + Send + Sync,
{
    fn build(&self, item: &WorkItem) -> anyhow::Result<ChatPrompt> {
        self(item)
    }
}

/// Turns a successful envelope into the record to persist.
pub trait Postprocessor: Send + Sync {
    fn postprocess(&self, envelope: &ResultEnvelope) -> anyhow::Result<Record>;
}

impl<F> Postprocessor for F
where
    F: Fn(&ResultEnvelope) -> anyhow::Result<Record> + Send + Sync,
{
    fn postprocess(&self, envelope: &ResultEnvelope) -> anyhow::Result<Record> {
        self(envelope)
    }
}

/// An in-memory dataset.
#[async_trait]
impl DatasetSource for Vec<WorkItem> {
    async fn load(&self) -> Result<Vec<WorkItem>, DatasetError> {
        Ok(self.clone())
    }
}

/// Dataset read from a file holding either JSON lines or one JSON array.
///
/// Records without an `id` get their zero-based position in the file.
#[derive(Debug, Clone)]
pub struct JsonlDataset {
    path: PathBuf,
}

impl JsonlDataset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn invalid(&self, line: usize, message: impl Into<String>) -> DatasetError {
        DatasetError::InvalidRecord {
            path: self.path.clone(),
            line,
            message: message.into(),
        }
    }

    fn to_item(&self, value: Value, index: usize, line: usize) -> Result<WorkItem, DatasetError> {
        let Value::Object(mut fields) = value else {
            return Err(self.invalid(line, "record is not a JSON object"));
        };

        let id = match fields.remove("id") {
            None | Some(Value::Null) => RecordId::Int(index as i64),
            Some(raw) => serde_json::from_value::<RecordId>(raw)
                .map_err(|_| self.invalid(line, "id must be an integer or a string"))?,
        };

        Ok(WorkItem { id, fields })
    }

    fn parse_array(&self, content: &str) -> Result<Vec<WorkItem>, DatasetError> {
        let values: Vec<Value> =
            serde_json::from_str(content).map_err(|e| self.invalid(e.line(), e.to_string()))?;

        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| self.to_item(value, index, 1))
            .collect()
    }

    fn parse_lines(&self, content: &str) -> Result<Vec<WorkItem>, DatasetError> {
        let mut items = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value =
                serde_json::from_str(trimmed).map_err(|e| self.invalid(index + 1, e.to_string()))?;
            items.push(self.to_item(value, index, index + 1)?);
        }
        Ok(items)
    }
}

#[async_trait]
impl DatasetSource for JsonlDataset {
    async fn load(&self) -> Result<Vec<WorkItem>, DatasetError> {
        let content =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| DatasetError::Io {
                    path: self.path.clone(),
                    source,
                })?;

        let items = if content.trim_start().starts_with('[') {
            self.parse_array(&content)?
        } else {
            self.parse_lines(&content)?
        };

        tracing::debug!(
            path = %self.path.display(),
            items = items.len(),
            "Dataset loaded"
        );
        Ok(items)
    }
}

/// Renders a prompt from a template with `{field}` placeholders.
///
/// `{id}` expands to the item id. String fields are inserted verbatim, other
/// values as JSON. `{{` and `}}` produce literal braces; a brace that does
/// not open a valid placeholder is kept as is.
#[derive(Debug, Clone)]
pub struct TemplateRequestBuilder {
    template: String,
    image_field: Option<String>,
}

impl Default for TemplateRequestBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_TEMPLATE)
    }
}

impl TemplateRequestBuilder {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            image_field: None,
        }
    }

    /// Attaches the image referenced by `field` to every prompt.
    pub fn with_image_field(mut self, field: impl Into<String>) -> Self {
        self.image_field = Some(field.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    fn lookup(item: &WorkItem, name: &str) -> anyhow::Result<String> {
        if name == "id" {
            return Ok(item.id.to_string());
        }
        match item.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => anyhow::bail!("item {} has no field '{}'", item.id, name),
        }
    }

    fn render(&self, item: &WorkItem) -> anyhow::Result<String> {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(pos) = rest.find(['{', '}']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if tail.starts_with("{{") || tail.starts_with("}}") {
                out.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }

            if tail.starts_with('{') {
                if let Some(end) = tail.find('}') {
                    let name = &tail[1..end];
                    if is_placeholder(name) {
                        out.push_str(&Self::lookup(item, name)?);
                        rest = &tail[end + 1..];
                        continue;
                    }
                }
            }

            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl RequestBuilder for TemplateRequestBuilder {
    fn build(&self, item: &WorkItem) -> anyhow::Result<ChatPrompt> {
        let prompt = ChatPrompt::text(self.render(item)?);

        match &self.image_field {
            None => Ok(prompt),
            Some(field) => {
                let url = item.get_str(field).ok_or_else(|| {
                    anyhow::anyhow!("item {} has no string image field '{}'", item.id, field)
                })?;
                Ok(prompt.with_image(url))
            }
        }
    }
}

/// Stores the item's fields plus the raw response.
#[derive(Debug, Clone, Default)]
pub struct DirectPostprocessor;

impl Postprocessor for DirectPostprocessor {
    fn postprocess(&self, envelope: &ResultEnvelope) -> anyhow::Result<Record> {
        let response = envelope
            .response
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("item {} has no response", envelope.item.id))?;

        Ok(Record::from_item(&envelope.item).with_field(RESPONSE_FIELD, response))
    }
}
