//! Configuration for one batch run.
//!
//! Values are layered: defaults, then an optional YAML file, then the
//! command line (whose flags also read `LLM_RUNNER_*` variables). The YAML file may carry API keys for
//! several endpoints, keyed by endpoint name:
//!
//! ```yaml
//! model: gpt-4o-mini
//! endpoint: openai
//! num_workers: 8
//! api_keys:
//!   openai: [sk-a, sk-b]
//!   gptgod: [sk-c]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::llm::{ClientConfig, CompletionMode};
use crate::progress::ProgressMode;
use crate::scheduler::WorkerPoolConfig;
use crate::storage::OutputFormat;

use super::collaborators::DEFAULT_PROMPT_TEMPLATE;
use super::consumer::DEFAULT_FLUSH_THRESHOLD;

/// Errors raised while assembling a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid duration '{value}' for {key}: {source}")]
    InvalidDuration {
        key: &'static str,
        value: f64,
        #[source]
        source: std::time::TryFromFloatSecsError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a run needs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Endpoint, credentials and generation settings.
    pub client: ClientConfig,
    /// Number of concurrent workers.
    pub num_workers: usize,
    /// Backlog wait before an idle worker gives up.
    pub poll_interval: Duration,
    /// Leases allowed per item; `0` means unbounded.
    pub max_item_attempts: u32,
    /// Buffered records that trigger an append.
    pub flush_threshold: usize,
    /// Input dataset (JSON lines or one JSON array).
    pub dataset_path: PathBuf,
    /// Output store location.
    pub output_path: PathBuf,
    /// Output layout; guessed from the output extension when unset.
    pub output_format: Option<OutputFormat>,
    /// Discard existing output and start over.
    pub regenerate: bool,
    /// Prompt template with `{field}` placeholders.
    pub prompt_template: String,
    /// Item field holding an image reference.
    pub image_field: Option<String>,
    /// How progress is shown.
    pub progress: ProgressMode,
    /// Progress refresh period.
    pub progress_refresh: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        Self {
            client: ClientConfig::default(),
            num_workers: pool.num_workers,
            poll_interval: pool.poll_interval,
            max_item_attempts: 3,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            dataset_path: PathBuf::from("data/input.jsonl"),
            output_path: PathBuf::from("output/results.jsonl"),
            output_format: None,
            regenerate: false,
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            image_field: None,
            progress: ProgressMode::default(),
            progress_refresh: Duration::from_millis(250),
        }
    }
}

/// API keys in a config file: one list, or lists keyed by endpoint name.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum KeySets {
    List(Vec<String>),
    ByEndpoint(HashMap<String, Vec<String>>),
}

/// Partial configuration read from YAML; unset fields keep their value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model: Option<String>,
    endpoint: Option<String>,
    base_url: Option<String>,
    api_keys: Option<KeySets>,
    max_retries: Option<u32>,
    request_timeout_secs: Option<u64>,
    retry_backoff_secs: Option<f64>,
    request_interval_ms: Option<u64>,
    system_prompt: Option<String>,
    completion_mode: Option<CompletionMode>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    n: Option<u32>,
    image_detail: Option<String>,
    extra_body: Option<Map<String, Value>>,
    num_workers: Option<usize>,
    poll_interval_secs: Option<f64>,
    max_item_attempts: Option<u32>,
    flush_threshold: Option<usize>,
    dataset: Option<PathBuf>,
    output: Option<PathBuf>,
    output_format: Option<OutputFormat>,
    regenerate: Option<bool>,
    prompt_template: Option<String>,
    image_field: Option<String>,
    progress: Option<ProgressMode>,
}

impl RunnerConfig {
    pub fn new(dataset_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            output_path: output_path.into(),
            ..Default::default()
        }
    }

    /// Loads defaults overlaid with a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.merge_yaml_file(path)?;
        Ok(config)
    }

    /// Overlays the fields set in a YAML file.
    pub fn merge_yaml_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        self.apply(file)
    }

    fn apply(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        let client = &mut self.client;
        overlay(&mut client.model, file.model);
        overlay(&mut client.endpoint_name, file.endpoint);
        overlay(&mut client.base_url, file.base_url);
        overlay(&mut client.max_retries, file.max_retries);
        overlay(
            &mut client.request_timeout,
            file.request_timeout_secs.map(Duration::from_secs),
        );
        overlay(
            &mut client.retry_backoff,
            seconds("retry_backoff_secs", file.retry_backoff_secs)?,
        );
        overlay(
            &mut client.request_interval,
            file.request_interval_ms.map(Duration::from_millis),
        );
        overlay(&mut client.system_prompt, file.system_prompt);
        if file.completion_mode.is_some() {
            client.completion_mode = file.completion_mode;
        }

        let generation = &mut client.generation;
        overlay(&mut generation.temperature, file.temperature);
        overlay(&mut generation.max_tokens, file.max_tokens);
        overlay(&mut generation.n, file.n);
        if file.image_detail.is_some() {
            generation.image_detail = file.image_detail;
        }
        if let Some(extra) = file.extra_body {
            generation.extra.extend(extra);
        }

        // Resolved after `endpoint` so the key map follows the final name.
        match file.api_keys {
            Some(KeySets::List(keys)) => client.api_keys = keys,
            Some(KeySets::ByEndpoint(mut sets)) => {
                if let Some(keys) = sets.remove(&client.endpoint_name) {
                    client.api_keys = keys;
                }
            }
            None => {}
        }

        overlay(&mut self.num_workers, file.num_workers);
        overlay(
            &mut self.poll_interval,
            seconds("poll_interval_secs", file.poll_interval_secs)?,
        );
        overlay(&mut self.max_item_attempts, file.max_item_attempts);
        overlay(&mut self.flush_threshold, file.flush_threshold);
        overlay(&mut self.dataset_path, file.dataset);
        overlay(&mut self.output_path, file.output);
        if file.output_format.is_some() {
            self.output_format = file.output_format;
        }
        overlay(&mut self.regenerate, file.regenerate);
        overlay(&mut self.prompt_template, file.prompt_template);
        if file.image_field.is_some() {
            self.image_field = file.image_field;
        }
        overlay(&mut self.progress, file.progress);
        Ok(())
    }

    /// Checks the values a run cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "no API key configured for endpoint '{}'",
                self.client.endpoint_name
            )));
        }
        if self.client.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".to_string()));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.flush_threshold == 0 {
            return Err(ConfigError::Invalid(
                "flush_threshold must be at least 1".to_string(),
            ));
        }
        if self.progress_refresh.is_zero() {
            return Err(ConfigError::Invalid(
                "progress_refresh must be greater than zero".to_string(),
            ));
        }
        if self.prompt_template.is_empty() {
            return Err(ConfigError::Invalid(
                "prompt_template must not be empty".to_string(),
            ));
        }
        if self.client.generation.n == 0 {
            return Err(ConfigError::Invalid("n must be at least 1".to_string()));
        }
        if self.dataset_path == self.output_path {
            return Err(ConfigError::Invalid(
                "dataset and output must be different files".to_string(),
            ));
        }
        Ok(())
    }

    /// Output layout in effect.
    pub fn output_format(&self) -> OutputFormat {
        self.output_format
            .unwrap_or_else(|| OutputFormat::from_path(&self.output_path))
    }

    /// Attempt budget for the backlog; `None` when unbounded.
    pub fn attempt_budget(&self) -> Option<u32> {
        (self.max_item_attempts > 0).then_some(self.max_item_attempts)
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.num_workers).with_poll_interval(self.poll_interval)
    }

    /// Log file written next to the output store.
    pub fn log_file_path(&self) -> PathBuf {
        match self.output_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("default.log"),
            _ => PathBuf::from("default.log"),
        }
    }

    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_item_attempts(mut self, attempts: u32) -> Self {
        self.max_item_attempts = attempts;
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    pub fn with_regenerate(mut self, regenerate: bool) -> Self {
        self.regenerate = regenerate;
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn with_image_field(mut self, field: impl Into<String>) -> Self {
        self.image_field = Some(field.into());
        self
    }

    pub fn with_progress(mut self, mode: ProgressMode) -> Self {
        self.progress = mode;
        self
    }
}

fn overlay<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Float seconds from a config file; negative, NaN and overflowing values are rejected.
fn seconds(key: &'static str, value: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(|source| ConfigError::InvalidDuration {
                key,
                value: secs,
                source,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_key() -> RunnerConfig {
        let mut config = RunnerConfig::new("in.jsonl", "out.jsonl");
        config.client.api_keys = vec!["sk-test".to_string()];
        config
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.max_item_attempts, 3);
        assert_eq!(config.flush_threshold, 20);
        assert_eq!(config.attempt_budget(), Some(3));
        assert_eq!(config.output_format(), OutputFormat::Jsonl);
        assert_eq!(config.client.max_retries, 10);
        assert_eq!(
            config.log_file_path(),
            PathBuf::from("output").join("default.log")
        );
    }

    #[test]
    fn test_yaml_overlay_with_endpoint_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "model: gpt-4o\nendpoint: gptgod\nbase_url: https://gptgod.example/v1\n\
             api_keys:\n  openai: [sk-a]\n  gptgod: [sk-b, sk-c]\n\
             num_workers: 2\ntemperature: 0.7\nextra_body:\n  top_p: 0.9\n\
             output: out/answers.json\nprogress: log\n"
        )
        .unwrap();

        let config = RunnerConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.client.model, "gpt-4o");
        assert_eq!(config.client.api_keys, vec!["sk-b", "sk-c"]);
        assert_eq!(config.client.url(), "https://gptgod.example/v1/chat/completions");
        assert_eq!(config.num_workers, 2);
        assert!((config.client.generation.temperature - 0.7).abs() < f64::EPSILON);
        assert_eq!(
            config.client.generation.extra.get("top_p"),
            Some(&Value::from(0.9))
        );
        assert_eq!(config.output_format(), OutputFormat::JsonArray);
        assert_eq!(config.progress, ProgressMode::Log);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_item_attempts, 3);
    }

    #[test]
    fn test_yaml_plain_key_list_and_unknown_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_keys: [sk-1, sk-2]").unwrap();
        let config = RunnerConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.client.api_keys, vec!["sk-1", "sk-2"]);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers: 3").unwrap();
        assert!(matches!(
            RunnerConfig::from_yaml_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validate() {
        assert!(with_key().validate().is_ok());

        let err = RunnerConfig::new("in.jsonl", "out.jsonl").validate().unwrap_err();
        assert!(err.to_string().contains("API key"));

        assert!(with_key().with_workers(0).validate().is_err());
        assert!(with_key().with_flush_threshold(0).validate().is_err());

        let mut frozen = with_key();
        frozen.progress_refresh = Duration::ZERO;
        assert!(frozen.validate().unwrap_err().to_string().contains("progress_refresh"));
        assert!(with_key().with_prompt_template("").validate().is_err());

        let mut same = with_key();
        same.output_path = same.dataset_path.clone();
        assert!(same.validate().is_err());
    }

    #[test]
    fn test_yaml_rejects_bad_durations() {
        for line in [
            "poll_interval_secs: -1",
            "retry_backoff_secs: .nan",
            "poll_interval_secs: 1e300",
        ] {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "{}", line).unwrap();
            let err = RunnerConfig::from_yaml_file(file.path()).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidDuration { .. }), "{}", line);
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_secs: 0.5\nretry_backoff_secs: 2").unwrap();
        let config = RunnerConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.client.retry_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_unbounded_attempts() {
        assert_eq!(with_key().with_max_item_attempts(0).attempt_budget(), None);
    }
}
