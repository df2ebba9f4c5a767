//! CLI command definitions for llm-runner.
//!
//! Two subcommands: `run` dispatches every pending dataset item to the
//! endpoint, `status` reports what a run would do without sending anything.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::llm::CompletionMode;
use crate::metrics::{export_metrics, init_metrics};
use crate::progress::ProgressMode;
use crate::runner::{BatchRunner, JsonlDataset, ResumableLoader, RunSummary, RunnerConfig};
use crate::storage::{open_store, OutputFormat};

/// Batch LLM request runner with resumable output.
#[derive(Parser)]
#[command(name = "llm-runner")]
#[command(about = "Send a dataset to an LLM endpoint with a pool of workers, resumably")]
#[command(version)]
#[command(
    long_about = "llm-runner sends every record of a JSONL dataset to an OpenAI-compatible endpoint \
through a pool of concurrent workers and writes the answers to an output file keyed by id.\n\n\
Records already present in the output are skipped, so an interrupted run can simply be restarted.\n\n\
Example usage:\n  llm-runner run -d data/questions.jsonl -o output/answers.jsonl -m gpt-4o-mini -w 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process every dataset item that is not yet in the output.
    Run(Box<RunArgs>),

    /// Show total, persisted and remaining counts without calling the endpoint.
    Status(StatusArgs),
}

/// Dataset and output selection shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    /// YAML config file; command-line flags override its values.
    #[arg(short, long, env = "LLM_RUNNER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Input dataset (JSON lines or one JSON array).
    #[arg(short, long, env = "LLM_RUNNER_DATASET")]
    pub dataset: Option<PathBuf>,

    /// Output file; `.jsonl` is line-delimited, anything else a JSON array.
    #[arg(short, long, env = "LLM_RUNNER_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Output layout (jsonl, json); overrides the extension guess.
    #[arg(long, env = "LLM_RUNNER_OUTPUT_FORMAT")]
    pub output_format: Option<OutputFormat>,
}

/// Arguments for `llm-runner run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Model identifier.
    #[arg(short, long, env = "LLM_RUNNER_MODEL")]
    pub model: Option<String>,

    /// Endpoint name, used to pick the key set from the config file.
    #[arg(long, env = "LLM_RUNNER_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Endpoint base URL (e.g. https://api.openai.com/v1).
    #[arg(long, env = "LLM_RUNNER_BASE_URL")]
    pub base_url: Option<String>,

    /// API key; repeat or separate with commas for rotation order.
    #[arg(long = "api-key", env = "LLM_RUNNER_API_KEYS", value_delimiter = ',', hide_env_values = true)]
    pub api_keys: Vec<String>,

    /// Number of concurrent workers.
    #[arg(short, long, env = "LLM_RUNNER_NUM_WORKERS")]
    pub workers: Option<usize>,

    /// Retryable failures tolerated per request.
    #[arg(long, env = "LLM_RUNNER_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Times one item may be attempted before it is abandoned (0 = unbounded).
    #[arg(long, env = "LLM_RUNNER_MAX_ITEM_ATTEMPTS")]
    pub max_item_attempts: Option<u32>,

    /// Discard the existing output and process the whole dataset.
    #[arg(long)]
    pub regenerate: bool,

    /// Prompt template with {field} placeholders.
    #[arg(long, env = "LLM_RUNNER_PROMPT_TEMPLATE", conflicts_with = "prompt_file")]
    pub prompt_template: Option<String>,

    /// File holding the prompt template.
    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    /// System prompt; pass an empty string to omit it.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Force the completions flavor (chat, legacy).
    #[arg(long, value_parser = parse_completion_mode)]
    pub completion_mode: Option<CompletionMode>,

    /// Sampling temperature.
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Maximum tokens per choice.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Number of choices per request; their texts are joined.
    #[arg(short = 'n', long)]
    pub n: Option<u32>,

    /// Item field holding an image URL for multimodal requests.
    #[arg(long)]
    pub image_field: Option<String>,

    /// Detail hint for images (low, high, auto).
    #[arg(long)]
    pub image_detail: Option<String>,

    /// Extra request body fields as a JSON object.
    #[arg(long, value_parser = parse_json_object)]
    pub extra_body: Option<Map<String, Value>>,

    /// Progress display (bars, log, hidden).
    #[arg(long)]
    pub progress: Option<ProgressMode>,

    /// Also write logs to default.log next to the output file.
    #[arg(long)]
    pub log_file: bool,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print the run summary as JSON on stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `llm-runner status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Print the counts as JSON on stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

fn parse_completion_mode(raw: &str) -> Result<CompletionMode, String> {
    match raw.to_ascii_lowercase().as_str() {
        "chat" => Ok(CompletionMode::Chat),
        "legacy" | "completion" | "completions" => Ok(CompletionMode::Legacy),
        other => Err(format!(
            "unknown completion mode '{}', expected 'chat' or 'legacy'",
            other
        )),
    }
}

fn parse_json_object(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

impl StoreArgs {
    /// Config file (if any) overlaid with these flags.
    fn load_config(&self) -> anyhow::Result<RunnerConfig> {
        let mut config = match &self.config {
            Some(path) => RunnerConfig::from_yaml_file(path)?,
            None => RunnerConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut RunnerConfig) {
        if let Some(dataset) = &self.dataset {
            config.dataset_path = dataset.clone();
        }
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if self.output_format.is_some() {
            config.output_format = self.output_format;
        }
    }
}

impl RunArgs {
    /// Resolves the full run configuration: defaults, config file, flags.
    pub fn resolve_config(&self) -> anyhow::Result<RunnerConfig> {
        let mut config = self.store.load_config()?;
        let client = &mut config.client;

        if let Some(model) = &self.model {
            client.model = model.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            client.endpoint_name = endpoint.clone();
        }
        if let Some(base_url) = &self.base_url {
            client.base_url = base_url.clone();
        }
        if !self.api_keys.is_empty() {
            client.api_keys = self
                .api_keys
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        } else if client.api_keys.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                client.api_keys = vec![key];
            }
        }
        if let Some(max_retries) = self.max_retries {
            client.max_retries = max_retries;
        }
        if let Some(system_prompt) = &self.system_prompt {
            client.system_prompt = system_prompt.clone();
        }
        if self.completion_mode.is_some() {
            client.completion_mode = self.completion_mode;
        }

        let generation = &mut client.generation;
        if let Some(temperature) = self.temperature {
            generation.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            generation.max_tokens = max_tokens;
        }
        if let Some(n) = self.n {
            generation.n = n;
        }
        if let Some(detail) = &self.image_detail {
            generation.image_detail = Some(detail.clone());
        }
        if let Some(extra) = &self.extra_body {
            generation.extra.extend(extra.clone());
        }

        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(attempts) = self.max_item_attempts {
            config.max_item_attempts = attempts;
        }
        if self.regenerate {
            config.regenerate = true;
        }
        if let Some(template) = &self.prompt_template {
            config.prompt_template = template.clone();
        }
        if let Some(path) = &self.prompt_file {
            config.prompt_template = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read prompt file {}: {}", path.display(), e)
            })?;
        }
        if let Some(field) = &self.image_field {
            config.image_field = Some(field.clone());
        }
        if let Some(progress) = self.progress {
            config.progress = progress;
        }
        if self.json && self.progress.is_none() {
            // Keep stdout and stderr clean for machine consumers.
            config.progress = ProgressMode::Hidden;
        }

        Ok(config)
    }
}

impl Cli {
    /// Log file requested on the command line, resolved against the output
    /// location. `None` when file logging is off or the config is unusable.
    pub fn log_file_path(&self) -> Option<PathBuf> {
        match &self.command {
            Commands::Run(args) if args.log_file => args
                .resolve_config()
                .ok()
                .map(|config| config.log_file_path()),
            _ => None,
        }
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the llm-runner CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            run_batch_command(*args).await?;
        }
        Commands::Status(args) => {
            run_status_command(args).await?;
        }
    }
    Ok(())
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_batch_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.resolve_config()?;
    config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    info!(
        dataset = %config.dataset_path.display(),
        output = %config.output_path.display(),
        format = %config.output_format(),
        model = %config.client.model,
        workers = config.num_workers,
        keys = config.client.api_keys.len(),
        "Configuration resolved"
    );

    let runner = BatchRunner::new(config)?;
    let result = runner.run().await;

    if let Some(path) = &args.metrics_file {
        write_metrics(path)?;
    }

    let summary = result?;
    if args.json {
        let json_output = serde_json::to_string_pretty(&summary)
            .map_err(|e| anyhow::anyhow!("Failed to serialize run summary: {}", e))?;
        println!("{}", json_output);
    } else {
        print_summary(&summary, &runner.config().output_path);
    }

    Ok(())
}

fn write_metrics(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, export_metrics())
        .map_err(|e| anyhow::anyhow!("Failed to write metrics to {}: {}", path.display(), e))?;
    info!(path = %path.display(), "Metrics written");
    Ok(())
}

fn print_summary(summary: &RunSummary, output: &Path) {
    println!();
    println!("Run {} finished in {:.1}s", summary.run_id, summary.duration_secs);
    println!("  dataset items:     {}", summary.total);
    println!("  already persisted: {}", summary.already_persisted);
    println!("  dispatched:        {}", summary.dispatched);
    println!("  completed:         {}", summary.completed);
    println!("  skipped:           {}", summary.skipped);
    println!("  abandoned:         {}", summary.abandoned);
    println!("  dropped:           {}", summary.dropped);
    match summary.store_total {
        Some(total) => println!("  output records:    {} ({})", total, output.display()),
        None => println!("  output untouched:  {}", output.display()),
    }
}

// ============================================================================
// Status Command Implementation
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct StatusOutput {
    dataset: String,
    output: String,
    format: String,
    total: usize,
    persisted: usize,
    remaining: usize,
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = args.store.load_config()?;
    let store = open_store(config.output_path.clone(), config.output_format());
    let loader = ResumableLoader::new(
        Arc::new(JsonlDataset::new(config.dataset_path.clone())),
        store,
    );
    let status = loader.plan(false).await?.status();

    let output = StatusOutput {
        dataset: config.dataset_path.display().to_string(),
        output: config.output_path.display().to_string(),
        format: config.output_format().to_string(),
        total: status.total,
        persisted: status.persisted,
        remaining: status.remaining,
    };

    if args.json {
        let json_output = serde_json::to_string_pretty(&output)
            .map_err(|e| anyhow::anyhow!("Failed to serialize status JSON: {}", e))?;
        println!("{}", json_output);
    } else {
        println!("Dataset:   {}", output.dataset);
        println!("Output:    {} ({})", output.output, output.format);
        println!("Total:     {}", output.total);
        println!("Persisted: {}", output.persisted);
        println!("Remaining: {}", output.remaining);
    }

    Ok(())
}
