//! End-to-end runs against a fake OpenAI-compatible endpoint.
//!
//! The real [`ApiClient`] is used with an in-process transport, so retry,
//! key rotation and classification run exactly as in production.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use llm_runner::llm::{ApiClient, ClientConfig, ErrorKind, HttpReply, HttpTransport};
use llm_runner::progress::ProgressMode;
use llm_runner::runner::{BatchRunner, RunnerConfig};
use llm_runner::storage::OutputFormat;
use llm_runner::{LlmError, RunError};

#[derive(Default)]
struct EndpointState {
    /// Keys that answer with `insufficient_quota`.
    exhausted_keys: Mutex<HashSet<String>>,
    /// Prompts refused with `content_policy_violation`.
    flagged: HashSet<String>,
    /// Prompts answered with a server error.
    broken: HashSet<String>,
    /// Successful answers after which every key runs out of quota.
    quota: Option<usize>,
    answered: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
}

/// In-process endpoint; clones share state.
#[derive(Clone, Default)]
struct FakeEndpoint {
    state: Arc<EndpointState>,
}

impl FakeEndpoint {
    fn new(state: EndpointState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.state.calls.lock().unwrap().clone()
    }

    fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, prompt)| prompt).collect()
    }

    fn calls_with_key(&self, key: &str) -> usize {
        self.calls().iter().filter(|(k, _)| k == key).count()
    }
}

fn reply(status: u16, body: Value) -> Result<HttpReply, ErrorKind> {
    Ok(HttpReply {
        status,
        body: body.to_string(),
    })
}

#[async_trait]
impl HttpTransport for FakeEndpoint {
    async fn post_json(
        &self,
        _url: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<HttpReply, ErrorKind> {
        let prompt = body["messages"]
            .as_array()
            .and_then(|messages| messages.last())
            .and_then(|message| message["content"].as_str())
            .or_else(|| body["prompt"].as_str())
            .unwrap_or_default()
            .to_string();
        self.state
            .calls
            .lock()
            .unwrap()
            .push((api_key.to_string(), prompt.clone()));

        let out_of_quota = self.state.exhausted_keys.lock().unwrap().contains(api_key)
            || self
                .state
                .quota
                .is_some_and(|quota| self.state.answered.load(Ordering::SeqCst) >= quota);
        if out_of_quota {
            return reply(
                429,
                json!({"error": {"code": "insufficient_quota", "message": "quota exceeded"}}),
            );
        }
        if self.state.flagged.contains(&prompt) {
            return reply(
                400,
                json!({"error": {"code": "content_policy_violation", "message": "flagged"}}),
            );
        }
        if self.state.broken.contains(&prompt) {
            return reply(500, json!({"error": {"code": "server_error", "message": "boom"}}));
        }

        self.state.answered.fetch_add(1, Ordering::SeqCst);
        let answer = if prompt == "hi" {
            "hello".to_string()
        } else {
            format!("answer to {}", prompt)
        };
        reply(200, json!({"choices": [{"message": {"content": answer}}]}))
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(dataset: &str) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("input.jsonl"), dataset).unwrap();
        Self { dir }
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("out").join("results.jsonl")
    }

    fn config(&self, keys: &[&str]) -> RunnerConfig {
        let client = ClientConfig::default()
            .with_api_keys(keys.iter().map(|k| k.to_string()).collect())
            .with_max_retries(1)
            .with_retry_backoff(Duration::ZERO)
            .with_request_interval(Duration::ZERO);

        RunnerConfig::new(self.dir.path().join("input.jsonl"), self.output())
            .with_client(client)
            .with_workers(3)
            .with_poll_interval(Duration::from_millis(200))
            .with_progress(ProgressMode::Hidden)
    }

    fn runner(&self, config: RunnerConfig, endpoint: &FakeEndpoint) -> BatchRunner {
        let client = ApiClient::with_transport(config.client.clone(), endpoint.clone()).unwrap();
        BatchRunner::with_provider(config, Arc::new(client))
    }

    fn write_output(&self, content: &str) {
        let path = self.output();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read_output(&self) -> String {
        std::fs::read_to_string(self.output()).unwrap()
    }
}

fn output_ids(path: &Path) -> Vec<i64> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap()["id"].as_i64().unwrap())
        .collect()
}

fn dataset(n: usize) -> String {
    (0..n)
        .map(|i| format!("{{\"id\":{},\"query\":\"q{}\"}}\n", i, i))
        .collect()
}

#[tokio::test]
async fn test_single_item_round_trip() {
    let fixture = Fixture::new("{\"id\":1,\"query\":\"hi\"}\n");
    let endpoint = FakeEndpoint::default();

    let summary = fixture
        .runner(fixture.config(&["sk-a"]), &endpoint)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.store_total, Some(1));
    assert_eq!(
        fixture.read_output(),
        "{\"id\":1,\"query\":\"hi\",\"response\":\"hello\"}\n"
    );
}

#[tokio::test]
async fn test_resume_dispatches_only_missing_items() {
    let fixture = Fixture::new(
        "{\"id\":1,\"query\":\"a\"}\n{\"id\":2,\"query\":\"b\"}\n{\"id\":3,\"query\":\"c\"}\n",
    );
    fixture.write_output("{\"id\":2,\"query\":\"b\",\"response\":\"earlier\"}\n");
    let endpoint = FakeEndpoint::default();

    let summary = fixture
        .runner(fixture.config(&["sk-a"]), &endpoint)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.already_persisted, 1);
    assert_eq!(summary.dispatched, 2);

    let mut prompts = endpoint.prompts();
    prompts.sort();
    assert_eq!(prompts, vec!["a", "c"]);

    let content = fixture.read_output();
    assert_eq!(output_ids(&fixture.output()), vec![1, 2, 3]);
    assert!(content.contains("\"response\":\"earlier\""));
}

#[tokio::test]
async fn test_rerun_after_success_is_a_no_op() {
    let fixture = Fixture::new(&dataset(10));
    let endpoint = FakeEndpoint::default();

    fixture
        .runner(fixture.config(&["sk-a"]), &endpoint)
        .run()
        .await
        .unwrap();
    let first = fixture.read_output();
    let calls = endpoint.calls().len();
    assert_eq!(calls, 10);

    let summary = fixture
        .runner(fixture.config(&["sk-a"]), &endpoint)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.dispatched, 0);
    assert_eq!(endpoint.calls().len(), calls);
    assert_eq!(fixture.read_output(), first);
}

#[tokio::test]
async fn test_single_key_out_of_quota_aborts_and_keeps_store() {
    let fixture = Fixture::new(&dataset(5));
    fixture.write_output("{\"id\":0,\"query\":\"q0\",\"response\":\"kept\"}\n");
    let endpoint = FakeEndpoint::new(EndpointState {
        exhausted_keys: Mutex::new(["sk-only".to_string()].into_iter().collect()),
        ..Default::default()
    });

    let err = fixture
        .runner(fixture.config(&["sk-only"]), &endpoint)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RunError::Aborted(LlmError::KeysExhausted { keys: 1, .. })
    ));
    assert_eq!(
        fixture.read_output(),
        "{\"id\":0,\"query\":\"q0\",\"response\":\"kept\"}\n"
    );
}

#[tokio::test]
async fn test_quota_error_rotates_to_next_key() {
    let fixture = Fixture::new(&dataset(4));
    let endpoint = FakeEndpoint::new(EndpointState {
        exhausted_keys: Mutex::new(["sk-a".to_string()].into_iter().collect()),
        ..Default::default()
    });

    let config = fixture.config(&["sk-a", "sk-b"]).with_workers(1);
    let summary = fixture.runner(config, &endpoint).run().await.unwrap();

    assert_eq!(summary.completed, 4);
    assert_eq!(endpoint.calls_with_key("sk-a"), 1);
    assert_eq!(endpoint.calls_with_key("sk-b"), 4);
    assert_eq!(output_ids(&fixture.output()), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_concurrent_quota_errors_rotate_once() {
    let fixture = Fixture::new(&dataset(12));
    let endpoint = FakeEndpoint::new(EndpointState {
        exhausted_keys: Mutex::new(["sk-a".to_string()].into_iter().collect()),
        ..Default::default()
    });

    let config = fixture.config(&["sk-a", "sk-b", "sk-c"]).with_workers(4);
    let summary = fixture.runner(config, &endpoint).run().await.unwrap();

    assert_eq!(summary.completed, 12);
    // Workers racing on the first key all move to the second, never past it.
    assert!(endpoint.calls_with_key("sk-a") <= 4);
    assert_eq!(endpoint.calls_with_key("sk-c"), 0);
}

#[tokio::test]
async fn test_abort_still_flushes_completed_records() {
    let fixture = Fixture::new(&dataset(6));
    let endpoint = FakeEndpoint::new(EndpointState {
        quota: Some(2),
        ..Default::default()
    });

    let config = fixture.config(&["sk-a"]).with_workers(1);
    let err = fixture.runner(config, &endpoint).run().await.unwrap_err();
    assert!(matches!(err, RunError::Aborted(LlmError::KeysExhausted { .. })));
    assert_eq!(output_ids(&fixture.output()), vec![0, 1]);

    // A later run with fresh credentials picks up where the first stopped.
    let fresh = FakeEndpoint::default();
    let summary = fixture
        .runner(fixture.config(&["sk-b"]), &fresh)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.dispatched, 4);
    assert_eq!(output_ids(&fixture.output()), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_content_policy_items_are_skipped_once() {
    let fixture = Fixture::new(&dataset(4));
    let endpoint = FakeEndpoint::new(EndpointState {
        flagged: ["q2".to_string()].into_iter().collect(),
        ..Default::default()
    });

    let summary = fixture
        .runner(fixture.config(&["sk-a"]), &endpoint)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.completed, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        endpoint.prompts().iter().filter(|p| *p == "q2").count(),
        1
    );
    assert_eq!(output_ids(&fixture.output()), vec![0, 1, 3]);
}

#[tokio::test]
async fn test_run_terminates_when_every_item_fails() {
    let fixture = Fixture::new(&dataset(3));
    let endpoint = FakeEndpoint::new(EndpointState {
        broken: ["q0", "q1", "q2"].iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    });

    let config = fixture.config(&["sk-a"]).with_max_item_attempts(2);
    let summary = tokio::time::timeout(
        Duration::from_secs(30),
        fixture.runner(config, &endpoint).run(),
    )
    .await
    .expect("run should terminate")
    .unwrap();

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.abandoned, 3);
    assert_eq!(summary.requeued, 3);
    // max_retries = 1: two calls per attempt, two attempts per item.
    assert_eq!(endpoint.calls().len(), 12);
    assert!(!fixture.output().exists());
}

#[tokio::test]
async fn test_json_array_output_and_regenerate() {
    let fixture = Fixture::new(&dataset(3));
    let endpoint = FakeEndpoint::default();
    let output = fixture.dir.path().join("out").join("results.json");

    let mut config = fixture.config(&["sk-a"]);
    config.output_path = output.clone();
    assert_eq!(config.output_format(), OutputFormat::JsonArray);
    fixture.runner(config.clone(), &endpoint).run().await.unwrap();

    let records: Vec<Value> =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2]["response"], "answer to q2");

    let summary = fixture
        .runner(config.with_regenerate(true), &endpoint)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.already_persisted, 0);
    assert_eq!(endpoint.calls().len(), 6);
}
