//! Durable output store for persisted records.
//!
//! Records are keyed by [`RecordId`]. Two backings share one trait:
//!
//! - **JSONL** ([`JsonlStore`]): one record per line, append-only between
//!   final flushes
//! - **JSON array** ([`JsonArrayStore`]): the whole file is one array,
//!   rewritten on every flush
//!
//! Both finish a run through [`OutputStore::finalize`], which merges pending
//! records into what is already on disk, keeps the first occurrence of each
//! id, sorts by id and atomically rewrites the file.
//!
//! ```rust,ignore
//! use llm_runner::storage::{open_store, OutputFormat};
//!
//! let store = open_store("out/answers.jsonl", OutputFormat::Jsonl);
//! store.append(&records).await?;
//! let total = store.finalize(leftover).await?;
//! ```

pub mod json_array;
pub mod jsonl;

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::scheduler::{RecordId, WorkItem};

pub use json_array::JsonArrayStore;
pub use jsonl::JsonlStore;

/// The unit written to the output store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Starts a record from an item's id and payload fields.
    pub fn from_item(item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            fields: item.fields.clone(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// On-disk layout of the output store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    #[serde(alias = "ndjson")]
    Jsonl,
    #[serde(alias = "json", alias = "array")]
    JsonArray,
}

impl OutputFormat {
    /// Guesses the format from a file extension: `.jsonl` is line-delimited,
    /// anything else is a JSON array.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("jsonl") => OutputFormat::Jsonl,
            _ => OutputFormat::JsonArray,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jsonl => write!(f, "jsonl"),
            OutputFormat::JsonArray => write!(f, "json"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "ndjson" => Ok(OutputFormat::Jsonl),
            "json" | "json_array" | "array" => Ok(OutputFormat::JsonArray),
            other => Err(format!(
                "unknown output format '{}', expected 'jsonl' or 'json'",
                other
            )),
        }
    }
}

/// Durable collection of records keyed by id.
///
/// Only the aggregator writes; every other caller reads.
#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Location of the backing file.
    fn path(&self) -> &Path;

    fn format(&self) -> OutputFormat;

    /// Reads every persisted record in file order. A missing file is empty.
    async fn load(&self) -> Result<Vec<Record>, StoreError>;

    /// Adds records after the persisted ones.
    async fn append(&self, records: &[Record]) -> Result<(), StoreError>;

    /// Replaces the whole content atomically.
    async fn rewrite(&self, records: &[Record]) -> Result<(), StoreError>;

    async fn exists(&self) -> bool {
        tokio::fs::try_exists(self.path()).await.unwrap_or(false)
    }

    /// Whether the store holds no record. A missing file counts as empty.
    async fn is_empty(&self) -> Result<bool, StoreError> {
        if !self.exists().await {
            return Ok(true);
        }
        Ok(self.load().await?.is_empty())
    }

    /// Deletes the backing file. Returns whether there was one.
    async fn remove(&self) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(self.path(), e)),
        }
    }

    /// Ids of every persisted record.
    async fn persisted_ids(&self) -> Result<HashSet<RecordId>, StoreError> {
        Ok(self.load().await?.into_iter().map(|r| r.id).collect())
    }

    /// Merges `pending` into the persisted records, dedups by id (first
    /// occurrence wins), sorts by id and rewrites the store.
    ///
    /// Returns the number of records in the final store.
    async fn finalize(&self, pending: Vec<Record>) -> Result<usize, StoreError> {
        let mut records = self.load().await?;
        records.extend(pending);

        let records = dedup_sorted(records);
        self.rewrite(&records).await?;

        tracing::debug!(
            path = %self.path().display(),
            records = records.len(),
            "Output store finalized"
        );
        Ok(records.len())
    }
}

/// Opens the store for `path` with the given layout.
pub fn open_store(path: impl Into<PathBuf>, format: OutputFormat) -> Arc<dyn OutputStore> {
    match format {
        OutputFormat::Jsonl => Arc::new(JsonlStore::new(path)),
        OutputFormat::JsonArray => Arc::new(JsonArrayStore::new(path)),
    }
}

/// Keeps the first record per id and sorts by id.
pub fn dedup_sorted(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut unique: Vec<Record> = records
        .into_iter()
        .filter(|record| seen.insert(record.id.clone()))
        .collect();
    unique.sort_by(|a, b| a.id.cmp(&b.id));
    unique
}

/// Writes `bytes` to a temporary file next to `path`, then renames it over
/// `path`, so readers never observe a half-written store.
pub(crate) async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<(), StoreError> {
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &bytes))
        .await
        .map_err(|e| StoreError::io(path, std::io::Error::other(e.to_string())))?
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".llm-runner-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_sorted_keeps_first() {
        let records = vec![
            Record::new(3).with_field("v", "first-3"),
            Record::new(1).with_field("v", "first-1"),
            Record::new(3).with_field("v", "second-3"),
            Record::new("a"),
            Record::new(2),
        ];

        let out = dedup_sorted(records);
        let ids: Vec<RecordId> = out.iter().map(|r| r.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                RecordId::Int(1),
                RecordId::Int(2),
                RecordId::Int(3),
                RecordId::from("a")
            ]
        );
        assert_eq!(out[2].get("v"), Some(&Value::from("first-3")));
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("jsonl".parse::<OutputFormat>(), Ok(OutputFormat::Jsonl));
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::JsonArray));
        assert!("csv".parse::<OutputFormat>().is_err());

        assert_eq!(
            OutputFormat::from_path(Path::new("out/a.jsonl")),
            OutputFormat::Jsonl
        );
        assert_eq!(
            OutputFormat::from_path(Path::new("out/a.json")),
            OutputFormat::JsonArray
        );
    }

    #[test]
    fn test_record_from_item() {
        let item = WorkItem::new(5).with_field("query", "hi");
        let record = Record::from_item(&item).with_field("response", "hello");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], 5);
        assert_eq!(json["query"], "hi");
        assert_eq!(json["response"], "hello");
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");

        write_atomic(&path, b"[]".to_vec()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
