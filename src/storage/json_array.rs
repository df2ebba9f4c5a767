//! Whole-array JSON backing.
//!
//! The file always holds one pretty-printed array. An append is a
//! read-modify-write through the same atomic rewrite as the final flush.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{write_atomic, OutputFormat, OutputStore, Record};
use crate::error::StoreError;

/// Store holding all records in a single JSON array.
#[derive(Debug, Clone)]
pub struct JsonArrayStore {
    path: PathBuf,
}

impl JsonArrayStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl OutputStore for JsonArrayStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::JsonArray
    }

    async fn load(&self) -> Result<Vec<Record>, StoreError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|source| StoreError::CorruptArray {
            path: self.path.clone(),
            source,
        })
    }

    async fn append(&self, records: &[Record]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut all = self.load().await?;
        all.extend_from_slice(records);
        self.rewrite(&all).await
    }

    async fn rewrite(&self, records: &[Record]) -> Result<(), StoreError> {
        let mut bytes = serde_json::to_vec_pretty(records)?;
        bytes.push(b'\n');
        write_atomic(&self.path, bytes).await
    }
}
