//! Line-delimited JSON backing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{write_atomic, OutputFormat, OutputStore, Record};
use crate::error::StoreError;

/// Store with one JSON record per line.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    path: PathBuf,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the end of the file, far enough back to hold the whole last
    /// non-empty line. Returns the file offset of the bytes read.
    async fn read_tail(&self) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let len = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?
            .len();

        let mut window = TAIL_WINDOW.min(len);
        loop {
            let offset = len - window;
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| StoreError::io(&self.path, e))?;
            let mut buf = vec![0u8; window as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| StoreError::io(&self.path, e))?;

            let line_start_seen = content_end(&buf)
                .map(|end| buf[..end].contains(&b'\n'))
                .unwrap_or(false);
            if offset == 0 || line_start_seen {
                return Ok(Some((offset, buf)));
            }
            window = (window * 2).min(len);
        }
    }

    /// Prepares the file for an append after an interrupted write.
    ///
    /// Returns whether a newline must precede the new lines. A last line that
    /// is not a valid record is cut off, terminated or not, so it never ends
    /// up in the middle of the file.
    async fn prepare_tail(&self) -> Result<bool, StoreError> {
        let Some((offset, tail)) = self.read_tail().await? else {
            return Ok(false);
        };
        let unterminated = tail.last().is_some_and(|b| *b != b'\n');
        let Some(end) = content_end(&tail) else {
            return Ok(unterminated);
        };

        let start = tail[..end]
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);
        if serde_json::from_slice::<Record>(&tail[start..end]).is_ok() {
            return Ok(unterminated);
        }

        tracing::warn!(
            path = %self.path.display(),
            bytes = tail.len() - start,
            "Cutting off corrupt last line before appending"
        );
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.set_len(offset + start as u64)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        Ok(false)
    }
}

/// Bytes read from the end of the file before widening the search.
const TAIL_WINDOW: u64 = 4096;

/// End of the last non-whitespace byte, if any.
fn content_end(buf: &[u8]) -> Option<usize> {
    buf.iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
}

fn encode_lines(records: &[Record]) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

#[async_trait]
impl OutputStore for JsonlStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Jsonl
    }

    async fn load(&self) -> Result<Vec<Record>, StoreError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let lines: Vec<(usize, &str)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        let last = lines.len().saturating_sub(1);

        let mut records = Vec::with_capacity(lines.len());
        for (pos, (index, line)) in lines.into_iter().enumerate() {
            match serde_json::from_str::<Record>(line) {
                Ok(record) => records.push(record),
                // A torn final line is what an interrupted append leaves behind.
                Err(e) if pos == last => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %e,
                        "Ignoring truncated last line in output store"
                    );
                }
                Err(source) => {
                    return Err(StoreError::CorruptRecord {
                        path: self.path.clone(),
                        line: index + 1,
                        source,
                    })
                }
            }
        }

        Ok(records)
    }

    async fn append(&self, records: &[Record]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        if self.prepare_tail().await? {
            buf.push(b'\n');
        }
        buf.extend(encode_lines(records)?);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(&buf)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        Ok(())
    }

    async fn rewrite(&self, records: &[Record]) -> Result<(), StoreError> {
        write_atomic(&self.path, encode_lines(records)?).await
    }
}
