//! Resident chunk data and the line scan over it.

use super::types::ScanOutcome;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Shortest file name accepted as a chunk when enumerating a directory.
pub const MIN_CHUNK_NAME_LEN: usize = 9;

/// One chunk file loaded into memory, split into lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub name: String,
    pub lines: Vec<String>,
}

impl Chunk {
    pub fn from_text(name: impl Into<String>, text: &str) -> Self {
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        if text.ends_with('\n') {
            lines.pop();
        }
        Self {
            name: name.into(),
            lines,
        }
    }
}

/// Chunks currently resident in memory, in load order.
///
/// Chunks are shared behind `Arc` so a scan can work on a snapshot without
/// holding the dataset lock.
#[derive(Debug, Default)]
pub struct Dataset {
    chunks: Vec<Arc<Chunk>>,
}

impl Dataset {
    pub fn contains(&self, name: &str) -> bool {
        self.chunks.iter().any(|chunk| chunk.name == name)
    }

    /// Adds a chunk unless one with the same name is already resident.
    pub fn insert(&mut self, chunk: Chunk) -> bool {
        if self.contains(&chunk.name) {
            return false;
        }
        self.chunks.push(Arc::new(chunk));
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.chunks.len();
        self.chunks.retain(|chunk| chunk.name != name);
        self.chunks.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.chunks.iter().map(|chunk| chunk.name.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Chunk>> {
        self.chunks.clone()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Scans chunks in order, and each chunk line by line, for an exact line match.
///
/// `aborted` is polled before every line; once it returns true the scan stops
/// with [`ScanOutcome::Aborted`].
pub fn scan<F>(chunks: &[Arc<Chunk>], query: &str, aborted: F) -> ScanOutcome
where
    F: Fn() -> bool,
{
    for chunk in chunks {
        for (idx, line) in chunk.lines.iter().enumerate() {
            if aborted() {
                return ScanOutcome::Aborted;
            }
            if line == query {
                return ScanOutcome::Found {
                    chunk: chunk.name.clone(),
                    line: idx,
                };
            }
        }
    }
    ScanOutcome::NotFound
}

/// Lists chunk candidates in `dir`: regular entries whose name is at least
/// [`MIN_CHUNK_NAME_LEN`] bytes long, sorted by name.
pub async fn list_chunk_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read chunk directory {}", dir.display()))?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.len() >= MIN_CHUNK_NAME_LEN {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Reads `<dir>/<name>` from disk and splits it into lines.
pub async fn read_chunk(dir: &Path, name: &str) -> Result<Chunk> {
    let path = dir.join(name);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read chunk {}", path.display()))?;

    tracing::info!(
        "Opened chunk [{}] of size {} MB",
        name,
        bytes.len() / 1024 / 1024
    );

    let chunk = Chunk::from_text(name, &String::from_utf8_lossy(&bytes));
    tracing::debug!("Chunk [{}] holds {} lines", name, chunk.lines.len());

    Ok(chunk)
}
