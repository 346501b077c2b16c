use crate::indexer::chunker::Chunk;
use crate::indexer::languages::Language;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// SHA-256 of raw file bytes, lowercase hex.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Number of lines as the chunker numbers them: a trailing newline does not
/// open a new line.
pub fn count_lines(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let breaks = text.matches('\n').count();
    if text.ends_with('\n') { breaks } else { breaks + 1 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content_hash: String,
    pub modified_at: DateTime<Utc>,
    pub language: Language,
    pub line_count: usize,
}

impl SourceFile {
    pub fn from_content(
        path: impl Into<String>,
        content: &[u8],
        language: Language,
        modified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            path: path.into(),
            content_hash: content_hash(content),
            modified_at,
            language,
            line_count: count_lines(&String::from_utf8_lossy(content)),
        }
    }
}

/// A stored file row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub content_hash: String,
    pub modified_at: DateTime<Utc>,
    pub language: Language,
    pub line_count: usize,
}

/// Outcome of writing a file row. Carries the file id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted(i64),
    /// Content changed; previous chunks, edges and imports were dropped.
    Replaced(i64),
    Unchanged(i64),
}

impl Upsert {
    pub fn id(&self) -> i64 {
        match self {
            Upsert::Inserted(id) | Upsert::Replaced(id) | Upsert::Unchanged(id) => *id,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Upsert::Unchanged(_))
    }
}

/// A chunk read back from the index together with its file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub file_path: String,
    pub language: Language,
    #[serde(flatten)]
    pub chunk: Chunk,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub record: ChunkRecord,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub file_count: usize,
    pub chunk_count: usize,
    pub import_count: usize,
    pub call_count: usize,
    pub languages: BTreeMap<String, usize>,
}
