//! Source parsing and project scanning.

pub mod block;
pub mod call_graph;
pub mod chunker;
pub mod core;
pub mod languages;

pub use self::core::{FileOutcome, IndexError, Indexer, ScanResult};
pub use chunker::{Chunk, ChunkKind, ChunkerOptions, extract_chunks, extract_chunks_with};
pub use languages::Language;
