//! # codectx: local code-context retrieval
//!
//! Indexes a source tree into structural chunks and assembles the most
//! relevant of them into a token-bounded context document for a question.
//!
//! ## Architecture
//!
//! - **[`config`]**: JSON configuration with defaults and validation
//! - **[`indexer`]**: Tree-sitter chunking, call graph and import extraction, project scans
//! - **[`db`]**: SQLite index: files, chunks, FTS5/BM25, call edges, imports
//! - **[`query`]**: Query normalization, synonym expansion, intent classification
//! - **[`ranker`]**: Intent-adaptive budgets, candidate ranking, context rendering
//! - **[`cache`]**: Expiring map with tag invalidation

pub mod cache;
pub mod config;
pub mod db;
pub mod indexer;
pub mod query;
pub mod ranker;
