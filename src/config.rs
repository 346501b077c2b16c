/// Configuration module for codectx.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::indexer::chunker::{
    ChunkerOptions, DEFAULT_BLOCK_CHUNK_CHARS, DEFAULT_MIN_CHUNK_CHARS,
};
use crate::query::preprocess::DEFAULT_MAX_TERMS;

pub const DEFAULT_CONFIG_FILE: &str = "codectx.json";

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./.codectx/index.db".to_string()
}

fn default_min_chunk_chars() -> usize {
    DEFAULT_MIN_CHUNK_CHARS
}

fn default_block_chunk_chars() -> usize {
    DEFAULT_BLOCK_CHUNK_CHARS
}

fn default_max_terms() -> usize {
    DEFAULT_MAX_TERMS
}

fn default_budget() -> usize {
    20_000
}

fn default_chars_per_token() -> usize {
    4
}

fn default_bm25_limit() -> usize {
    40
}

fn default_neighbor_limit() -> usize {
    8
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

fn default_excludes() -> Vec<String> {
    [
        "node_modules", ".git", "__pycache__", ".venv", "venv", "dist", "build", ".next",
        ".nuxt", "target", ".idea", "*.min.js", "*.min.css", "*.map", "*.lock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub chunker: ChunkerConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChunkerConfig {
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,

    #[serde(default = "default_block_chunk_chars")]
    pub block_chunk_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QueryConfig {
    #[serde(default = "default_max_terms")]
    pub max_terms: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ContextConfig {
    /// Token budget when the caller does not give one.
    #[serde(default = "default_budget")]
    pub default_budget: usize,

    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    /// How many BM25 hits to pull per query.
    #[serde(default = "default_bm25_limit")]
    pub bm25_limit: usize,

    /// Chunks whose call-graph neighbours are expanded.
    #[serde(default = "default_neighbor_limit")]
    pub neighbor_limit: usize,

    #[serde(default)]
    pub weights: RankWeights,
}

/// Weights of the ranking signals. Each signal lies in `[0, 1]`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RankWeights {
    pub bm25: f64,
    pub name_match: f64,
    pub lsp_definition: f64,
    pub directory_proximity: f64,
    pub import_distance: f64,
    pub type_priority: f64,
    /// Extra score per additional source that found the same chunk.
    pub multi_source_boost: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexConfig {
    /// Glob patterns matched against the file name, any path component, and
    /// the path relative to the project root.
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,

    /// When non-empty, only file names matching one of these are indexed.
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            chunker: ChunkerConfig::default(),
            query: QueryConfig::default(),
            context: ContextConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_chunk_chars: default_min_chunk_chars(),
            block_chunk_chars: default_block_chunk_chars(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_terms: default_max_terms(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_budget: default_budget(),
            chars_per_token: default_chars_per_token(),
            bm25_limit: default_bm25_limit(),
            neighbor_limit: default_neighbor_limit(),
            weights: RankWeights::default(),
        }
    }
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            bm25: 0.30,
            name_match: 0.25,
            lsp_definition: 0.20,
            directory_proximity: 0.10,
            import_distance: 0.10,
            type_priority: 0.05,
            multi_source_boost: 0.15,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            exclude: default_excludes(),
            include: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to [`DEFAULT_CONFIG_FILE`].
    /// A missing file or invalid JSON yields the default configuration.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_FILE
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.db_path.trim().is_empty(), "db_path must be set");
        anyhow::ensure!(
            self.chunker.block_chunk_chars > 0,
            "chunker.block_chunk_chars must be positive"
        );
        anyhow::ensure!(self.query.max_terms > 0, "query.max_terms must be positive");
        anyhow::ensure!(
            self.context.default_budget > 0,
            "context.default_budget must be positive"
        );
        anyhow::ensure!(
            self.context.chars_per_token > 0,
            "context.chars_per_token must be positive"
        );
        let w = &self.context.weights;
        for (name, value) in [
            ("bm25", w.bm25),
            ("name_match", w.name_match),
            ("lsp_definition", w.lsp_definition),
            ("directory_proximity", w.directory_proximity),
            ("import_distance", w.import_distance),
            ("type_priority", w.type_priority),
            ("multi_source_boost", w.multi_source_boost),
        ] {
            anyhow::ensure!(
                value.is_finite() && value >= 0.0,
                "context.weights.{name} must be a non-negative number"
            );
        }
        self.index.exclude_set()?;
        self.index.include_set()?;
        Ok(())
    }

    pub fn chunker_options(&self) -> ChunkerOptions {
        ChunkerOptions {
            min_chunk_chars: self.chunker.min_chunk_chars,
            block_chunk_chars: self.chunker.block_chunk_chars,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}

impl IndexConfig {
    pub fn exclude_set(&self) -> Result<GlobSet> {
        build_glob_set(&self.exclude)
    }

    /// `None` when every file name is accepted.
    pub fn include_set(&self) -> Result<Option<GlobSet>> {
        if self.include.is_empty() {
            return Ok(None);
        }
        build_glob_set(&self.include).map(Some)
    }
}

// ── Pattern helpers ──────────────────────────────────────────────────

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;
        builder.add(glob);
    }
    builder.build().context("failed to build glob set")
}

// ── Tests ────────────────────────────────────────────────────────────
