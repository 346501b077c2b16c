//! Candidate pool: merging chunks found by several sources and scoring them.
use super::budget::BudgetCategory;
use crate::config::RankWeights;
use crate::db::ChunkRecord;
use crate::indexer::chunker::{Chunk, ChunkKind};
use crate::indexer::languages::Language;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// A definition resolved by a language server (or any other caller-side
/// lookup) and handed to the ranker as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDefinition {
    pub symbol_name: String,
    pub file_path: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Lsp,
    Bm25,
    Name,
    CallGraph,
    TypeDefinition,
}

impl Source {
    pub fn category(&self) -> BudgetCategory {
        match self {
            Source::Lsp => BudgetCategory::LspDefinitions,
            Source::Bm25 | Source::Name => BudgetCategory::Bm25Results,
            Source::CallGraph => BudgetCategory::CallGraph,
            Source::TypeDefinition => BudgetCategory::TypeDefinitions,
        }
    }
}

/// Ranking signals, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Signals {
    pub bm25: f64,
    pub name_match: f64,
    pub lsp_definition: f64,
    pub directory_proximity: f64,
    pub import_distance: f64,
    pub type_priority: f64,
}

impl Signals {
    fn merge(&mut self, other: &Signals) {
        self.bm25 = self.bm25.max(other.bm25);
        self.name_match = self.name_match.max(other.name_match);
        self.lsp_definition = self.lsp_definition.max(other.lsp_definition);
        self.directory_proximity = self.directory_proximity.max(other.directory_proximity);
        self.import_distance = self.import_distance.max(other.import_distance);
        self.type_priority = self.type_priority.max(other.type_priority);
    }

    pub fn weighted(&self, w: &RankWeights) -> f64 {
        w.bm25 * self.bm25
            + w.name_match * self.name_match
            + w.lsp_definition * self.lsp_definition
            + w.directory_proximity * self.directory_proximity
            + w.import_distance * self.import_distance
            + w.type_priority * self.type_priority
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: Option<i64>,
    pub file_path: String,
    pub language: Language,
    pub chunk: Chunk,
    pub signals: Signals,
    pub sources: BTreeSet<Source>,
    /// 0 for the current file, 1 for files it imports, 2 otherwise.
    pub distance: usize,
    /// Discovery order, the last tie breaker.
    pub order: usize,
    pub score: f64,
}

pub type CandidateKey = (String, usize, usize);

impl Candidate {
    pub fn from_record(record: ChunkRecord, source: Source) -> Self {
        let mut candidate = Self {
            chunk_id: Some(record.id),
            file_path: record.file_path,
            language: record.language,
            chunk: record.chunk,
            signals: Signals::default(),
            sources: BTreeSet::from([source]),
            distance: 2,
            order: 0,
            score: 0.0,
        };
        candidate.signals.type_priority = candidate.type_priority() as f64 / 3.0;
        candidate
    }

    /// `None` for a definition without content.
    pub fn from_external(def: &ExternalDefinition) -> Option<Self> {
        if def.content.trim().is_empty() || def.file_path.trim().is_empty() {
            return None;
        }
        let start_line = def.start_line.max(1);
        let end_line = def.end_line.max(start_line);
        let signature = def.content.lines().next().unwrap_or("").trim().to_string();
        let name = Some(def.symbol_name.clone()).filter(|n| !n.is_empty());
        let mut candidate = Self {
            chunk_id: None,
            language: Language::from_path(&def.file_path),
            file_path: def.file_path.clone(),
            chunk: Chunk {
                kind: ChunkKind::Function,
                name,
                signature,
                start_line,
                end_line,
                content: def.content.clone(),
                docstring: None,
                scope_path: String::new(),
                calls: Vec::new(),
                types: Vec::new(),
            },
            signals: Signals {
                lsp_definition: 1.0,
                ..Default::default()
            },
            sources: BTreeSet::from([Source::Lsp]),
            distance: 2,
            order: 0,
            score: 0.0,
        };
        candidate.signals.type_priority = candidate.type_priority() as f64 / 3.0;
        Some(candidate)
    }

    pub fn key(&self) -> CandidateKey {
        (
            self.file_path.clone(),
            self.chunk.start_line,
            self.chunk.end_line,
        )
    }

    /// The section this candidate is rendered in: the earliest one among
    /// the sources that found it.
    pub fn category(&self) -> BudgetCategory {
        self.sources
            .iter()
            .map(Source::category)
            .min()
            .unwrap_or(BudgetCategory::Bm25Results)
    }

    pub fn type_priority(&self) -> u8 {
        self.chunk.kind.type_priority()
    }

    pub fn overlaps(&self, path: &str, start: usize, end: usize) -> bool {
        self.file_path == path && self.chunk.start_line <= end && start <= self.chunk.end_line
    }

    fn merge(&mut self, other: Candidate) {
        self.signals.merge(&other.signals);
        self.sources.extend(other.sources);
        self.distance = self.distance.min(other.distance);
        if self.chunk_id.is_none() {
            self.chunk_id = other.chunk_id;
        }
        if self.chunk.types.is_empty() {
            self.chunk.types = other.chunk.types;
        }
    }
}

/// Candidates deduplicated by `(file_path, start_line, end_line)`.
#[derive(Debug, Default)]
pub struct CandidatePool {
    items: Vec<Candidate>,
    index: HashMap<CandidateKey, usize>,
    duplicates: usize,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate, merging it into an existing one with the same key.
    /// Returns `true` if it was new.
    pub fn add(&mut self, mut candidate: Candidate) -> bool {
        let key = candidate.key();
        if let Some(&idx) = self.index.get(&key) {
            self.items[idx].merge(candidate);
            self.duplicates += 1;
            return false;
        }
        candidate.order = self.items.len();
        self.index.insert(key, self.items.len());
        self.items.push(candidate);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Candidate> {
        self.items.iter_mut()
    }

    /// Drop candidates for which `discard` holds, counting them as duplicates.
    pub fn discard(&mut self, discard: impl Fn(&Candidate) -> bool) {
        let before = self.items.len();
        self.items.retain(|c| !discard(c));
        self.duplicates += before - self.items.len();
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.key(), idx))
            .collect();
    }

    /// Score every candidate and return them best first.
    pub fn into_ranked(self, weights: &RankWeights) -> Vec<Candidate> {
        let mut items = self.items;
        for c in &mut items {
            let extra_sources = c.sources.len().saturating_sub(1) as f64;
            c.score = c.signals.weighted(weights) * (1.0 + weights.multi_source_boost * extra_sources);
        }
        items.sort_by(compare_candidates);
        items
    }
}

/// Score, then structural priority, then distance, then discovery order.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.type_priority().cmp(&a.type_priority()))
        .then_with(|| a.distance.cmp(&b.distance))
        .then_with(|| a.order.cmp(&b.order))
}

fn dir_components(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    parts.pop();
    parts
}

/// 1.0 for the same directory, falling off with every directory step
/// between the two files.
pub fn directory_proximity(current: &str, candidate: &str) -> f64 {
    let a = dir_components(current);
    let b = dir_components(candidate);
    let common = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let steps = (a.len() - common) + (b.len() - common);
    1.0 / (1.0 + steps as f64)
}

fn module_components(module: &str) -> Vec<String> {
    let trimmed = module
        .trim_matches(|c| c == '"' || c == '\'')
        .trim_start_matches("@/");
    trimmed
        .split(|c| matches!(c, '/' | '\\' | '.' | ':' | '{' | '}' | ',' | ' '))
        .filter(|p| !p.is_empty() && !matches!(*p, "crate" | "super" | "self" | "*"))
        .map(|p| p.to_lowercase())
        .collect()
}

fn path_stem_components(path: &str) -> Vec<String> {
    let mut parts: Vec<String> = path
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .map(|p| p.to_lowercase())
        .collect();
    if let Some(last) = parts.last_mut() {
        if let Some((stem, _)) = last.rsplit_once('.') {
            *last = stem.to_string();
        }
    }
    if parts.len() > 1 && matches!(parts.last().map(String::as_str), Some("mod" | "index" | "__init__")) {
        parts.pop();
    }
    parts
}

/// Whether any of `modules` (imports of the current file) plausibly refers
/// to the file at `path`: its stem is one of the module's last two path
/// segments, or its directory is the module's last segment.
pub fn is_imported(modules: &[String], path: &str) -> bool {
    let stem = path_stem_components(path);
    let Some(file) = stem.last() else {
        return false;
    };
    let dir = stem.len().checked_sub(2).map(|i| &stem[i]);

    modules.iter().any(|module| {
        let parts = module_components(module);
        let tail = &parts[parts.len().saturating_sub(2)..];
        tail.contains(file) || (dir.is_some() && parts.last() == dir)
    })
}
