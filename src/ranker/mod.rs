//! Context assembly.
//!
//! [`Ranker::build_context`] classifies a question, splits the token budget
//! by intent, gathers candidate chunks from the index (BM25, exact names,
//! call-graph neighbours, type definitions) and from the caller (external
//! definitions), ranks them and fills each category's share greedily.
//! If the index cannot be read the result holds the current file only and
//! is flagged as degraded.

pub mod budget;
pub mod candidates;
pub mod render;

pub use budget::{BudgetAllocation, BudgetCategory};
pub use candidates::{Candidate, CandidatePool, ExternalDefinition, Source};
pub use render::{Selection, SourceRef, estimate_tokens};

use crate::cache::{TAG_LSP, TAG_PROJECT, TtlCache};
use crate::config::{Config, RankWeights};
use crate::db::{ChunkRecord, ScoredChunk, Store, StoreError, count_lines};
use crate::indexer::chunker::{Chunk, ChunkerOptions, extract_chunks_with};
use crate::indexer::languages::Language;
use crate::query::preprocess::is_stop_word;
use crate::query::{QueryIntent, classify_intent, preprocess_query_with};
use candidates::{directory_proximity, is_imported};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type StoreResult<T> = std::result::Result<T, StoreError>;

const MAX_NAME_LOOKUPS: usize = 16;
const MAX_TYPE_LOOKUPS: usize = 32;
const IMPORTED_FILE_SIGNAL: f64 = 0.5;

// ── Lookup cache ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LookupKey {
    Name(String),
    Callers(String),
    Callees(i64),
    Types(Vec<String>),
    FileChunks(String),
}

/// Memoized index lookups. Every entry carries the `project` tag; symbol
/// resolutions also carry `lsp`.
pub struct LookupCache {
    chunks: TtlCache<LookupKey, Vec<ChunkRecord>>,
    imports: TtlCache<String, Vec<String>>,
    ttl: Duration,
}

impl LookupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            chunks: TtlCache::new(),
            imports: TtlCache::new(),
            ttl,
        }
    }

    fn chunks(
        &self,
        key: LookupKey,
        load: impl FnOnce() -> StoreResult<Vec<ChunkRecord>>,
    ) -> StoreResult<Vec<ChunkRecord>> {
        let tags: &[&str] = match &key {
            LookupKey::Name(_) | LookupKey::Types(_) => &[TAG_PROJECT, TAG_LSP],
            _ => &[TAG_PROJECT],
        };
        self.chunks.get_or_try_insert_with(key, self.ttl, tags, load)
    }

    fn imports(
        &self,
        path: &str,
        load: impl FnOnce() -> StoreResult<Vec<String>>,
    ) -> StoreResult<Vec<String>> {
        self.imports
            .get_or_try_insert_with(path.to_string(), self.ttl, &[TAG_PROJECT], load)
    }

    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.chunks.invalidate_tag(tag) + self.imports.invalidate_tag(tag)
    }

    /// Call after any project file was (re)indexed or removed.
    pub fn invalidate_project(&self) -> usize {
        self.invalidate_tag(TAG_PROJECT)
    }

    pub fn on_lsp_reconnect(&self) -> usize {
        self.invalidate_tag(TAG_LSP)
    }

    pub fn len(&self) -> usize {
        self.chunks.len() + self.imports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Options and results ──────────────────────────────────────────────

/// The file being edited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentFile {
    /// Relative to the project root, or absolute.
    pub path: String,
    /// Read from disk when `None`.
    pub content: Option<String>,
    /// Detected from the extension when `None`.
    pub language: Option<Language>,
}

impl CurrentFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_content(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
            language: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Token budget; the configured default when `None`.
    pub budget: Option<usize>,
    pub current_file: Option<CurrentFile>,
    /// 1-indexed line of the cursor in the current file.
    pub cursor_line: Option<usize>,
    pub project_root: Option<PathBuf>,
    pub lsp_definitions: Vec<ExternalDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextMetadata {
    pub query_type: QueryIntent,
    pub budget: usize,
    pub budget_allocation: BudgetAllocation,
    pub sources: Vec<SourceRef>,
    /// Candidates dropped because another source or the current file already
    /// covered the same lines.
    pub deduplicated: usize,
    pub total_tokens: usize,
    /// The index was unavailable; only the current file was used.
    pub degraded: bool,
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextResult {
    pub text: String,
    pub metadata: ContextMetadata,
}

struct LoadedFile {
    path: String,
    language: Language,
    content: String,
}

// ── Ranker ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RankerSettings {
    default_budget: usize,
    chars_per_token: usize,
    bm25_limit: usize,
    neighbor_limit: usize,
    max_terms: usize,
    weights: RankWeights,
    chunker: ChunkerOptions,
}

pub struct Ranker {
    store: Option<Arc<Store>>,
    cache: Arc<LookupCache>,
    settings: RankerSettings,
}

impl Ranker {
    /// `store` is `None` when the index could not be opened; every context
    /// is then built in degraded mode.
    pub fn new(store: Option<Arc<Store>>, config: &Config) -> Self {
        Self {
            store,
            cache: Arc::new(LookupCache::new(config.cache_ttl())),
            settings: RankerSettings {
                default_budget: config.context.default_budget,
                chars_per_token: config.context.chars_per_token.max(1),
                bm25_limit: config.context.bm25_limit,
                neighbor_limit: config.context.neighbor_limit,
                max_terms: config.query.max_terms,
                weights: config.context.weights,
                chunker: config.chunker_options(),
            },
        }
    }

    /// Share a lookup cache, typically with the indexer that invalidates it.
    pub fn with_cache(mut self, cache: Arc<LookupCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<LookupCache> {
        &self.cache
    }

    /// Ranked chunks for a free-text query, BM25 only.
    pub fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<ScoredChunk>> {
        let Some(store) = &self.store else {
            warn!("index unavailable, search returns nothing");
            return Ok(Vec::new());
        };
        let terms = preprocess_query_with(query, self.settings.max_terms).terms;
        store.search_bm25(&terms, limit)
    }

    /// Assemble the context document for `query`. Never fails: index errors
    /// degrade the result to the current file.
    pub fn build_context(&self, query: &str, opts: &ContextOptions) -> ContextResult {
        let intent = classify_intent(query);
        let terms = preprocess_query_with(query, self.settings.max_terms).terms;
        let allocation = BudgetAllocation::for_intent(intent);
        let budget = opts.budget.unwrap_or(self.settings.default_budget);

        let current = self.load_current_file(opts);
        let mut selections = match &current {
            Some(file) => self.select_current_file(
                file,
                opts.cursor_line,
                allocation.tokens_for(BudgetCategory::CurrentFile, budget),
            ),
            None => Vec::new(),
        };

        let mut degraded = false;
        let mut deduplicated = 0;
        match &self.store {
            None => {
                warn!("index unavailable, using the current file only");
                degraded = true;
            }
            Some(store) => {
                match self.gather(store, query, &terms, opts, current.as_ref(), &selections) {
                    Ok(pool) => {
                        deduplicated = pool.duplicates();
                        let ranked = pool.into_ranked(&self.settings.weights);
                        selections.extend(self.fill(&ranked, &allocation, budget));
                    }
                    Err(e) => {
                        warn!("index lookup failed, using the current file only: {e}");
                        degraded = true;
                    }
                }
            }
        }

        let text = render::render(&selections);
        let total_tokens = estimate_tokens(&text, self.settings.chars_per_token);
        debug!(
            "context: intent={intent}, {} blocks, {total_tokens}/{budget} tokens, {deduplicated} deduplicated",
            selections.len()
        );

        ContextResult {
            text,
            metadata: ContextMetadata {
                query_type: intent,
                budget,
                budget_allocation: allocation,
                sources: selections.iter().map(SourceRef::from).collect(),
                deduplicated,
                total_tokens,
                degraded,
                terms,
            },
        }
    }

    fn load_current_file(&self, opts: &ContextOptions) -> Option<LoadedFile> {
        let file = opts.current_file.as_ref()?;
        let root = opts.project_root.as_deref();
        let content = match &file.content {
            Some(content) => content.clone(),
            None => {
                let disk_path = match root {
                    Some(root) if Path::new(&file.path).is_relative() => root.join(&file.path),
                    _ => PathBuf::from(&file.path),
                };
                match std::fs::read(&disk_path) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => {
                        warn!("cannot read current file {}: {e}", disk_path.display());
                        return None;
                    }
                }
            }
        };
        Some(LoadedFile {
            path: relative_path(root, &file.path),
            language: file
                .language
                .unwrap_or_else(|| Language::from_path(&file.path)),
            content,
        })
    }

    /// The whole file when it fits, otherwise the chunks nearest the cursor,
    /// otherwise a window of lines around the cursor.
    fn select_current_file(
        &self,
        file: &LoadedFile,
        cursor: Option<usize>,
        limit: usize,
    ) -> Vec<Selection> {
        if limit == 0 || file.content.is_empty() {
            return Vec::new();
        }
        let cpt = self.settings.chars_per_token;
        let heading = render::heading_tokens(BudgetCategory::CurrentFile, cpt);
        if heading >= limit {
            return Vec::new();
        }
        let selection = |start_line, end_line, chunk: Option<&Chunk>, content: String| {
            Selection {
                category: BudgetCategory::CurrentFile,
                file_path: file.path.clone(),
                language: file.language,
                start_line,
                end_line,
                kind: chunk.map(|c| c.kind),
                name: chunk.and_then(|c| c.name.clone()),
                content,
                score: None,
                tokens: 0,
            }
            .measured(cpt)
        };

        let line_count = count_lines(&file.content).max(1);
        let whole = selection(1, line_count, None, file.content.clone());
        if heading + whole.tokens <= limit {
            return vec![whole];
        }

        let mut chunks = extract_chunks_with(
            &file.path,
            file.content.as_bytes(),
            file.language,
            &self.settings.chunker,
        );
        chunks.sort_by_key(|c| cursor_rank(c, cursor));

        let mut picked: Vec<Selection> = Vec::new();
        let mut used = heading;
        for chunk in &chunks {
            if picked
                .iter()
                .any(|p| p.start_line <= chunk.end_line && chunk.start_line <= p.end_line)
            {
                continue;
            }
            let block = selection(chunk.start_line, chunk.end_line, Some(chunk), chunk.content.clone());
            if used + block.tokens > limit {
                break;
            }
            used += block.tokens;
            picked.push(block);
        }

        if picked.is_empty() {
            // Header and fence of the widest possible window block.
            let overhead = render::block_text(&selection(line_count, line_count, None, String::new()))
                .chars()
                .count();
            let max_chars = ((limit - heading) * cpt).saturating_sub(overhead);
            return cursor_window(&file.content, cursor, max_chars)
                .map(|(start, end, text)| vec![selection(start, end, None, text)])
                .unwrap_or_default();
        }

        picked.sort_by_key(|s| s.start_line);
        picked
    }

    fn gather(
        &self,
        store: &Store,
        query: &str,
        terms: &[String],
        opts: &ContextOptions,
        current: Option<&LoadedFile>,
        current_selections: &[Selection],
    ) -> StoreResult<CandidatePool> {
        let mut pool = CandidatePool::new();

        let hits = store.search_bm25(terms, self.settings.bm25_limit)?;
        let best = hits.iter().map(|h| h.score).fold(0.0_f64, f64::max);
        for hit in hits {
            let mut candidate = Candidate::from_record(hit.record, Source::Bm25);
            candidate.signals.bm25 = if best > 0.0 { hit.score / best } else { 0.0 };
            pool.add(candidate);
        }

        for token in name_tokens(query) {
            let records = self
                .cache
                .chunks(LookupKey::Name(token.clone()), || store.search_by_name(&token))?;
            for record in records {
                let exact = record.chunk.name.as_deref() == Some(token.as_str());
                let mut candidate = Candidate::from_record(record, Source::Name);
                candidate.signals.name_match = if exact { 1.0 } else { 0.8 };
                pool.add(candidate);
            }
        }

        let root = opts.project_root.as_deref();
        for def in &opts.lsp_definitions {
            let def = ExternalDefinition {
                file_path: relative_path(root, &def.file_path),
                ..def.clone()
            };
            if let Some(candidate) = Candidate::from_external(&def) {
                pool.add(candidate);
            }
        }

        // One hop along call edges from the strongest candidates and from the
        // chunks around the cursor.
        let mut seeds = top_seeds(&pool, &self.settings.weights, self.settings.neighbor_limit);
        let mut cursor_types = Vec::new();
        if let (Some(file), Some(line)) = (current, opts.cursor_line) {
            let own = self
                .cache
                .chunks(LookupKey::FileChunks(file.path.clone()), || {
                    store.file_chunks(&file.path)
                })?;
            for record in own
                .into_iter()
                .filter(|r| r.chunk.start_line <= line && line <= r.chunk.end_line)
            {
                cursor_types.extend(record.chunk.types.iter().cloned());
                seeds.push((Some(record.id), record.chunk.name.clone()));
            }
        }

        let mut neighbours = Vec::new();
        for (id, name) in &seeds {
            if let Some(id) = *id {
                neighbours.extend(
                    self.cache
                        .chunks(LookupKey::Callees(id), || store.get_callees(id))?,
                );
            }
            if let Some(name) = name {
                neighbours.extend(
                    self.cache
                        .chunks(LookupKey::Callers(name.clone()), || store.get_callers(name))?,
                );
            }
        }
        for record in neighbours {
            pool.add(Candidate::from_record(record, Source::CallGraph));
        }

        let mut seen = HashSet::new();
        let type_names: Vec<String> = pool
            .iter()
            .flat_map(|c| c.chunk.types.iter())
            .chain(cursor_types.iter())
            .filter(|t| seen.insert(t.as_str()))
            .take(MAX_TYPE_LOOKUPS)
            .cloned()
            .collect();
        if !type_names.is_empty() {
            let records = self
                .cache
                .chunks(LookupKey::Types(type_names.clone()), || {
                    store.find_type_definitions(&type_names)
                })?;
            for record in records {
                pool.add(Candidate::from_record(record, Source::TypeDefinition));
            }
        }

        if let Some(file) = current {
            let imports = self
                .cache
                .imports(&file.path, || store.file_imports(&file.path))?;
            for candidate in pool.iter_mut() {
                candidate.signals.directory_proximity =
                    directory_proximity(&file.path, &candidate.file_path);
                if candidate.file_path == file.path {
                    candidate.distance = 0;
                    candidate.signals.import_distance = 1.0;
                } else if is_imported(&imports, &candidate.file_path) {
                    candidate.distance = 1;
                    candidate.signals.import_distance = IMPORTED_FILE_SIGNAL;
                }
            }
            pool.discard(|c| {
                current_selections
                    .iter()
                    .any(|s| c.overlaps(&s.file_path, s.start_line, s.end_line))
            });
        }

        Ok(pool)
    }

    /// Fill each category in score order, stopping at the first candidate
    /// that does not fit. Unused tokens stay unused.
    fn fill(
        &self,
        ranked: &[Candidate],
        allocation: &BudgetAllocation,
        budget: usize,
    ) -> Vec<Selection> {
        let cpt = self.settings.chars_per_token;
        let mut out = Vec::new();
        for category in BudgetCategory::ALL {
            if category == BudgetCategory::CurrentFile {
                continue;
            }
            let limit = allocation.tokens_for(category, budget);
            let heading = render::heading_tokens(category, cpt);
            let mut used = 0;
            for candidate in ranked.iter().filter(|c| c.category() == category) {
                let block = Selection {
                    category,
                    file_path: candidate.file_path.clone(),
                    language: candidate.language,
                    start_line: candidate.chunk.start_line,
                    end_line: candidate.chunk.end_line,
                    kind: Some(candidate.chunk.kind),
                    name: candidate.chunk.name.clone(),
                    content: candidate.chunk.content.clone(),
                    score: Some(candidate.score),
                    tokens: 0,
                }
                .measured(cpt);
                // The first block also pays for the section heading.
                let cost = if used == 0 { heading + block.tokens } else { block.tokens };
                if used + cost > limit {
                    debug!("{category}: {used}/{limit} tokens used, stopping");
                    break;
                }
                used += cost;
                out.push(block);
            }
        }
        out
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// `path` relative to `root` with `/` separators.
fn relative_path(root: Option<&Path>, path: &str) -> String {
    let full = Path::new(path);
    let relative = root
        .and_then(|root| full.strip_prefix(root).ok())
        .unwrap_or(full);
    let text = relative.to_string_lossy().replace('\\', "/");
    text.trim_start_matches("./").to_string()
}

/// Chunks containing the cursor first (innermost first), then by distance.
/// Without a cursor every chunk ranks equal and file order is kept.
fn cursor_rank(chunk: &Chunk, cursor: Option<usize>) -> (usize, usize) {
    let Some(line) = cursor else {
        return (0, 0);
    };
    let span = chunk.end_line - chunk.start_line;
    if line < chunk.start_line {
        (chunk.start_line - line, span)
    } else if line > chunk.end_line {
        (line - chunk.end_line, span)
    } else {
        (0, span)
    }
}

/// Lines around the cursor that fit in `max_chars`, growing downwards
/// first. A single overlong line is cut.
fn cursor_window(
    content: &str,
    cursor: Option<usize>,
    max_chars: usize,
) -> Option<(usize, usize, String)> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() || max_chars == 0 {
        return None;
    }
    let center = cursor.unwrap_or(1).clamp(1, lines.len()) - 1;
    let width = |line: &str| line.chars().count() + 1;

    let mut used = width(lines[center]);
    if used > max_chars {
        let cut: String = lines[center].chars().take(max_chars).collect();
        return Some((center + 1, center + 1, cut));
    }

    let (mut lo, mut hi) = (center, center);
    loop {
        let mut grew = false;
        if hi + 1 < lines.len() && used + width(lines[hi + 1]) <= max_chars {
            hi += 1;
            used += width(lines[hi]);
            grew = true;
        }
        if lo > 0 && used + width(lines[lo - 1]) <= max_chars {
            lo -= 1;
            used += width(lines[lo]);
            grew = true;
        }
        if !grew {
            break;
        }
    }
    Some((lo + 1, hi + 1, lines[lo..=hi].join("\n")))
}

/// Identifier-like words of the raw query, as typed, for exact name lookup.
fn name_tokens(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2 && !is_stop_word(&t.to_lowercase()))
        .filter(|t| seen.insert(*t))
        .take(MAX_NAME_LOOKUPS)
        .map(str::to_string)
        .collect()
}

/// Chunk ids and names of the best candidates by unboosted score.
fn top_seeds(
    pool: &CandidatePool,
    weights: &RankWeights,
    limit: usize,
) -> Vec<(Option<i64>, Option<String>)> {
    let mut scored: Vec<(f64, usize, &Candidate)> = pool
        .iter()
        .map(|c| (c.signals.weighted(weights), c.order, c))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    scored
        .into_iter()
        .take(limit)
        .map(|(_, _, c)| (c.chunk_id, c.chunk.name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SourceFile;
    use crate::indexer::call_graph::extract_imports;
    use crate::indexer::chunker::extract_chunks;
    use chrono::Utc;

    const AUTH_PY: &str = r#"from app.security import hash_password


def login(username, password):
    """Log a user in."""
    user = validate_user(username, password)
    return user


def validate_user(username, password):
    """Check the credentials of a user."""
    hashed = hash_password(password)
    return lookup(username, hashed)
"#;

    const SECURITY_PY: &str = r#"import hashlib


def hash_password(password):
    """Hash a password with sha256."""
    return hashlib.sha256(password.encode()).hexdigest()
"#;

    const PROFILE_RS: &str = r#"pub struct Profile {
    pub id: u32,
    pub display: String,
}

pub fn load_account(id: u32) -> Profile {
    Profile { id, display: String::new() }
}
"#;

    fn index(store: &Store, path: &str, source: &str) {
        let language = Language::from_path(path);
        let chunks = extract_chunks(path, source.as_bytes(), language);
        let imports = extract_imports(source.as_bytes(), language);
        let file = SourceFile::from_content(path, source.as_bytes(), language, Utc::now());
        store.index_file(&file, &chunks, &imports).unwrap();
    }

    fn ranker() -> Ranker {
        let store = Store::open_in_memory().unwrap();
        index(&store, "app/auth.py", AUTH_PY);
        index(&store, "app/security.py", SECURITY_PY);
        index(&store, "src/profile.rs", PROFILE_RS);
        Ranker::new(Some(Arc::new(store)), &Config::default())
    }

    fn source<'a>(result: &'a ContextResult, name: &str) -> Option<&'a SourceRef> {
        result
            .metadata
            .sources
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
    }

    #[test]
    fn test_build_context_finds_relevant_code() {
        let ranker = ranker();
        let result = ranker.build_context("password hash", &ContextOptions::default());

        assert_eq!(result.metadata.query_type, QueryIntent::General);
        assert!(!result.metadata.degraded);
        assert!(result.metadata.terms.contains(&"password".to_string()));
        let hash = source(&result, "hash_password").unwrap();
        assert_eq!(hash.category, BudgetCategory::Bm25Results);
        assert!(result.text.contains("def hash_password(password):"));
        assert!(result.text.contains("### app/security.py:4-6 (function hash_password)"));
        assert!(result.metadata.total_tokens <= 20_000);
    }

    #[test]
    fn test_current_file_included_whole_and_not_repeated() {
        let ranker = ranker();
        let opts = ContextOptions {
            current_file: Some(CurrentFile::with_content("app/auth.py", AUTH_PY)),
            cursor_line: Some(6),
            ..Default::default()
        };
        let result = ranker.build_context("password hash", &opts);

        let first = &result.metadata.sources[0];
        assert_eq!(first.category, BudgetCategory::CurrentFile);
        assert_eq!((first.start_line, first.end_line), (1, 13));
        assert!(result.text.starts_with("## Current file"));
        assert!(
            result
                .metadata
                .sources
                .iter()
                .skip(1)
                .all(|s| s.file_path != "app/auth.py")
        );
        assert!(result.metadata.deduplicated > 0);
        assert!(source(&result, "hash_password").is_some());
    }

    #[test]
    fn test_call_graph_neighbours() {
        let ranker = ranker();
        let result = ranker.build_context("login", &ContextOptions::default());

        let login = source(&result, "login").unwrap();
        assert_eq!(login.category, BudgetCategory::Bm25Results);
        let callee = source(&result, "validate_user").unwrap();
        assert_eq!(callee.category, BudgetCategory::CallGraph);
    }

    #[test]
    fn test_type_definitions_follow_referenced_types() {
        let ranker = ranker();
        let result = ranker.build_context("load_account", &ContextOptions::default());

        assert_eq!(result.metadata.query_type, QueryIntent::SpecificFunction);
        assert!(source(&result, "load_account").is_some());
        let profile = source(&result, "Profile").unwrap();
        assert_eq!(profile.category, BudgetCategory::TypeDefinitions);
        assert!(result.text.contains("```rust\npub struct Profile {"));
    }

    #[test]
    fn test_external_definitions_become_candidates() {
        let ranker = ranker();
        let opts = ContextOptions {
            project_root: Some(PathBuf::from("/work/project")),
            lsp_definitions: vec![ExternalDefinition {
                symbol_name: "render_page".into(),
                file_path: "/work/project/web/page.ts".into(),
                content: "export function renderPage(): string {\n  return '';\n}".into(),
                start_line: 10,
                end_line: 12,
            }],
            ..Default::default()
        };
        let result = ranker.build_context("page rendering", &opts);

        let def = source(&result, "render_page").unwrap();
        assert_eq!(def.category, BudgetCategory::LspDefinitions);
        assert_eq!(def.file_path, "web/page.ts");
        assert!(result.text.contains("## Definitions"));
    }

    #[test]
    fn test_degraded_without_store() {
        let ranker = Ranker::new(None, &Config::default());
        let opts = ContextOptions {
            current_file: Some(CurrentFile::with_content("app/auth.py", AUTH_PY)),
            ..Default::default()
        };
        let result = ranker.build_context("password hash", &opts);

        assert!(result.metadata.degraded);
        assert!(
            result
                .metadata
                .sources
                .iter()
                .all(|s| s.category == BudgetCategory::CurrentFile)
        );
        assert!(result.text.contains("def login"));
        assert!(ranker.search("password", 5).unwrap().is_empty());
    }

    #[test]
    fn test_small_budget_truncates_current_file() {
        let ranker = Ranker::new(None, &Config::default());
        let body = "    total = total + 1\n".repeat(40);
        let content = format!("def counter(total):\n{body}    return total\n");
        let opts = ContextOptions {
            budget: Some(200),
            current_file: Some(CurrentFile::with_content("count.py", content)),
            cursor_line: Some(1),
            ..Default::default()
        };
        let result = ranker.build_context("counter", &opts);

        assert!(result.metadata.total_tokens <= 200);
        assert_eq!(result.metadata.total_tokens, estimate_tokens(&result.text, 4));
        assert_eq!(result.metadata.sources.len(), 1);
        let only = &result.metadata.sources[0];
        assert_eq!(only.category, BudgetCategory::CurrentFile);
        assert_eq!(only.start_line, 1);
        assert!(result.text.contains("def counter"));
    }

    #[test]
    fn test_rendered_context_stays_within_budget() {
        let source: String = (0..40)
            .map(|i| format!("def handler_{i}(request):\n    return request.value + {i}\n\n\n"))
            .collect();
        let store = Store::open_in_memory().unwrap();
        index(&store, "app/handlers.py", &source);
        let ranker = Ranker::new(Some(Arc::new(store)), &Config::default());
        let cpt = ranker.settings.chars_per_token;

        let opts = ContextOptions {
            budget: Some(300),
            ..Default::default()
        };
        let result = ranker.build_context("handler request value", &opts);

        assert!(!result.metadata.sources.is_empty());
        assert_eq!(result.metadata.total_tokens, estimate_tokens(&result.text, cpt));
        assert!(
            result.metadata.total_tokens <= 300,
            "{} tokens rendered",
            result.metadata.total_tokens
        );
        for category in BudgetCategory::ALL {
            let blocks: usize = result
                .metadata
                .sources
                .iter()
                .filter(|s| s.category == category)
                .map(|s| s.tokens)
                .sum();
            if blocks > 0 {
                let charged = blocks + render::heading_tokens(category, cpt);
                assert!(charged <= result.metadata.budget_allocation.tokens_for(category, 300));
            }
        }
    }

    #[test]
    fn test_current_file_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/security.py"), SECURITY_PY).unwrap();

        let ranker = Ranker::new(None, &Config::default());
        let opts = ContextOptions {
            current_file: Some(CurrentFile::new("app/security.py")),
            project_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let result = ranker.build_context("hash", &opts);
        assert_eq!(result.metadata.sources[0].file_path, "app/security.py");
        assert!(result.text.contains("hashlib.sha256"));

        let missing = ContextOptions {
            current_file: Some(CurrentFile::new("nope.py")),
            project_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(ranker.build_context("hash", &missing).metadata.sources.is_empty());
    }

    #[test]
    fn test_lookup_cache_invalidation() {
        let ranker = ranker();
        ranker.build_context("hash_password", &ContextOptions::default());
        assert!(!ranker.cache().is_empty());
        assert!(ranker.cache().on_lsp_reconnect() > 0);
        ranker.build_context("login", &ContextOptions::default());
        assert!(ranker.cache().invalidate_project() > 0);
        assert!(ranker.cache().is_empty());
    }

    #[test]
    fn test_search() {
        let ranker = ranker();
        let results = ranker.search("password hash", 3).unwrap();
        assert!(
            results
                .iter()
                .any(|r| r.record.chunk.name.as_deref() == Some("hash_password"))
        );
        assert!(ranker.search("", 3).unwrap().is_empty());
    }

    #[test]
    fn test_cursor_window() {
        let content = "a\nbb\nccc\ndddd\n";
        assert_eq!(cursor_window(content, Some(3), 8), Some((2, 3, "bb\nccc".into())));
        assert_eq!(cursor_window(content, Some(4), 3), Some((4, 4, "ddd".into())));
        assert_eq!(cursor_window(content, None, 100), Some((1, 4, "a\nbb\nccc\ndddd".into())));
        assert_eq!(cursor_window("", Some(1), 10), None);
    }

    #[test]
    fn test_name_tokens() {
        assert_eq!(
            name_tokens("where is getUserById used by the a service?"),
            vec!["getUserById", "used", "service"]
        );
    }

    #[test]
    fn test_relative_path() {
        let root = Path::new("/work/project");
        assert_eq!(relative_path(Some(root), "/work/project/src/a.rs"), "src/a.rs");
        assert_eq!(relative_path(Some(root), "./src/a.rs"), "src/a.rs");
        assert_eq!(relative_path(None, "/elsewhere/b.rs"), "/elsewhere/b.rs");
    }
}
