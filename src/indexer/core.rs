use super::call_graph::extract_imports;
use super::chunker::{ChunkerOptions, extract_chunks_with};
use super::languages::Language;
use crate::config::Config;
use crate::db::{SourceFile, Store, StoreError, Upsert};
use crate::ranker::LookupCache;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use ignore::WalkBuilder;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid pattern: {0}")]
    Pattern(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub chunks: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Indexed { upsert: Upsert, chunks: usize },
    /// Same content hash as the stored file.
    Unchanged,
    /// Filtered out by pattern, size or file type.
    Skipped,
    /// The file is gone and was dropped from the index.
    Removed,
}

impl FileOutcome {
    pub fn is_indexed(&self) -> bool {
        matches!(self, FileOutcome::Indexed { .. })
    }
}

/// Keeps the index in step with a project tree.
///
/// Writes to one path are serialized by a per-path lock; parsing happens
/// before the store's writer lock is taken, so unrelated files can be
/// indexed from several threads.
pub struct Indexer {
    store: Arc<Store>,
    chunker: ChunkerOptions,
    excludes: GlobSet,
    includes: Option<GlobSet>,
    max_file_bytes: u64,
    cache: Option<Arc<LookupCache>>,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Indexer {
    pub fn new(store: Arc<Store>, config: &Config) -> Result<Self> {
        let excludes = config
            .index
            .exclude_set()
            .map_err(|e| IndexError::Pattern(format!("{e:#}")))?;
        let includes = config
            .index
            .include_set()
            .map_err(|e| IndexError::Pattern(format!("{e:#}")))?;
        Ok(Self {
            store,
            chunker: config.chunker_options(),
            excludes,
            includes,
            max_file_bytes: config.index.max_file_bytes,
            cache: None,
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Invalidate `cache` whenever the index changes.
    pub fn with_cache(mut self, cache: Arc<LookupCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Exclude patterns match the relative path or any single component of it.
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.excludes.is_match(relative)
            || relative
                .split('/')
                .any(|part| !part.is_empty() && self.excludes.is_match(part))
    }

    /// Include patterns match the file name.
    pub fn is_included(&self, relative: &str) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        self.includes.as_ref().is_none_or(|set| set.is_match(name))
    }

    fn accepts(&self, relative: &str) -> bool {
        !self.is_excluded(relative)
            && self.is_included(relative)
            && Language::is_indexable_path(relative)
    }

    /// Index every accepted file under `root` and drop files that vanished.
    ///
    /// Every file is read and hashed; files whose content hash matches the
    /// stored one are skipped unless `force`. Modification times only refresh
    /// the stored row, since two saves can share an mtime.
    /// Cancellation is checked between files; a cancelled scan keeps what
    /// it committed and removes nothing.
    pub fn index_directory(
        &self,
        root: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        let existing = self.store.list_files()?;
        let mut seen = HashSet::new();
        let mut result = ScanResult::default();

        let excludes = self.excludes.clone();
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .filter_entry(move |entry| {
                entry.depth() == 0
                    || !entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| excludes.is_match(name))
            })
            .build();

        for entry in walker {
            if cancel.is_cancelled() {
                info!("scan of {} cancelled", root.display());
                result.cancelled = true;
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("walk: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let Some(relative) = relative_to(root, path) else {
                continue;
            };
            if !self.accepts(&relative) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("{relative}: {e}");
                    result.failed += 1;
                    seen.insert(relative);
                    continue;
                }
            };
            if metadata.len() > self.max_file_bytes {
                debug!("{relative}: {} bytes, too large", metadata.len());
                result.skipped += 1;
                continue;
            }
            seen.insert(relative.clone());

            let modified = modified_time(&metadata);
            let previous = existing.get(&relative);
            match self.index_file_at(path, &relative, modified, force) {
                Ok(FileOutcome::Indexed { chunks, .. }) => {
                    result.indexed += 1;
                    result.chunks += chunks;
                    if previous.is_some() {
                        result.updated += 1;
                    } else {
                        result.added += 1;
                    }
                }
                Ok(_) => result.skipped += 1,
                Err(e) => {
                    warn!("{relative}: {e}");
                    result.failed += 1;
                }
            }
        }

        if !result.cancelled {
            for path in existing.keys().filter(|p| !seen.contains(*p)) {
                if self.store.delete_file(path)? {
                    debug!("{path}: removed");
                    result.removed += 1;
                }
            }
        }

        if result.indexed + result.removed > 0 {
            self.invalidate_cache();
        }
        info!(
            "scan of {}: {} indexed ({} added, {} updated), {} skipped, {} removed, {} failed, {} chunks",
            root.display(),
            result.indexed,
            result.added,
            result.updated,
            result.skipped,
            result.removed,
            result.failed,
            result.chunks
        );
        Ok(result)
    }

    /// Index one file of the project rooted at `root`.
    pub fn index_path(&self, root: &Path, path: &Path, force: bool) -> Result<FileOutcome> {
        let relative = relative_to(root, path).unwrap_or_else(|| portable_path(path));
        if !self.accepts(&relative) {
            return Ok(FileOutcome::Skipped);
        }
        let metadata = std::fs::metadata(path).map_err(|source| IndexError::Io {
            path: relative.clone(),
            source,
        })?;
        if !metadata.is_file() || metadata.len() > self.max_file_bytes {
            return Ok(FileOutcome::Skipped);
        }

        let outcome = self.index_file_at(path, &relative, modified_time(&metadata), force)?;
        if outcome.is_indexed() {
            self.invalidate_cache();
        }
        Ok(outcome)
    }

    /// Save hook: re-index the file, or drop it if it no longer exists.
    /// Clears the `project` cache tag whenever the index changed.
    pub fn on_file_saved(&self, root: &Path, path: &Path) -> Result<FileOutcome> {
        if path.exists() {
            return self.index_path(root, path, false);
        }
        let relative = relative_to(root, path).unwrap_or_else(|| portable_path(path));
        if self.remove_path(&relative)? {
            return Ok(FileOutcome::Removed);
        }
        Ok(FileOutcome::Skipped)
    }

    pub fn remove_path(&self, relative: &str) -> Result<bool> {
        let removed = self.with_path_lock(relative, || Ok(self.store.delete_file(relative)?))?;
        if removed {
            self.invalidate_cache();
        }
        Ok(removed)
    }

    /// Index content already in memory under the project-relative `path`.
    pub fn index_source(
        &self,
        path: &str,
        content: &[u8],
        modified_at: DateTime<Utc>,
        force: bool,
    ) -> Result<FileOutcome> {
        self.with_path_lock(path, || self.write_source(path, content, modified_at, force))
    }

    fn write_source(
        &self,
        path: &str,
        content: &[u8],
        modified_at: DateTime<Utc>,
        force: bool,
    ) -> Result<FileOutcome> {
        let language = Language::from_path(path);
        let file = SourceFile::from_content(path, content, language, modified_at);

        if !force {
            if let Some(stored) = self.store.get_file(path)? {
                if stored.content_hash == file.content_hash {
                    if stored.modified_at != file.modified_at {
                        self.store.upsert_file(&file)?;
                    }
                    return Ok(FileOutcome::Unchanged);
                }
            }
        }

        let chunks = extract_chunks_with(path, content, language, &self.chunker);
        let imports = extract_imports(content, language);
        let upsert = if force {
            self.store.reindex_file(&file, &chunks, &imports)?
        } else {
            self.store.index_file(&file, &chunks, &imports)?
        };
        if upsert.is_unchanged() {
            return Ok(FileOutcome::Unchanged);
        }
        Ok(FileOutcome::Indexed {
            upsert,
            chunks: chunks.len(),
        })
    }

    fn index_file_at(
        &self,
        path: &Path,
        relative: &str,
        modified_at: DateTime<Utc>,
        force: bool,
    ) -> Result<FileOutcome> {
        let content = std::fs::read(path).map_err(|source| IndexError::Io {
            path: relative.to_string(),
            source,
        })?;
        self.index_source(relative, &content, modified_at, force)
    }

    /// Run `f` holding the lock for `path`. The lock's map entry is dropped
    /// once no other caller holds or waits for it.
    fn with_path_lock<T>(&self, path: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
        result
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_project();
        }
    }
}

fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// `path` below `root`, `/`-separated. `None` outside `root` or for `root`
/// itself.
fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let joined = portable_path(relative);
    (!joined.is_empty()).then_some(joined)
}

fn portable_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TAG_PROJECT;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    const AUTH_PY: &str = "def login(username, password):\n    return validate_user(username, password)\n";
    const UTIL_JS: &str = "function slugify(text) {\n  return text.toLowerCase().trim();\n}\n";

    fn indexer() -> Indexer {
        let store = Arc::new(Store::open_in_memory().unwrap());
        Indexer::new(store, &Config::default()).unwrap()
    }

    fn project() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/auth.py"), AUTH_PY).unwrap();
        fs::write(dir.path().join("util.js"), UTIL_JS).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_indexer_differential_sync() {
        let dir = project();
        let indexer = indexer();
        let cancel = CancellationToken::new();

        let first = indexer.index_directory(dir.path(), false, &cancel).unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(first.indexed, 2);
        assert_eq!(first.skipped, 0);
        assert!(first.chunks >= 2);

        // Unchanged content is skipped.
        let second = indexer.index_directory(dir.path(), false, &cancel).unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.skipped, 2);

        let forced = indexer.index_directory(dir.path(), true, &cancel).unwrap();
        assert_eq!(forced.updated, 2);
        assert_eq!(forced.indexed, 2);
        assert_eq!(forced.added, 0);

        let files = indexer.store().list_files().unwrap();
        assert!(files.contains_key("app/auth.py"));
        assert!(files.contains_key("util.js"));
    }

    fn write_with_mtime(path: &Path, content: &str, mtime: std::time::SystemTime) {
        fs::write(path, content).unwrap();
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[test]
    fn test_edits_within_one_second_are_reindexed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.py");
        let base = std::time::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let indexer = indexer();
        let cancel = CancellationToken::new();

        write_with_mtime(&path, "def alpha_original():\n    return 'first version'\n", base + Duration::from_millis(100));
        assert_eq!(indexer.index_directory(dir.path(), false, &cancel).unwrap().added, 1);

        write_with_mtime(&path, "def beta_edited():\n    return 'second version'\n", base + Duration::from_millis(800));
        let result = indexer.index_directory(dir.path(), false, &cancel).unwrap();
        assert_eq!(result.updated, 1);
        assert_eq!(result.skipped, 0);
        let names: Vec<_> = indexer
            .store()
            .file_chunks("jobs.py")
            .unwrap()
            .into_iter()
            .map(|r| r.chunk.name)
            .collect();
        assert_eq!(names, vec![Some("beta_edited".to_string())]);

        // Identical mtime, different content.
        write_with_mtime(&path, "def gamma_restored():\n    return 'third version'\n", base + Duration::from_millis(800));
        let result = indexer.index_directory(dir.path(), false, &cancel).unwrap();
        assert_eq!(result.updated, 1);
        let chunks = indexer.store().file_chunks("jobs.py").unwrap();
        assert_eq!(chunks[0].chunk.name.as_deref(), Some("gamma_restored"));

        let again = indexer.index_directory(dir.path(), false, &cancel).unwrap();
        assert_eq!(again.skipped, 1);
        assert_eq!(again.indexed, 0);
    }

    #[test]
    fn test_vanished_files_are_removed() {
        let dir = project();
        let indexer = indexer();
        let cancel = CancellationToken::new();
        indexer.index_directory(dir.path(), false, &cancel).unwrap();

        fs::remove_file(dir.path().join("util.js")).unwrap();
        let result = indexer.index_directory(dir.path(), false, &cancel).unwrap();
        assert_eq!(result.removed, 1);
        assert_eq!(indexer.store().get_stats().unwrap().file_count, 1);
    }

    #[test]
    fn test_cancelled_scan_stops_between_files() {
        let dir = project();
        let indexer = indexer();
        let cancel = CancellationToken::new();
        indexer.index_directory(dir.path(), false, &cancel).unwrap();
        fs::remove_file(dir.path().join("util.js")).unwrap();

        cancel.cancel();
        let result = indexer.index_directory(dir.path(), false, &cancel).unwrap();
        assert!(result.cancelled);
        assert_eq!(result.indexed, 0);
        assert_eq!(result.removed, 0);
        assert_eq!(indexer.store().get_stats().unwrap().file_count, 2);
    }

    #[test]
    fn test_excludes_and_includes() {
        let dir = project();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), UTIL_JS).unwrap();
        fs::write(dir.path().join("bundle.min.js"), UTIL_JS).unwrap();

        let indexer = indexer();
        let result = indexer
            .index_directory(dir.path(), false, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.indexed, 2);
        assert!(indexer.is_excluded("node_modules/pkg/index.js"));
        assert!(indexer.is_excluded("bundle.min.js"));
        assert!(!indexer.is_excluded("app/auth.py"));

        let mut config = Config::default();
        config.index.include = vec!["*.py".to_string()];
        let only_py = Indexer::new(Arc::new(Store::open_in_memory().unwrap()), &config).unwrap();
        let result = only_py
            .index_directory(dir.path(), false, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.indexed, 1);
        assert!(only_py.is_included("deep/dir/x.py"));
        assert!(!only_py.is_included("util.js"));
    }

    #[test]
    fn test_large_files_are_skipped() {
        let dir = project();
        let mut config = Config::default();
        config.index.max_file_bytes = 70;
        let indexer = Indexer::new(Arc::new(Store::open_in_memory().unwrap()), &config).unwrap();
        let result = indexer
            .index_directory(dir.path(), false, &CancellationToken::new())
            .unwrap();
        // auth.py is 76 bytes, util.js 63
        assert_eq!(result.indexed, 1);
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn test_index_source_hash_check() {
        let indexer = indexer();
        let now = Utc::now();
        let first = indexer.index_source("app/auth.py", AUTH_PY.as_bytes(), now, false).unwrap();
        assert!(matches!(first, FileOutcome::Indexed { upsert: Upsert::Inserted(_), chunks: 1 }));

        let same = indexer.index_source("app/auth.py", AUTH_PY.as_bytes(), now, false).unwrap();
        assert_eq!(same, FileOutcome::Unchanged);

        let edited = format!("{AUTH_PY}\n\ndef logout(session):\n    session.clear()\n    return True\n");
        let changed = indexer.index_source("app/auth.py", edited.as_bytes(), now, false).unwrap();
        assert!(matches!(changed, FileOutcome::Indexed { upsert: Upsert::Replaced(_), chunks: 2 }));
        assert_eq!(indexer.store().get_stats().unwrap().chunk_count, 2);
    }

    #[test]
    fn test_path_locks_are_released() {
        let indexer = Arc::new(indexer());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let indexer = indexer.clone();
                std::thread::spawn(move || {
                    let body = format!("def handler_{i}(request):\n    return respond(request, {i})\n");
                    indexer
                        .index_source("app/shared.py", body.as_bytes(), Utc::now(), false)
                        .unwrap();
                    indexer.remove_path(&format!("app/other_{i}.py")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(indexer.path_locks.lock().unwrap().is_empty());
        assert_eq!(indexer.store().file_chunks("app/shared.py").unwrap().len(), 1);
    }

    #[test]
    fn test_on_file_saved_invalidates_cache() {
        let dir = project();
        let cache = Arc::new(LookupCache::new(Duration::from_secs(60)));
        let indexer = indexer().with_cache(cache.clone());
        indexer
            .index_directory(dir.path(), false, &CancellationToken::new())
            .unwrap();

        let ranker = crate::ranker::Ranker::new(Some(indexer.store().clone()), &Config::default())
            .with_cache(cache.clone());
        ranker.build_context("login", &Default::default());
        assert!(!cache.is_empty());

        let auth = dir.path().join("app/auth.py");
        fs::write(&auth, format!("{AUTH_PY}# saved\n")).unwrap();
        let outcome = indexer.on_file_saved(dir.path(), &auth).unwrap();
        assert!(outcome.is_indexed());
        assert!(cache.is_empty());
        assert_eq!(cache.invalidate_tag(TAG_PROJECT), 0);

        fs::remove_file(&auth).unwrap();
        assert_eq!(indexer.on_file_saved(dir.path(), &auth).unwrap(), FileOutcome::Removed);
        assert!(indexer.store().get_file("app/auth.py").unwrap().is_none());
    }

    #[test]
    fn test_relative_to() {
        let root = Path::new("/work/project");
        assert_eq!(
            relative_to(root, Path::new("/work/project/src/a.rs")).as_deref(),
            Some("src/a.rs")
        );
        assert_eq!(relative_to(root, Path::new("/elsewhere/a.rs")), None);
        assert_eq!(relative_to(root, root), None);
    }
}
