use super::search::{CHUNK_SELECT, map_chunk_row};
use super::{Result, Store, StoreError, models::ChunkRecord};
use rusqlite::{Connection, params};

pub(super) fn insert_call_tx(conn: &Connection, caller_id: i64, callee_name: &str) -> Result<()> {
    let callee_name = callee_name.trim();
    if callee_name.is_empty() {
        return Err(StoreError::InvalidArgument("callee name is empty".into()));
    }
    conn.execute(
        "INSERT OR IGNORE INTO call_edges (caller_chunk_id, callee_name) VALUES (?, ?)",
        params![caller_id, callee_name],
    )?;
    Ok(())
}

pub(super) fn insert_import_tx(conn: &Connection, file_id: i64, module: &str) -> Result<()> {
    let module = module.trim();
    if module.is_empty() {
        return Err(StoreError::InvalidArgument("import module is empty".into()));
    }
    conn.execute(
        "INSERT OR IGNORE INTO imports (file_id, module) VALUES (?, ?)",
        params![file_id, module],
    )?;
    Ok(())
}

impl Store {
    /// Record that a chunk calls `callee_name`. The callee is resolved by name
    /// at query time and does not need to exist yet.
    pub fn insert_call(&self, caller_id: i64, callee_name: &str) -> Result<()> {
        self.write(|tx| insert_call_tx(tx, caller_id, callee_name))
    }

    pub fn insert_import(&self, file_id: i64, module: &str) -> Result<()> {
        self.write(|tx| insert_import_tx(tx, file_id, module))
    }

    /// Chunks holding a call edge to `name`.
    pub fn get_callers(&self, name: &str) -> Result<Vec<ChunkRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            {CHUNK_SELECT}
            WHERE c.id IN (SELECT caller_chunk_id FROM call_edges WHERE callee_name = ?)
            ORDER BY c.id
            "#
        ))?;
        let rows = stmt.query_map(params![name], map_chunk_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Chunks whose name matches a callee of `chunk_id`. Unresolved callee
    /// names are skipped, recursion is not reported.
    pub fn get_callees(&self, chunk_id: i64) -> Result<Vec<ChunkRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            {CHUNK_SELECT}
            JOIN call_edges e ON e.callee_name = c.name
            WHERE e.caller_chunk_id = ?1 AND c.id != ?1 AND c.kind != 'block'
            ORDER BY e.id, c.id
            "#
        ))?;
        let rows = stmt.query_map(params![chunk_id], map_chunk_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Raw callee names recorded for a chunk.
    pub fn callee_names(&self, chunk_id: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT callee_name FROM call_edges WHERE caller_chunk_id = ? ORDER BY id")?;
        let rows = stmt.query_map(params![chunk_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// Modules imported by one file.
    pub fn file_imports(&self, path: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT i.module FROM imports i
            JOIN files f ON f.id = i.file_id
            WHERE f.path = ?
            ORDER BY i.id
            "#,
        )?;
        let rows = stmt.query_map(params![path], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SourceFile;
    use crate::indexer::chunker::{Chunk, ChunkKind};
    use crate::indexer::languages::Language;
    use chrono::Utc;

    fn func(name: &str, line: usize, calls: &[&str]) -> Chunk {
        Chunk {
            kind: ChunkKind::Function,
            name: Some(name.to_string()),
            signature: format!("def {name}()"),
            start_line: line,
            end_line: line,
            content: format!("def {name}(): pass"),
            docstring: None,
            scope_path: String::new(),
            calls: calls.iter().map(|c| c.to_string()).collect(),
            types: Vec::new(),
        }
    }

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        let content = "1\n2\n3\n4\n";
        let file = SourceFile::from_content("auth.py", content.as_bytes(), Language::Python, Utc::now());
        store
            .index_file(
                &file,
                &[
                    func("login", 1, &["validate_user", "hash_password", "missing"]),
                    func("validate_user", 2, &["hash_password"]),
                    func("hash_password", 3, &[]),
                    func("recurse", 4, &["recurse"]),
                ],
                &["hashlib".to_string(), "app.models".to_string()],
            )
            .unwrap();
        store
    }

    fn names(records: &[ChunkRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| r.chunk.name.clone())
            .collect()
    }

    #[test]
    fn test_get_callers() {
        let store = seeded_store();
        let callers = store.get_callers("hash_password").unwrap();
        assert_eq!(names(&callers), vec!["login", "validate_user"]);
        assert!(store.get_callers("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_get_callees_skips_unresolved_and_self() {
        let store = seeded_store();
        let login = store.search_by_name("login").unwrap().remove(0);
        let callees = store.get_callees(login.id).unwrap();
        assert_eq!(names(&callees), vec!["validate_user", "hash_password"]);
        assert_eq!(
            store.callee_names(login.id).unwrap(),
            vec!["validate_user", "hash_password", "missing"]
        );

        let recurse = store.search_by_name("recurse").unwrap().remove(0);
        assert!(store.get_callees(recurse.id).unwrap().is_empty());
    }

    #[test]
    fn test_insert_call_is_idempotent() {
        let store = seeded_store();
        let chunk = store.search_by_name("hash_password").unwrap().remove(0);
        store.insert_call(chunk.id, "sha256").unwrap();
        store.insert_call(chunk.id, "sha256").unwrap();
        assert_eq!(store.callee_names(chunk.id).unwrap(), vec!["sha256"]);
        assert!(matches!(
            store.insert_call(chunk.id, "  "),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_imports() {
        let store = seeded_store();
        assert_eq!(
            store.file_imports("auth.py").unwrap(),
            vec!["hashlib", "app.models"]
        );
        assert_eq!(store.get_stats().unwrap().import_count, 2);
    }
}
