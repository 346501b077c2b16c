use super::search::{CHUNK_SELECT, map_chunk_row};
use super::{Result, Store, StoreError, models::*};
use crate::indexer::chunker::Chunk;
use crate::indexer::languages::Language;
use crate::query::preprocess::split_identifier;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashMap;
use tracing::debug;

fn validate_source_file(file: &SourceFile) -> Result<()> {
    if file.path.trim().is_empty() {
        return Err(StoreError::InvalidArgument("file path is empty".into()));
    }
    if file.content_hash.is_empty() {
        return Err(StoreError::InvalidArgument(format!(
            "{}: content hash is empty",
            file.path
        )));
    }
    Ok(())
}

pub(super) fn validate_chunk(chunk: &Chunk, line_count: usize) -> Result<()> {
    if chunk.start_line == 0 {
        return Err(StoreError::InvalidArgument(
            "start_line is 1-indexed, got 0".into(),
        ));
    }
    if chunk.end_line < chunk.start_line {
        return Err(StoreError::InvalidArgument(format!(
            "end_line {} precedes start_line {}",
            chunk.end_line, chunk.start_line
        )));
    }
    if chunk.end_line > line_count {
        return Err(StoreError::InvalidArgument(format!(
            "end_line {} beyond file length {line_count}",
            chunk.end_line
        )));
    }
    Ok(())
}

/// Text of the FTS `name` column: the name plus its identifier words, so
/// `getUserById` matches `user`.
fn fts_name(name: Option<&str>) -> String {
    let Some(name) = name else {
        return String::new();
    };
    let words = split_identifier(name);
    if words.len() <= 1 {
        return name.to_string();
    }
    format!("{name} {}", words.join(" "))
}

fn map_file_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let language: String = row.get(3)?;
    Ok(FileRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        content_hash: row.get(2)?,
        language: Language::from_name(&language),
        line_count: row.get::<_, i64>(4)? as usize,
        modified_at: row.get(5)?,
    })
}

/// Remove everything derived from a file's content, keeping the file row.
fn clear_file_contents(conn: &Connection, file_id: i64) -> Result<()> {
    // FTS rows are not covered by the foreign key cascade.
    conn.execute(
        "DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?)",
        params![file_id],
    )?;
    conn.execute("DELETE FROM chunks WHERE file_id = ?", params![file_id])?;
    conn.execute("DELETE FROM imports WHERE file_id = ?", params![file_id])?;
    Ok(())
}

/// With `force`, an unchanged hash is rewritten like a changed one.
fn upsert_file_tx(conn: &Connection, file: &SourceFile, force: bool) -> Result<Upsert> {
    validate_source_file(file)?;

    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, content_hash FROM files WHERE path = ?",
            params![file.path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        Some((id, hash)) if hash == file.content_hash && !force => {
            conn.execute(
                "UPDATE files SET modified_at = ? WHERE id = ?",
                params![file.modified_at, id],
            )?;
            Ok(Upsert::Unchanged(id))
        }
        Some((id, _)) => {
            clear_file_contents(conn, id)?;
            conn.execute(
                r#"
                UPDATE files SET content_hash = ?, language = ?, line_count = ?,
                    modified_at = ?, indexed_at = CURRENT_TIMESTAMP
                WHERE id = ?
                "#,
                params![
                    file.content_hash,
                    file.language.as_str(),
                    file.line_count as i64,
                    file.modified_at,
                    id
                ],
            )?;
            Ok(Upsert::Replaced(id))
        }
        None => {
            conn.execute(
                r#"
                INSERT INTO files (path, content_hash, language, line_count, modified_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
                params![
                    file.path,
                    file.content_hash,
                    file.language.as_str(),
                    file.line_count as i64,
                    file.modified_at
                ],
            )?;
            Ok(Upsert::Inserted(conn.last_insert_rowid()))
        }
    }
}

fn file_line_count(conn: &Connection, file_id: i64) -> Result<usize> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT line_count FROM files WHERE id = ?",
            params![file_id],
            |row| row.get(0),
        )
        .optional()?;
    count
        .map(|c| c as usize)
        .ok_or_else(|| StoreError::InvalidArgument(format!("unknown file id {file_id}")))
}

pub(super) fn insert_chunk_tx(
    conn: &Connection,
    file_id: i64,
    line_count: usize,
    chunk: &Chunk,
) -> Result<i64> {
    validate_chunk(chunk, line_count)?;

    conn.execute(
        r#"
        INSERT INTO chunks (file_id, kind, name, signature, start_line, end_line,
                            content, docstring, scope_path, calls, types)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            file_id,
            chunk.kind.as_str(),
            chunk.name,
            chunk.signature,
            chunk.start_line as i64,
            chunk.end_line as i64,
            chunk.content,
            chunk.docstring,
            chunk.scope_path,
            serde_json::to_string(&chunk.calls)?,
            serde_json::to_string(&chunk.types)?,
        ],
    )?;
    let chunk_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO chunks_fts (rowid, name, signature, docstring, body) VALUES (?, ?, ?, ?, ?)",
        params![
            chunk_id,
            fts_name(chunk.name.as_deref()),
            chunk.signature,
            chunk.docstring.as_deref().unwrap_or(""),
            chunk.content,
        ],
    )?;

    Ok(chunk_id)
}

impl Store {
    /// Insert or refresh a file row. An unchanged content hash is a no-op for
    /// the file's chunks; a changed hash drops its chunks, call edges and
    /// imports so the caller can insert fresh ones.
    pub fn upsert_file(&self, file: &SourceFile) -> Result<Upsert> {
        self.write(|tx| upsert_file_tx(tx, file, false))
    }

    /// Insert one chunk of an already upserted file.
    pub fn insert_chunk(&self, file_id: i64, chunk: &Chunk) -> Result<i64> {
        self.write(|tx| {
            let line_count = file_line_count(tx, file_id)?;
            insert_chunk_tx(tx, file_id, line_count, chunk)
        })
    }

    /// Replace everything stored for one file in a single transaction: the file
    /// row, its chunks and their FTS rows, call edges from each chunk's `calls`,
    /// and imports. Chunks are validated before anything is written.
    pub fn index_file(
        &self,
        file: &SourceFile,
        chunks: &[Chunk],
        imports: &[String],
    ) -> Result<Upsert> {
        self.write_file(file, chunks, imports, false)
    }

    /// Like [`index_file`](Self::index_file) but rewrites the file even when
    /// its content hash is unchanged.
    pub fn reindex_file(
        &self,
        file: &SourceFile,
        chunks: &[Chunk],
        imports: &[String],
    ) -> Result<Upsert> {
        self.write_file(file, chunks, imports, true)
    }

    fn write_file(
        &self,
        file: &SourceFile,
        chunks: &[Chunk],
        imports: &[String],
        force: bool,
    ) -> Result<Upsert> {
        validate_source_file(file)?;
        for chunk in chunks {
            validate_chunk(chunk, file.line_count)?;
        }

        let outcome = self.write(|tx| {
            let outcome = upsert_file_tx(tx, file, force)?;
            if outcome.is_unchanged() {
                return Ok(outcome);
            }
            let file_id = outcome.id();
            for chunk in chunks {
                let chunk_id = insert_chunk_tx(tx, file_id, file.line_count, chunk)?;
                for callee in &chunk.calls {
                    super::relations::insert_call_tx(tx, chunk_id, callee)?;
                }
            }
            for module in imports {
                super::relations::insert_import_tx(tx, file_id, module)?;
            }
            Ok(outcome)
        })?;

        debug!(
            "{}: {:?}, {} chunks, {} imports",
            file.path,
            outcome,
            chunks.len(),
            imports.len()
        );
        Ok(outcome)
    }

    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, path, content_hash, language, line_count, modified_at FROM files WHERE path = ?",
                params![path],
                map_file_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Every indexed file keyed by path.
    pub fn list_files(&self) -> Result<HashMap<String, FileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, path, content_hash, language, line_count, modified_at FROM files")?;
        let rows = stmt.query_map([], map_file_row)?;

        let mut files = HashMap::new();
        for row in rows {
            let record = row?;
            files.insert(record.path.clone(), record);
        }
        Ok(files)
    }

    /// Chunks of one file in source order.
    pub fn file_chunks(&self, path: &str) -> Result<Vec<ChunkRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{CHUNK_SELECT} WHERE f.path = ? ORDER BY c.start_line, c.id"
        ))?;
        let rows = stmt.query_map(params![path], map_chunk_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a file and everything derived from it.
    pub fn delete_file(&self, path: &str) -> Result<bool> {
        self.write(|tx| {
            let file_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM files WHERE path = ?",
                    params![path],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(file_id) = file_id else {
                return Ok(false);
            };
            clear_file_contents(tx, file_id)?;
            let rows = tx.execute("DELETE FROM files WHERE id = ?", params![file_id])?;
            Ok(rows > 0)
        })
    }

    pub fn get_stats(&self) -> Result<IndexStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> rusqlite::Result<usize> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|c| c as usize)
        };

        let mut stats = IndexStats {
            file_count: count("SELECT count(*) FROM files")?,
            chunk_count: count("SELECT count(*) FROM chunks")?,
            import_count: count("SELECT count(*) FROM imports")?,
            call_count: count("SELECT count(*) FROM call_edges")?,
            ..Default::default()
        };

        let mut stmt = conn.prepare("SELECT language, count(*) FROM files GROUP BY language")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (language, n) = row?;
            stats.languages.insert(language, n);
        }
        Ok(stats)
    }

    /// Drop the whole index.
    pub fn clear(&self) -> Result<()> {
        self.write(|tx| {
            tx.execute_batch(
                r#"
                DELETE FROM chunks_fts;
                DELETE FROM call_edges;
                DELETE FROM imports;
                DELETE FROM chunks;
                DELETE FROM files;
                "#,
            )?;
            Ok(())
        })
    }
}
