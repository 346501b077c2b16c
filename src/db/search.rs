use super::{Result, Store, models::*};
use crate::indexer::chunker::{Chunk, ChunkKind};
use crate::indexer::languages::Language;
use rusqlite::types::{Type, Value};
use rusqlite::{Row, params, params_from_iter};
use tracing::warn;

/// Column weights for `bm25()`: name, signature, docstring, body.
pub const BM25_WEIGHTS: [f64; 4] = [10.0, 5.0, 3.0, 1.0];

pub(super) const CHUNK_SELECT: &str = r#"
    SELECT c.id, f.path, f.language, c.kind, c.name, c.signature, c.start_line,
           c.end_line, c.content, c.docstring, c.scope_path, c.calls, c.types
    FROM chunks c
    JOIN files f ON f.id = c.file_id
"#;

const TYPE_KINDS_SQL: &str = "('class', 'interface', 'struct', 'enum', 'type')";

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(super) fn map_chunk_row(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let language: String = row.get(2)?;
    let kind: String = row.get(3)?;
    Ok(ChunkRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        language: Language::from_name(&language),
        chunk: Chunk {
            kind: ChunkKind::parse(&kind).unwrap_or(ChunkKind::Block),
            name: row.get(4)?,
            signature: row.get(5)?,
            start_line: row.get::<_, i64>(6)? as usize,
            end_line: row.get::<_, i64>(7)? as usize,
            content: row.get(8)?,
            docstring: row.get(9)?,
            scope_path: row.get(10)?,
            calls: json_list(row, 11)?,
            types: json_list(row, 12)?,
        },
    })
}

/// FTS5 MATCH expression: every term quoted and prefix-matched, OR-combined.
/// Returns `None` when nothing searchable is left.
pub fn fts_match_expression(terms: &[String]) -> Option<String> {
    let parts: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.replace('"', "\"\"")))
        .collect();
    (!parts.is_empty()).then(|| parts.join(" OR "))
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

impl Store {
    /// BM25 search over name, signature, docstring and body. Scores are
    /// positive, higher is better. An empty term list returns nothing.
    pub fn search_bm25(&self, terms: &[String], limit: usize) -> Result<Vec<ScoredChunk>> {
        let Some(expression) = fts_match_expression(terms) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        match self.search_fts(&expression, limit) {
            Ok(results) => Ok(results),
            Err(e) => {
                warn!("FTS query {expression:?} failed ({e}), falling back to LIKE search");
                self.search_like(terms, limit)
            }
        }
    }

    fn search_fts(&self, expression: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let [w_name, w_sig, w_doc, w_body] = BM25_WEIGHTS;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT c.id, f.path, f.language, c.kind, c.name, c.signature, c.start_line,
                   c.end_line, c.content, c.docstring, c.scope_path, c.calls, c.types,
                   bm25(chunks_fts, {w_name:.1}, {w_sig:.1}, {w_doc:.1}, {w_body:.1}) AS rank
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.rowid
            JOIN files f ON f.id = c.file_id
            WHERE chunks_fts MATCH ?
            ORDER BY rank, c.id
            LIMIT ?
            "#
        ))?;
        let rows = stmt.query_map(params![expression, limit as i64], |row| {
            let rank: f64 = row.get(13)?;
            Ok(ScoredChunk {
                record: map_chunk_row(row)?,
                score: -rank,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Token-filtered substring search used when FTS rejects a query. Scores
    /// reuse the column weights: a term hit in the name counts 10, and so on.
    fn search_like(&self, terms: &[String], limit: usize) -> Result<Vec<ScoredChunk>> {
        let terms: Vec<&str> = terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let [w_name, w_sig, w_doc, w_body] = BM25_WEIGHTS;
        let mut score_parts = Vec::new();
        let mut where_parts = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        for term in &terms {
            let pattern = Value::Text(like_pattern(term));
            score_parts.push(format!(
                "(CASE WHEN c.name LIKE ? ESCAPE '\\' THEN {w_name:.1} ELSE 0 END \
                 + CASE WHEN c.signature LIKE ? ESCAPE '\\' THEN {w_sig:.1} ELSE 0 END \
                 + CASE WHEN ifnull(c.docstring, '') LIKE ? ESCAPE '\\' THEN {w_doc:.1} ELSE 0 END \
                 + CASE WHEN c.content LIKE ? ESCAPE '\\' THEN {w_body:.1} ELSE 0 END)"
            ));
            for _ in 0..4 {
                params.push(pattern.clone());
            }
        }
        for term in &terms {
            where_parts.push("c.content LIKE ? ESCAPE '\\' OR c.signature LIKE ? ESCAPE '\\'");
            params.push(Value::Text(like_pattern(term)));
            params.push(Value::Text(like_pattern(term)));
        }
        params.push(Value::Integer(limit as i64));

        let sql = format!(
            r#"
            SELECT c.id, f.path, f.language, c.kind, c.name, c.signature, c.start_line,
                   c.end_line, c.content, c.docstring, c.scope_path, c.calls, c.types,
                   ({}) AS score
            FROM chunks c
            JOIN files f ON f.id = c.file_id
            WHERE {}
            ORDER BY score DESC, c.id
            LIMIT ?
            "#,
            score_parts.join(" + "),
            where_parts.join(" OR ")
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            let score: f64 = row.get(13)?;
            Ok(ScoredChunk {
                record: map_chunk_row(row)?,
                score,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Chunks named exactly `name`. Case-insensitive, exact-case hits first.
    pub fn search_by_name(&self, name: &str) -> Result<Vec<ChunkRecord>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{CHUNK_SELECT} WHERE c.name = ?1 COLLATE NOCASE ORDER BY (c.name = ?1) DESC, c.id"
        ))?;
        let rows = stmt.query_map(params![name], map_chunk_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Class, interface, struct, enum and type-alias chunks with one of `names`.
    pub fn find_type_definitions(&self, names: &[String]) -> Result<Vec<ChunkRecord>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{CHUNK_SELECT} WHERE c.name IN ({placeholders}) AND c.kind IN {TYPE_KINDS_SQL} ORDER BY c.id"
        ))?;
        let rows = stmt.query_map(params_from_iter(names.iter()), map_chunk_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
