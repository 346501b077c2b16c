//! Structural chunking with Tree-sitter.
//!
//! A depth-first walk over the syntax tree turns every boundary node
//! (function, method, class, interface, type, struct, enum) into a [`Chunk`].
//! Nested boundaries are kept and linked through `scope_path`. Top-level code
//! outside every boundary (imports, constants, statements) becomes `module`
//! chunks. Files without a grammar, files that fail to parse, and files with
//! no boundary node fall back to [`block::chunk_blocks`].

use super::block;
use super::languages::{Language, LanguageSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;
use tree_sitter::{Node, Parser, Tree};

pub const DEFAULT_MIN_CHUNK_CHARS: usize = 20;
pub const DEFAULT_BLOCK_CHUNK_CHARS: usize = 2000;
const MAX_DOC_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    Method,
    Class,
    Interface,
    Struct,
    Enum,
    Type,
    Impl,
    Module,
    Block,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Method => "method",
            ChunkKind::Class => "class",
            ChunkKind::Interface => "interface",
            ChunkKind::Struct => "struct",
            ChunkKind::Enum => "enum",
            ChunkKind::Type => "type",
            ChunkKind::Impl => "impl",
            ChunkKind::Module => "module",
            ChunkKind::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "function" => ChunkKind::Function,
            "method" => ChunkKind::Method,
            "class" => ChunkKind::Class,
            "interface" => ChunkKind::Interface,
            "struct" => ChunkKind::Struct,
            "enum" => ChunkKind::Enum,
            "type" => ChunkKind::Type,
            "impl" => ChunkKind::Impl,
            "module" => ChunkKind::Module,
            "block" => ChunkKind::Block,
            _ => return None,
        })
    }

    /// Structural priority used to break ranking ties (higher wins).
    pub fn type_priority(&self) -> u8 {
        match self {
            ChunkKind::Function
            | ChunkKind::Method
            | ChunkKind::Class
            | ChunkKind::Struct
            | ChunkKind::Interface => 3,
            ChunkKind::Enum | ChunkKind::Type | ChunkKind::Impl => 2,
            ChunkKind::Block => 1,
            ChunkKind::Module => 0,
        }
    }

    pub fn is_function_like(&self) -> bool {
        matches!(self, ChunkKind::Function | ChunkKind::Method)
    }

    pub fn is_type_like(&self) -> bool {
        matches!(
            self,
            ChunkKind::Class
                | ChunkKind::Interface
                | ChunkKind::Struct
                | ChunkKind::Enum
                | ChunkKind::Type
        )
    }

    fn is_container(&self) -> bool {
        matches!(
            self,
            ChunkKind::Class | ChunkKind::Impl | ChunkKind::Interface | ChunkKind::Struct
        )
    }
}

/// A semantically bounded range of one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub signature: String,
    /// 1-indexed, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub docstring: Option<String>,
    pub scope_path: String,
    pub calls: Vec<String>,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerOptions {
    /// Boundary nodes with this many non-whitespace characters or fewer are skipped.
    pub min_chunk_chars: usize,
    /// Non-whitespace character budget of one fallback block.
    pub block_chunk_chars: usize,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            min_chunk_chars: DEFAULT_MIN_CHUNK_CHARS,
            block_chunk_chars: DEFAULT_BLOCK_CHUNK_CHARS,
        }
    }
}

/// Extract chunks with default options. Never fails.
pub fn extract_chunks(path: &str, content: &[u8], language: Language) -> Vec<Chunk> {
    extract_chunks_with(path, content, language, &ChunkerOptions::default())
}

pub fn extract_chunks_with(
    path: &str,
    content: &[u8],
    language: Language,
    opts: &ChunkerOptions,
) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }

    let Some(text) = decode_source(content) else {
        debug!("{path}: binary or non UTF-8 content, using block chunking");
        let lossy = String::from_utf8_lossy(content);
        return block::chunk_blocks(&lossy, opts.block_chunk_chars);
    };

    let Some(spec) = language.spec() else {
        return block::chunk_blocks(text, opts.block_chunk_chars);
    };

    let Some(tree) = parse_source(text, language) else {
        debug!("{path}: {} parser failed, using block chunking", spec.name);
        return block::chunk_blocks(text, opts.block_chunk_chars);
    };

    let mut walker = ChunkWalker {
        spec,
        source: text,
        lines: text.split('\n').collect(),
        min_chunk_chars: opts.min_chunk_chars,
        scope: Vec::new(),
        chunks: Vec::new(),
    };
    walker.walk(tree.root_node());

    if walker.chunks.is_empty() {
        debug!("{path}: no boundary nodes, using block chunking");
        return block::chunk_blocks(text, opts.block_chunk_chars);
    }

    let ChunkWalker { lines, mut chunks, .. } = walker;
    let module = module_chunks(&lines, &chunks, spec, opts);
    chunks.extend(module);
    chunks.sort_by_key(|c| c.start_line);
    chunks
}

/// Runs of lines outside every chunk, trimmed of blank edges. Comments and
/// attributes directly above a chunk stay with it. Runs at or below the
/// minimum size are dropped; long runs are split like blocks.
fn module_chunks(
    lines: &[&str],
    chunks: &[Chunk],
    spec: &LanguageSpec,
    opts: &ChunkerOptions,
) -> Vec<Chunk> {
    let mut covered = vec![false; lines.len()];
    for chunk in chunks {
        let first = chunk.start_line.saturating_sub(1);
        for row in first..chunk.end_line.min(lines.len()) {
            covered[row] = true;
        }
        let mut row = first;
        while row > 0 && !covered[row - 1] && is_attached_line(lines[row - 1], spec) {
            row -= 1;
            covered[row] = true;
        }
    }

    let mut out = Vec::new();
    let mut row = 0;
    while row < lines.len() {
        if covered[row] {
            row += 1;
            continue;
        }
        let mut first = row;
        while row < lines.len() && !covered[row] {
            row += 1;
        }
        let mut last = row - 1;
        while first <= last && lines[first].trim().is_empty() {
            first += 1;
        }
        if first > last {
            continue;
        }
        while last > first && lines[last].trim().is_empty() {
            last -= 1;
        }

        let text = lines[first..=last].join("\n");
        if non_whitespace_len(&text) <= opts.min_chunk_chars {
            continue;
        }
        for mut chunk in block::chunk_blocks(&text, opts.block_chunk_chars) {
            chunk.kind = ChunkKind::Module;
            chunk.start_line += first;
            chunk.end_line += first;
            out.push(chunk);
        }
    }
    out
}

fn is_attached_line(line: &str, spec: &LanguageSpec) -> bool {
    let line = line.trim_start();
    !line.is_empty() && (spec.is_comment_line(line) || line.starts_with("#[") || line.starts_with('@'))
}

/// Valid UTF-8 without NUL bytes, otherwise `None`.
pub(crate) fn decode_source(content: &[u8]) -> Option<&str> {
    std::str::from_utf8(content)
        .ok()
        .filter(|text| !text.contains('\0'))
}

pub(crate) fn parse_source(text: &str, language: Language) -> Option<Tree> {
    let grammar = language.grammar()?;
    let mut parser = Parser::new();
    parser.set_language(&grammar).ok()?;
    parser.parse(text, None)
}

pub(crate) fn non_whitespace_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

struct ScopeEntry {
    name: Option<String>,
    kind: ChunkKind,
}

struct ChunkWalker<'a> {
    spec: &'static LanguageSpec,
    source: &'a str,
    lines: Vec<&'a str>,
    min_chunk_chars: usize,
    scope: Vec<ScopeEntry>,
    chunks: Vec<Chunk>,
}

impl ChunkWalker<'_> {
    fn walk(&mut self, node: Node<'_>) {
        let mut pushed = false;

        if let Some(kind) = self.spec.boundary_kind(node.kind()) {
            let span = span_node(node);
            let text = &self.source[span.byte_range()];
            if non_whitespace_len(text) > self.min_chunk_chars {
                let chunk = self.build_chunk(node, span, kind, text);
                self.scope.push(ScopeEntry {
                    name: chunk.name.clone(),
                    kind: chunk.kind,
                });
                self.chunks.push(chunk);
                pushed = true;
            }
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            self.walk(child);
        }

        if pushed {
            self.scope.pop();
        }
    }

    fn build_chunk(&self, node: Node<'_>, span: Node<'_>, kind: ChunkKind, text: &str) -> Chunk {
        let source = self.source.as_bytes();
        let name = extract_name(node, source);
        let kind = self.refine_kind(node, kind);
        let (start_line, end_line) = line_range(span);

        let scope_path = self
            .scope
            .iter()
            .filter_map(|s| s.name.as_deref())
            .collect::<Vec<_>>()
            .join(".");

        let docstring = python_docstring(node, source)
            .or_else(|| leading_comment(&self.lines, span.start_position().row, self.spec));

        let mut types = collect_types(node, source, self.spec);
        if let Some(own) = name.as_deref() {
            types.retain(|t| t != own);
        }

        Chunk {
            kind,
            signature: extract_signature(text, self.spec.language),
            name,
            start_line,
            end_line,
            content: text.to_string(),
            docstring,
            scope_path,
            calls: collect_calls(node, source, self.spec),
            types,
        }
    }

    fn refine_kind(&self, node: Node<'_>, kind: ChunkKind) -> ChunkKind {
        if kind == ChunkKind::Function
            && self.scope.last().is_some_and(|s| s.kind.is_container())
        {
            return ChunkKind::Method;
        }
        if node.kind() == "type_declaration" {
            let mut cursor = node.walk();
            for spec in node.named_children(&mut cursor) {
                match spec.child_by_field_name("type").map(|t| t.kind()) {
                    Some("struct_type") => return ChunkKind::Struct,
                    Some("interface_type") => return ChunkKind::Interface,
                    _ => {}
                }
            }
        }
        kind
    }
}

/// The node whose source range a chunk covers. Decorators and the
/// declaration around an anonymous function belong to the chunk.
pub(crate) fn span_node(node: Node<'_>) -> Node<'_> {
    let Some(parent) = node.parent() else {
        return node;
    };
    match (node.kind(), parent.kind()) {
        (_, "decorated_definition") => parent,
        ("arrow_function" | "function_expression" | "function", "variable_declarator") => parent
            .parent()
            .filter(|g| matches!(g.kind(), "lexical_declaration" | "variable_declaration"))
            .filter(|g| g.named_child_count() == 1)
            .unwrap_or(parent),
        ("arrow_function" | "function_expression" | "function", "assignment_expression") => {
            parent
                .parent()
                .filter(|g| g.kind() == "expression_statement")
                .unwrap_or(parent)
        }
        _ => node,
    }
}

/// 1-indexed inclusive line range of a node.
pub(crate) fn line_range(node: Node<'_>) -> (usize, usize) {
    let start = node.start_position();
    let end = node.end_position();
    let mut end_row = end.row;
    if end.column == 0 && end_row > start.row {
        end_row -= 1;
    }
    (start.row + 1, end_row + 1)
}

fn node_text(node: Node<'_>, source: &[u8]) -> Option<String> {
    node.utf8_text(source)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn field_text(node: Node<'_>, field: &str, source: &[u8]) -> Option<String> {
    node.child_by_field_name(field)
        .and_then(|n| node_text(n, source))
}

pub(crate) fn extract_name(node: Node<'_>, source: &[u8]) -> Option<String> {
    match node.kind() {
        "impl_item" => field_text(node, "type", source),
        "type_declaration" => {
            let mut cursor = node.walk();
            let found = node
                .named_children(&mut cursor)
                .find_map(|spec| field_text(spec, "name", source));
            found
        }
        "arrow_function" => assignment_target(node, source),
        "function_expression" | "function" => {
            field_text(node, "name", source).or_else(|| assignment_target(node, source))
        }
        _ => field_text(node, "name", source),
    }
}

/// Name of an anonymous function taken from what it is assigned to:
/// `const f = () => {}`, `obj.foo = function() {}`, `{ foo: () => {} }`.
fn assignment_target(node: Node<'_>, source: &[u8]) -> Option<String> {
    let parent = node.parent()?;
    match parent.kind() {
        "variable_declarator" => field_text(parent, "name", source),
        "assignment_expression" => {
            let left = parent.child_by_field_name("left")?;
            match left.kind() {
                "member_expression" => field_text(left, "property", source),
                _ => node_text(left, source),
            }
        }
        "pair" => field_text(parent, "key", source)
            .map(|k| k.trim_matches(|c| c == '"' || c == '\'').to_string()),
        "public_field_definition" | "field_definition" => field_text(parent, "name", source)
            .or_else(|| field_text(parent, "property", source)),
        _ => None,
    }
}

/// First source line, cut at `{`, a trailing `:`, or the end of the line.
pub(crate) fn extract_signature(content: &str, language: Language) -> String {
    let first = content.lines().next().unwrap_or("").trim();
    let cut = if language == Language::Python {
        first
            .strip_suffix(':')
            .or_else(|| first.find('{').map(|idx| &first[..idx]))
            .unwrap_or(first)
    } else if let Some(idx) = first.find('{') {
        &first[..idx]
    } else {
        first.strip_suffix(':').unwrap_or(first)
    };
    cut.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Python docstring: the string literal opening a function or class body.
fn python_docstring(node: Node<'_>, source: &[u8]) -> Option<String> {
    if !matches!(node.kind(), "function_definition" | "class_definition") {
        return None;
    }
    let body = node.child_by_field_name("body")?;
    let mut cursor = body.walk();
    let first = body.named_children(&mut cursor).next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let mut inner = first.walk();
    let string = first.named_children(&mut inner).next()?;
    if string.kind() != "string" {
        return None;
    }
    let raw = string.utf8_text(source).ok()?;
    let doc = raw
        .trim_start_matches(['r', 'R', 'u', 'U', 'b', 'B'])
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    (!doc.is_empty()).then(|| doc.to_string())
}

/// Comment block directly above `start_row`, at most [`MAX_DOC_LINES`] lines.
/// Attribute and decorator lines are stepped over.
fn leading_comment(lines: &[&str], start_row: usize, spec: &LanguageSpec) -> Option<String> {
    let mut doc = Vec::new();
    let mut row = start_row.min(lines.len());
    let mut scanned = 0;

    while row > 0 && scanned < MAX_DOC_LINES {
        row -= 1;
        scanned += 1;
        let line = lines[row].trim();
        if line.starts_with("#[") || line.starts_with('@') {
            continue;
        }
        if spec.is_comment_line(line) {
            doc.push(strip_comment_marker(line));
        } else {
            break;
        }
    }

    doc.reverse();
    let doc: Vec<&str> = doc.into_iter().filter(|l| !l.is_empty()).collect();
    (!doc.is_empty()).then(|| doc.join("\n"))
}

fn strip_comment_marker(line: &str) -> &str {
    line.trim_start_matches("///")
        .trim_start_matches("//!")
        .trim_start_matches("//")
        .trim_start_matches("/**")
        .trim_start_matches("/*")
        .trim_end_matches("*/")
        .trim_start_matches('*')
        .trim_start_matches('#')
        .trim()
}

/// Name of every call in the subtree, deduplicated in discovery order.
pub(crate) fn collect_calls(node: Node<'_>, source: &[u8], spec: &LanguageSpec) -> Vec<String> {
    let mut calls = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![node];

    while let Some(current) = stack.pop() {
        if spec.call_kinds.contains(&current.kind()) {
            let callee = current
                .child_by_field_name("function")
                .or_else(|| current.child_by_field_name("constructor"));
            if let Some(name) = callee.and_then(|c| callee_name(c, source)) {
                if !spec.is_builtin_call(&name) && seen.insert(name.clone()) {
                    calls.push(name);
                }
            }
        }
        let mut cursor = current.walk();
        let children: Vec<Node<'_>> = current.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }

    calls
}

/// Last path component of a callee: `a.b.c()` and `a::b::c()` both yield `c`.
fn callee_name(node: Node<'_>, source: &[u8]) -> Option<String> {
    match node.kind() {
        "identifier" | "field_identifier" | "property_identifier" | "type_identifier" => {
            node_text(node, source)
        }
        "member_expression" => field_text(node, "property", source),
        "attribute" => field_text(node, "attribute", source),
        "selector_expression" | "field_expression" => field_text(node, "field", source),
        "scoped_identifier" => field_text(node, "name", source),
        "generic_function" => node
            .child_by_field_name("function")
            .and_then(|f| callee_name(f, source)),
        _ => None,
    }
}

/// Referenced type names in the subtree, primitives and one-letter generics removed.
pub(crate) fn collect_types(node: Node<'_>, source: &[u8], spec: &LanguageSpec) -> Vec<String> {
    let mut types = Vec::new();
    if spec.type_kinds.is_empty() {
        return types;
    }
    let mut seen = HashSet::new();
    let mut stack = vec![node];

    let mut push = |name: String, types: &mut Vec<String>| {
        if name.chars().count() > 1 && !spec.is_primitive(&name) && seen.insert(name.clone()) {
            types.push(name);
        }
    };

    while let Some(current) = stack.pop() {
        let kind = current.kind();
        if spec.type_kinds.contains(&kind) {
            if kind == "type" {
                // Python annotations hold plain identifiers.
                let mut inner = vec![current];
                while let Some(n) = inner.pop() {
                    if n.kind() == "identifier" {
                        if let Some(name) = node_text(n, source) {
                            push(name, &mut types);
                        }
                    }
                    let mut cursor = n.walk();
                    inner.extend(n.named_children(&mut cursor));
                }
                continue;
            }
            if let Some(name) = node_text(current, source) {
                push(name, &mut types);
            }
        }
        let mut cursor = current.walk();
        let children: Vec<Node<'_>> = current.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }

    types
}
