use super::chunker::{collect_calls, decode_source, extract_name, line_range, parse_source, span_node};
use super::languages::{Language, LanguageSpec};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::warn;
use tree_sitter::{Node, Query, QueryCursor, StreamingIterator};

/// One named function or method and the names it calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGraphEntry {
    pub name: String,
    pub calls: Vec<String>,
    pub start_line: usize,
    pub end_line: usize,
}

/// Walk function-like boundary nodes only. Anonymous functions are skipped
/// since nothing can refer to them by name.
pub fn extract_call_graph(content: &[u8], language: Language) -> Vec<CallGraphEntry> {
    let Some(spec) = language.spec() else {
        return Vec::new();
    };
    let Some(text) = decode_source(content) else {
        return Vec::new();
    };
    let Some(tree) = parse_source(text, language) else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        if spec.is_function_like(node.kind()) {
            if let Some(entry) = entry_for(node, text.as_bytes(), spec) {
                entries.push(entry);
            }
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    entries
}

fn entry_for(node: Node<'_>, source: &[u8], spec: &LanguageSpec) -> Option<CallGraphEntry> {
    let name = extract_name(node, source)?;
    let (start_line, end_line) = line_range(span_node(node));
    Some(CallGraphEntry {
        name,
        calls: collect_calls(node, source, spec),
        start_line,
        end_line,
    })
}

fn import_queries() -> &'static HashMap<Language, Query> {
    static QUERIES: OnceLock<HashMap<Language, Query>> = OnceLock::new();
    QUERIES.get_or_init(|| {
        let mut queries = HashMap::new();
        for language in [
            Language::Go,
            Language::Python,
            Language::TypeScript,
            Language::Tsx,
            Language::JavaScript,
            Language::Rust,
        ] {
            let (Some(spec), Some(grammar)) = (language.spec(), language.grammar()) else {
                continue;
            };
            match Query::new(&grammar, spec.import_query) {
                Ok(q) => {
                    queries.insert(language, q);
                }
                Err(e) => warn!("import query for {} failed to compile: {e}", spec.name),
            }
        }
        queries
    })
}

/// Imported module paths, quotes stripped, deduplicated in source order.
pub fn extract_imports(content: &[u8], language: Language) -> Vec<String> {
    let Some(query) = import_queries().get(&language) else {
        return Vec::new();
    };
    let Some(text) = decode_source(content) else {
        return Vec::new();
    };
    let Some(tree) = parse_source(text, language) else {
        return Vec::new();
    };

    let source = text.as_bytes();
    let mut cursor = QueryCursor::new();
    let mut imports = Vec::new();
    let mut seen = HashSet::new();

    let mut matches = cursor.matches(query, tree.root_node(), source);
    while let Some(m) = matches.next() {
        for cap in m.captures {
            let Ok(raw) = cap.node.utf8_text(source) else {
                continue;
            };
            let module = raw
                .trim()
                .trim_matches(|c| c == '"' || c == '\'' || c == '`')
                .to_string();
            if !module.is_empty() && seen.insert(module.clone()) {
                imports.push(module);
            }
        }
    }
    imports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_graph_for_python() {
        let source = br#"
def login(user, password):
    if validate_user(user):
        return check(hash_password(password))
    return False

def validate_user(user):
    return user.active

lambda_holder = lambda x: x
"#;
        let graph = extract_call_graph(source, Language::Python);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph[0].name, "login");
        assert_eq!(
            graph[0].calls,
            vec!["validate_user", "check", "hash_password"]
        );
        assert_eq!(graph[0].start_line, 2);
        assert_eq!(graph[0].end_line, 5);
        assert_eq!(graph[1].name, "validate_user");
        assert!(graph[1].calls.is_empty());
    }

    #[test]
    fn test_call_graph_includes_go_methods() {
        let source = br#"package svc

func (s *UserService) Create(u User) error {
	if err := s.repo.Save(u); err != nil {
		return err
	}
	s.mailer.SendWelcome(u.Email)
	return nil
}
"#;
        let graph = extract_call_graph(source, Language::Go);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph[0].name, "Create");
        assert_eq!(graph[0].calls, vec!["Save", "SendWelcome"]);
    }

    #[test]
    fn test_call_graph_unsupported_is_empty() {
        assert!(extract_call_graph(b"void main() {}", Language::Unsupported).is_empty());
    }

    #[test]
    fn test_extract_imports() {
        let go = br#"package main

import (
	"fmt"
	"github.com/acme/app/service"
)
"#;
        assert_eq!(
            extract_imports(go, Language::Go),
            vec!["fmt", "github.com/acme/app/service"]
        );

        let py = b"import os\nfrom app.services import auth\n";
        assert_eq!(extract_imports(py, Language::Python), vec!["os", "app.services"]);

        let ts = b"import { login } from './auth';\nimport React from \"react\";\n";
        assert_eq!(extract_imports(ts, Language::TypeScript), vec!["./auth", "react"]);

        let rs = b"use crate::db::Store;\nuse std::sync::Arc;\n";
        assert_eq!(
            extract_imports(rs, Language::Rust),
            vec!["crate::db::Store", "std::sync::Arc"]
        );
    }
}
