use super::chunker::ChunkKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Languages with a structural grammar. Everything else is `Unsupported`
/// and goes through block chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Python,
    TypeScript,
    Tsx,
    JavaScript,
    Rust,
    Unsupported,
}

/// Per-language tables used by the chunker and the call graph builder.
pub struct LanguageSpec {
    pub language: Language,
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    /// Node kinds that become chunks, with the kind they map to.
    pub boundaries: &'static [(&'static str, ChunkKind)],
    pub call_kinds: &'static [&'static str],
    pub type_kinds: &'static [&'static str],
    pub primitives: &'static [&'static str],
    pub builtins: &'static [&'static str],
    pub comment_prefixes: &'static [&'static str],
    pub import_query: &'static str,
}

/// Extensions that are indexed with block chunking even without a grammar.
const PLAIN_TEXT_EXTENSIONS: &[&str] = &[
    "c", "h", "cpp", "hpp", "cc", "java", "rb", "lua", "php", "cs", "swift", "kt", "scala", "hs",
    "ex", "exs", "erl", "ml", "vim", "sh", "bash", "zsh", "yaml", "yml", "json", "toml", "html",
    "css", "sql",
];

const C_STYLE_COMMENTS: &[&str] = &["//", "/*", "*"];

static SPECS: [LanguageSpec; 6] = [
    LanguageSpec {
        language: Language::Go,
        name: "go",
        extensions: &["go"],
        boundaries: &[
            ("function_declaration", ChunkKind::Function),
            ("method_declaration", ChunkKind::Method),
            ("type_declaration", ChunkKind::Type),
        ],
        call_kinds: &["call_expression"],
        type_kinds: &["type_identifier"],
        primitives: &[
            "bool", "byte", "rune", "string", "error", "int", "int8", "int16", "int32", "int64",
            "uint", "uint8", "uint16", "uint32", "uint64", "uintptr", "float32", "float64",
            "complex64", "complex128", "any",
        ],
        builtins: &[
            "len", "cap", "make", "new", "append", "copy", "delete", "panic", "recover", "print",
            "println", "close",
        ],
        comment_prefixes: C_STYLE_COMMENTS,
        import_query: r#"
(import_spec
  path: (interpreted_string_literal) @import)
"#,
    },
    LanguageSpec {
        language: Language::Python,
        name: "python",
        extensions: &["py", "pyi"],
        boundaries: &[
            ("function_definition", ChunkKind::Function),
            ("class_definition", ChunkKind::Class),
        ],
        call_kinds: &["call"],
        type_kinds: &["type"],
        primitives: &[
            "int", "str", "float", "bool", "bytes", "None", "list", "dict", "tuple", "set",
            "object", "Any", "Optional", "List", "Dict", "Tuple", "Set", "Union", "Callable",
        ],
        builtins: &[
            "print", "len", "range", "isinstance", "str", "int", "float", "list", "dict", "set",
            "tuple", "super", "enumerate", "zip", "open",
        ],
        comment_prefixes: &["#"],
        import_query: r#"
(import_statement
  name: (dotted_name) @import)
(import_from_statement
  module_name: (dotted_name) @import)
"#,
    },
    LanguageSpec {
        language: Language::TypeScript,
        name: "typescript",
        extensions: &["ts", "mts", "cts"],
        boundaries: TS_BOUNDARIES,
        call_kinds: &["call_expression", "new_expression"],
        type_kinds: &["type_identifier"],
        primitives: TS_PRIMITIVES,
        builtins: JS_BUILTINS,
        comment_prefixes: C_STYLE_COMMENTS,
        import_query: JS_IMPORT_QUERY,
    },
    LanguageSpec {
        language: Language::Tsx,
        name: "tsx",
        extensions: &["tsx"],
        boundaries: TS_BOUNDARIES,
        call_kinds: &["call_expression", "new_expression"],
        type_kinds: &["type_identifier"],
        primitives: TS_PRIMITIVES,
        builtins: JS_BUILTINS,
        comment_prefixes: C_STYLE_COMMENTS,
        import_query: JS_IMPORT_QUERY,
    },
    LanguageSpec {
        language: Language::JavaScript,
        name: "javascript",
        extensions: &["js", "jsx", "mjs", "cjs"],
        boundaries: &[
            ("function_declaration", ChunkKind::Function),
            ("generator_function_declaration", ChunkKind::Function),
            ("class_declaration", ChunkKind::Class),
            ("method_definition", ChunkKind::Method),
            ("arrow_function", ChunkKind::Function),
            ("function_expression", ChunkKind::Function),
            ("function", ChunkKind::Function),
        ],
        call_kinds: &["call_expression", "new_expression"],
        type_kinds: &[],
        primitives: &[],
        builtins: JS_BUILTINS,
        comment_prefixes: C_STYLE_COMMENTS,
        import_query: JS_IMPORT_QUERY,
    },
    LanguageSpec {
        language: Language::Rust,
        name: "rust",
        extensions: &["rs"],
        boundaries: &[
            ("function_item", ChunkKind::Function),
            ("impl_item", ChunkKind::Impl),
            ("struct_item", ChunkKind::Struct),
            ("enum_item", ChunkKind::Enum),
            ("trait_item", ChunkKind::Interface),
            ("type_item", ChunkKind::Type),
        ],
        call_kinds: &["call_expression"],
        type_kinds: &["type_identifier"],
        primitives: &[
            "i8", "i16", "i32", "i64", "i128", "isize", "u8", "u16", "u32", "u64", "u128",
            "usize", "f32", "f64", "bool", "char", "str", "Self",
        ],
        builtins: &["Some", "Ok", "Err", "drop"],
        comment_prefixes: &["///", "//!", "//", "/*", "*"],
        import_query: r#"
(use_declaration
  argument: (scoped_identifier) @import)
(use_declaration
  argument: (identifier) @import)
(use_declaration
  argument: (scoped_use_list) @import)
(use_declaration
  argument: (use_wildcard) @import)
"#,
    },
];

const TS_BOUNDARIES: &[(&str, ChunkKind)] = &[
    ("function_declaration", ChunkKind::Function),
    ("generator_function_declaration", ChunkKind::Function),
    ("class_declaration", ChunkKind::Class),
    ("abstract_class_declaration", ChunkKind::Class),
    ("method_definition", ChunkKind::Method),
    ("arrow_function", ChunkKind::Function),
    ("function_expression", ChunkKind::Function),
    ("interface_declaration", ChunkKind::Interface),
    ("type_alias_declaration", ChunkKind::Type),
    ("enum_declaration", ChunkKind::Enum),
];

const TS_PRIMITIVES: &[&str] = &[
    "string", "number", "boolean", "any", "void", "never", "unknown", "object", "undefined",
    "null", "bigint", "symbol", "Promise", "Array", "Record", "Partial",
];

const JS_BUILTINS: &[&str] = &["require", "parseInt", "parseFloat", "setTimeout", "log"];

const JS_IMPORT_QUERY: &str = r#"
(import_statement
  source: (string) @import)
"#;

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        SPECS
            .iter()
            .find(|s| s.extensions.contains(&ext.as_str()))
            .map(|s| s.language)
            .unwrap_or(Language::Unsupported)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        path.as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Language::Unsupported)
    }

    pub fn from_name(name: &str) -> Self {
        SPECS
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.language)
            .unwrap_or(Language::Unsupported)
    }

    pub fn as_str(&self) -> &'static str {
        self.spec().map(|s| s.name).unwrap_or("text")
    }

    pub fn spec(&self) -> Option<&'static LanguageSpec> {
        SPECS.iter().find(|s| s.language == *self)
    }

    /// The tree-sitter grammar, `None` for `Unsupported`.
    pub fn grammar(&self) -> Option<tree_sitter::Language> {
        let grammar = match self {
            Language::Go => tree_sitter_go::LANGUAGE.into(),
            Language::Python => tree_sitter_python::LANGUAGE.into(),
            Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Language::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Language::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Language::Rust => tree_sitter_rust::LANGUAGE.into(),
            Language::Unsupported => return None,
        };
        Some(grammar)
    }

    /// Whether files with this path should be picked up by a project scan.
    pub fn is_indexable_path<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        if Self::from_path(path) != Language::Unsupported {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| PLAIN_TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl LanguageSpec {
    pub fn boundary_kind(&self, node_kind: &str) -> Option<ChunkKind> {
        self.boundaries
            .iter()
            .find(|(k, _)| *k == node_kind)
            .map(|(_, kind)| *kind)
    }

    pub fn is_function_like(&self, node_kind: &str) -> bool {
        matches!(
            self.boundary_kind(node_kind),
            Some(ChunkKind::Function | ChunkKind::Method)
        )
    }

    pub fn is_primitive(&self, type_name: &str) -> bool {
        self.primitives.contains(&type_name)
    }

    pub fn is_builtin_call(&self, name: &str) -> bool {
        self.builtins.contains(&name)
    }

    pub fn is_comment_line(&self, line: &str) -> bool {
        self.comment_prefixes.iter().any(|p| line.starts_with(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_detection() {
        assert_eq!(Language::from_path("src/main.rs"), Language::Rust);
        assert_eq!(Language::from_path("app/view.TSX"), Language::Tsx);
        assert_eq!(Language::from_path("svc/user.go"), Language::Go);
        assert_eq!(Language::from_path("README"), Language::Unsupported);
        assert_eq!(Language::from_path("Main.java"), Language::Unsupported);
        assert_eq!(Language::from_name("python"), Language::Python);
        assert_eq!(Language::Unsupported.as_str(), "text");
    }

    #[test]
    fn test_every_supported_language_has_grammar() {
        for spec in SPECS.iter() {
            assert!(spec.language.grammar().is_some(), "{}", spec.name);
            assert_eq!(spec.language.spec().map(|s| s.name), Some(spec.name));
        }
        assert!(Language::Unsupported.grammar().is_none());
        assert!(Language::Unsupported.spec().is_none());
    }

    #[test]
    fn test_indexable_paths() {
        assert!(Language::is_indexable_path("a/b.py"));
        assert!(Language::is_indexable_path("a/Main.java"));
        assert!(Language::is_indexable_path("config.yml"));
        assert!(!Language::is_indexable_path("logo.png"));
        assert!(!Language::is_indexable_path("Makefile"));
    }

    #[test]
    fn test_import_queries_compile() {
        for spec in SPECS.iter() {
            let grammar = spec.language.grammar().unwrap();
            tree_sitter::Query::new(&grammar, spec.import_query)
                .unwrap_or_else(|e| panic!("{} import query: {e}", spec.name));
        }
    }
}
