use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use tracing::warn;

/// Coarse classification of a question, used to bias the context budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    SpecificFunction,
    Debugging,
    Architecture,
    TypeRelated,
    General,
}

impl QueryIntent {
    pub const ALL: [QueryIntent; 5] = [
        QueryIntent::SpecificFunction,
        QueryIntent::Debugging,
        QueryIntent::Architecture,
        QueryIntent::TypeRelated,
        QueryIntent::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::SpecificFunction => "specific_function",
            QueryIntent::Debugging => "debugging",
            QueryIntent::Architecture => "architecture",
            QueryIntent::TypeRelated => "type_related",
            QueryIntent::General => "general",
        }
    }
}

impl fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct KeywordFamily {
    intent: QueryIntent,
    words: &'static [&'static str],
    phrases: &'static [&'static str],
}

/// Checked in order; the first family with a hit wins.
const FAMILIES: &[KeywordFamily] = &[
    KeywordFamily {
        intent: QueryIntent::SpecificFunction,
        words: &[
            "function", "functions", "method", "methods", "func", "fn", "def", "implementation",
            "implement", "implemented", "signature", "callers", "callees", "invoked",
        ],
        phrases: &["what does", "where is", "who calls", "called by", "defined in"],
    },
    KeywordFamily {
        intent: QueryIntent::Debugging,
        words: &[
            "error", "errors", "bug", "bugs", "crash", "crashes", "crashed", "crashing", "fail",
            "fails", "failed", "failing", "failure", "exception", "panic", "panics", "broken",
            "fix", "wrong", "issue", "traceback", "debug", "undefined", "null", "nil", "segfault",
        ],
        phrases: &["not working", "stack trace", "doesn't work", "why is", "why does"],
    },
    KeywordFamily {
        intent: QueryIntent::Architecture,
        words: &[
            "architecture", "structure", "structured", "design", "overview", "module", "modules",
            "flow", "organized", "organization", "layer", "layers", "component", "components",
            "dependency", "dependencies", "pattern", "patterns",
        ],
        phrases: &["how is the", "big picture", "data flow", "high level"],
    },
    KeywordFamily {
        intent: QueryIntent::TypeRelated,
        words: &[
            "type", "types", "interface", "interfaces", "struct", "structs", "class", "classes",
            "schema", "model", "models", "field", "fields", "enum", "enums", "generic",
            "generics", "trait", "traits",
        ],
        phrases: &["data type", "return type"],
    },
];

/// Total and deterministic: the same text always yields the same intent.
pub fn classify_intent(raw: &str) -> QueryIntent {
    let lowered = raw.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '\''))
        .filter(|w| !w.is_empty())
        .collect();
    let joined = format!(" {} ", words.join(" "));

    for family in FAMILIES {
        let word_hit = words.iter().any(|w| family.words.contains(w));
        let phrase_hit = family
            .phrases
            .iter()
            .any(|p| joined.contains(&format!(" {p} ")));
        if word_hit || phrase_hit {
            return family.intent;
        }
        if family.intent == QueryIntent::SpecificFunction && has_identifier_token(raw) {
            return family.intent;
        }
    }
    QueryIntent::General
}

/// `getUserById`, `hash_password`, `login()` and `Store::open` look like code.
static IDENTIFIER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"[a-z][A-Z]|[A-Za-z0-9]_[A-Za-z0-9]|\w\(\)|\w::\w")
        .map_err(|e| warn!("identifier pattern failed to compile: {e}"))
        .ok()
});

fn has_identifier_token(raw: &str) -> bool {
    IDENTIFIER.as_ref().is_some_and(|re| re.is_match(raw))
}
