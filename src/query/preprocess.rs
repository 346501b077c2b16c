use serde::Serialize;
use std::collections::HashSet;

pub const DEFAULT_MAX_TERMS: usize = 200;
const MIN_TERM_CHARS: usize = 2;

const STOP_WORDS: &[&str] = &[
    // articles
    "a", "an", "the",
    // auxiliaries
    "is", "are", "was", "were", "be", "been", "being", "am", "do", "does", "did", "done", "has",
    "have", "had", "can", "could", "will", "would", "shall", "should", "may", "might", "must",
    // pronouns
    "i", "me", "my", "mine", "we", "us", "our", "you", "your", "he", "him", "his", "she", "her",
    "it", "its", "they", "them", "their", "this", "that", "these", "those", "what", "which",
    "who", "whom", "whose",
    // prepositions, conjunctions, question words
    "by", "of", "in", "on", "at", "to", "for", "with", "from", "into", "onto", "about", "as",
    "and", "or", "but", "if", "then", "so", "than", "how", "why", "where", "when", "there",
    "here", "please", "some", "any",
];

/// Expansion table. Lookups use the preprocessed (lowercase) term.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("auth", &["authentication", "login"]),
    ("authenticate", &["auth", "login"]),
    ("authentication", &["auth", "login"]),
    ("login", &["auth", "signin"]),
    ("logout", &["signout", "session"]),
    ("validate", &["check", "verify"]),
    ("validation", &["check", "verify"]),
    ("verify", &["check", "validate"]),
    ("password", &["pass", "credential"]),
    ("token", &["jwt", "credential"]),
    ("fetch", &["get", "retrieve", "load"]),
    ("get", &["fetch", "retrieve"]),
    ("load", &["read", "fetch"]),
    ("save", &["store", "persist", "write"]),
    ("delete", &["remove", "destroy"]),
    ("remove", &["delete"]),
    ("create", &["add", "new", "insert"]),
    ("update", &["modify", "edit"]),
    ("error", &["err", "exception", "failure"]),
    ("exception", &["error", "err"]),
    ("config", &["configuration", "settings"]),
    ("settings", &["config", "configuration"]),
    ("db", &["database"]),
    ("database", &["db", "repository"]),
    ("init", &["initialize", "setup"]),
    ("hash", &["digest"]),
    ("send", &["emit", "dispatch"]),
    ("email", &["mail"]),
    ("request", &["req"]),
    ("response", &["resp", "res"]),
    ("handler", &["handle", "controller"]),
    ("parse", &["decode"]),
    ("serialize", &["encode", "marshal"]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreprocessedQuery {
    /// Lowercased query with punctuation removed and whitespace collapsed.
    pub normalized: String,
    /// Search terms in discovery order, synonyms last, never more than the cap.
    pub terms: Vec<String>,
}

impl PreprocessedQuery {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

pub fn preprocess_query(raw: &str) -> PreprocessedQuery {
    preprocess_query_with(raw, DEFAULT_MAX_TERMS)
}

pub fn preprocess_query_with(raw: &str, max_terms: usize) -> PreprocessedQuery {
    let stripped = strip_punctuation(raw);
    let normalized = stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut terms = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |term: String, terms: &mut Vec<String>| {
        if terms.len() < max_terms && seen.insert(term.clone()) {
            terms.push(term);
        }
    };

    'tokens: for token in stripped.split_whitespace() {
        let words = if token.is_ascii() {
            split_identifier(token)
        } else {
            vec![token.to_lowercase()]
        };
        for word in words {
            if terms.len() >= max_terms {
                break 'tokens;
            }
            if is_stop_word(&word) || word.chars().count() < MIN_TERM_CHARS {
                continue;
            }
            push(word, &mut terms);
        }
    }

    let base = terms.len();
    for idx in 0..base {
        if terms.len() >= max_terms {
            break;
        }
        for synonym in synonyms(&terms[idx]) {
            push(synonym.to_string(), &mut terms);
        }
    }

    PreprocessedQuery { normalized, terms }
}

/// ASCII characters outside `[A-Za-z0-9_]` become spaces. Non-ASCII
/// characters are kept so such tokens survive whole.
fn strip_punctuation(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii() && !(c.is_ascii_alphanumeric() || c == '_') {
                ' '
            } else {
                c
            }
        })
        .collect()
}

/// Split an identifier on snake_case and camelCase boundaries, lowercased.
/// Acronyms stay together: `parseHTTPRequest` gives parse, http, request.
pub fn split_identifier(ident: &str) -> Vec<String> {
    let mut words = Vec::new();
    for part in ident.split('_').filter(|p| !p.is_empty()) {
        let chars: Vec<char> = part.chars().collect();
        let mut current = String::new();
        for (i, &c) in chars.iter().enumerate() {
            if i > 0 && c.is_uppercase() {
                let prev = chars[i - 1];
                let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                let boundary = prev.is_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_uppercase() && next_is_lower);
                if boundary && !current.is_empty() {
                    words.push(current.to_lowercase());
                    current.clear();
                }
            }
            current.push(c);
        }
        if !current.is_empty() {
            words.push(current.to_lowercase());
        }
    }
    words
}

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

pub fn synonyms(term: &str) -> &'static [&'static str] {
    SYNONYMS
        .iter()
        .find(|(key, _)| *key == term)
        .map(|(_, values)| *values)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_identifier() {
        assert_eq!(split_identifier("getUserById"), vec!["get", "user", "by", "id"]);
        assert_eq!(split_identifier("hash_password"), vec!["hash", "password"]);
        assert_eq!(split_identifier("PascalCase"), vec!["pascal", "case"]);
        assert_eq!(
            split_identifier("parseHTTPRequest"),
            vec!["parse", "http", "request"]
        );
        assert_eq!(split_identifier("__init__"), vec!["init"]);
        assert_eq!(split_identifier("sha256Sum"), vec!["sha256", "sum"]);
    }

    #[test]
    fn test_camel_case_query_drops_stop_words() {
        let q = preprocess_query("getUserById function");
        for expected in ["get", "user", "id", "function"] {
            assert!(q.terms.contains(&expected.to_string()), "{expected} in {:?}", q.terms);
        }
        assert!(!q.terms.contains(&"by".to_string()));
        assert_eq!(q.normalized, "getuserbyid function");
    }

    #[test]
    fn test_punctuation_and_short_tokens() {
        let q = preprocess_query("Where is the `hash_password()` call? x y");
        assert_eq!(&q.terms[..3], &["hash", "password", "call"]);
        assert!(!q.terms.iter().any(|t| t.chars().count() < 2));
    }

    #[test]
    fn test_synonyms_only_add() {
        let q = preprocess_query("validate password");
        assert_eq!(&q.terms[..2], &["validate", "password"]);
        for syn in ["check", "verify", "pass", "credential"] {
            assert!(q.terms.contains(&syn.to_string()));
        }
        assert_eq!(synonyms("unknownterm").len(), 0);
    }

    #[test]
    fn test_non_ascii_passes_through() {
        let q = preprocess_query("用户 登录 loginHandler");
        assert!(q.terms.contains(&"用户".to_string()));
        assert!(q.terms.contains(&"登录".to_string()));
        assert!(q.terms.contains(&"login".to_string()));
        assert!(q.terms.contains(&"handler".to_string()));
    }

    #[test]
    fn test_term_cap_holds_for_pathological_input() {
        let unique: String = (0..5000).map(|i| format!("term{i} ")).collect();
        assert_eq!(preprocess_query(&unique).terms.len(), DEFAULT_MAX_TERMS);

        let repeated = "auth ".repeat(100_000);
        let q = preprocess_query(&repeated);
        assert_eq!(q.terms, vec!["auth", "authentication", "login"]);

        let capped = preprocess_query_with("auth login validate password", 3);
        assert_eq!(capped.terms.len(), 3);
    }

    #[test]
    fn test_empty_query() {
        assert!(preprocess_query("").is_empty());
        assert!(preprocess_query("?? !! the a").is_empty());
    }
}
