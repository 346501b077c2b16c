use super::budget::BudgetCategory;
use crate::indexer::chunker::ChunkKind;
use crate::indexer::languages::Language;
use serde::Serialize;

/// One block chosen for the context document.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub category: BudgetCategory,
    pub file_path: String,
    pub language: Language,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: Option<ChunkKind>,
    pub name: Option<String>,
    pub content: String,
    pub score: Option<f64>,
    pub tokens: usize,
}

/// Metadata entry describing one rendered block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub category: BudgetCategory,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub tokens: usize,
}

impl Selection {
    /// Set `tokens` to the block's rendered cost.
    pub fn measured(mut self, chars_per_token: usize) -> Self {
        self.tokens = block_tokens(&self, chars_per_token);
        self
    }
}

impl From<&Selection> for SourceRef {
    fn from(s: &Selection) -> Self {
        Self {
            category: s.category,
            file_path: s.file_path.clone(),
            start_line: s.start_line,
            end_line: s.end_line,
            name: s.name.clone(),
            score: s.score,
            tokens: s.tokens,
        }
    }
}

/// `ceil(chars / chars_per_token)`.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    text.chars().count().div_ceil(chars_per_token.max(1))
}

fn fence_tag(language: Language) -> &'static str {
    match language {
        Language::Unsupported => "",
        other => other.as_str(),
    }
}

/// Heading that opens a category section, with the blank line that
/// separates it from the previous section.
pub fn section_heading(category: BudgetCategory) -> String {
    format!("\n## {}\n", category.heading())
}

/// One fenced block exactly as it appears in the document.
pub fn block_text(block: &Selection) -> String {
    let label = match (&block.kind, &block.name) {
        (Some(kind), Some(name)) => format!(" ({} {name})", kind.as_str()),
        (Some(kind), None) => format!(" ({})", kind.as_str()),
        _ => String::new(),
    };
    let newline = if block.content.ends_with('\n') { "" } else { "\n" };
    format!(
        "\n### {}:{}-{}{label}\n```{}\n{}{newline}```\n",
        block.file_path,
        block.start_line,
        block.end_line,
        fence_tag(block.language),
        block.content,
    )
}

/// Tokens a block adds to the document, fence and header included.
pub fn block_tokens(block: &Selection, chars_per_token: usize) -> usize {
    estimate_tokens(&block_text(block), chars_per_token)
}

/// Tokens a category heading adds to the document.
pub fn heading_tokens(category: BudgetCategory, chars_per_token: usize) -> usize {
    estimate_tokens(&section_heading(category), chars_per_token)
}

/// Render selections grouped by category, in category order. Within a
/// category the input order is kept. The document is the concatenation of
/// [`section_heading`] and [`block_text`] pieces, minus the leading newline.
pub fn render(selections: &[Selection]) -> String {
    let mut out = String::new();
    for category in BudgetCategory::ALL {
        let mut blocks = selections.iter().filter(|s| s.category == category).peekable();
        if blocks.peek().is_none() {
            continue;
        }
        let heading = section_heading(category);
        if out.is_empty() {
            out.push_str(heading.trim_start_matches('\n'));
        } else {
            out.push_str(&heading);
        }
        for block in blocks {
            out.push_str(&block_text(block));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(category: BudgetCategory, path: &str, name: Option<&str>) -> Selection {
        Selection {
            category,
            file_path: path.to_string(),
            language: Language::from_path(path),
            start_line: 3,
            end_line: 4,
            kind: name.map(|_| ChunkKind::Function),
            name: name.map(str::to_string),
            content: "def f():\n    pass".to_string(),
            score: None,
            tokens: 5,
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("", 4), 0);
        assert_eq!(estimate_tokens("abcd", 4), 1);
        assert_eq!(estimate_tokens("abcde", 4), 2);
        assert_eq!(estimate_tokens("héllo", 0), 5);
    }

    #[test]
    fn test_render_orders_categories() {
        let text = render(&[
            selection(BudgetCategory::CallGraph, "b.py", Some("helper")),
            selection(BudgetCategory::CurrentFile, "a.py", None),
            selection(BudgetCategory::Bm25Results, "notes.txt", Some("f")),
        ]);

        let current = text.find("## Current file").unwrap();
        let relevant = text.find("## Relevant code").unwrap();
        let graph = text.find("## Call graph").unwrap();
        assert!(current < relevant && relevant < graph);
        assert!(!text.contains("## Definitions"));

        assert!(text.contains("### a.py:3-4\n```python\ndef f():\n    pass\n```\n"));
        assert!(text.contains("### b.py:3-4 (function helper)"));
        assert!(text.contains("### notes.txt:3-4 (function f)\n```\n"));
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render(&[]), "");
    }

    #[test]
    fn test_pieces_cover_rendered_text() {
        let selections = vec![
            selection(BudgetCategory::CurrentFile, "a.py", None),
            selection(BudgetCategory::Bm25Results, "b.py", Some("helper")),
            selection(BudgetCategory::Bm25Results, "c.py", Some("other")),
        ];
        let text = render(&selections);

        let mut pieces = String::new();
        for category in [BudgetCategory::CurrentFile, BudgetCategory::Bm25Results] {
            pieces.push_str(&section_heading(category));
            for block in selections.iter().filter(|s| s.category == category) {
                pieces.push_str(&block_text(block));
            }
        }
        assert_eq!(format!("\n{text}"), pieces);

        let charged: usize = heading_tokens(BudgetCategory::CurrentFile, 4)
            + heading_tokens(BudgetCategory::Bm25Results, 4)
            + selections.iter().map(|s| block_tokens(s, 4)).sum::<usize>();
        assert!(estimate_tokens(&text, 4) <= charged);
        assert!(block_tokens(&selections[0], 4) > estimate_tokens(&selections[0].content, 4));
    }
}
