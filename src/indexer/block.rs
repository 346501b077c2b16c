use super::chunker::{non_whitespace_len, Chunk, ChunkKind};

/// Split text into line-aligned blocks of roughly `budget` non-whitespace
/// characters. Any non-empty input yields at least one block, and a single
/// line longer than the budget becomes its own block.
pub fn chunk_blocks(text: &str, budget: usize) -> Vec<Chunk> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return Vec::new();
    }

    let budget = budget.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut weight = 0;

    for (idx, line) in lines.iter().enumerate() {
        let line_weight = non_whitespace_len(line);
        if weight > 0 && weight + line_weight > budget {
            chunks.push(make_block(&lines, start, idx - 1));
            start = idx;
            weight = 0;
        }
        weight += line_weight;
    }
    chunks.push(make_block(&lines, start, lines.len() - 1));

    chunks
}

fn make_block(lines: &[&str], first: usize, last: usize) -> Chunk {
    Chunk {
        kind: ChunkKind::Block,
        name: None,
        signature: lines[first].trim().to_string(),
        start_line: first + 1,
        end_line: last + 1,
        content: lines[first..=last].join("\n"),
        docstring: None,
        scope_path: String::new(),
        calls: Vec::new(),
        types: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_is_one_block() {
        let chunks = chunk_blocks("alpha\nbeta\ngamma\n", 2000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[0].content, "alpha\nbeta\ngamma");
        assert_eq!(chunks[0].signature, "alpha");
    }

    #[test]
    fn test_budget_splits_at_line_boundaries() {
        let text = (0..10).map(|i| format!("line{i:05}")).collect::<Vec<_>>().join("\n");
        // 9 characters per line, budget fits two lines.
        let chunks = chunk_blocks(&text, 18);
        assert_eq!(chunks.len(), 5);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.start_line, i * 2 + 1);
            assert_eq!(chunk.end_line, i * 2 + 2);
            assert!(text.contains(&chunk.content));
        }
    }

    #[test]
    fn test_oversized_line_stands_alone() {
        let text = format!("short\n{}\nshort", "x".repeat(50));
        let chunks = chunk_blocks(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].start_line, 2);
        assert_eq!(chunks[1].end_line, 2);
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert!(chunk_blocks("", 100).is_empty());
        let chunks = chunk_blocks("   \n\n", 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end_line, 2);
    }
}
