//! Text chunking for the knowledge index.
//!
//! Chunks target a fixed character size with a small overlap, preferring a
//! paragraph boundary past the midpoint, then a sentence terminator, then
//! a hard cut. Deterministic: the same text and parameters always produce
//! the same chunks.

const SENTENCE_BREAKS: [&str; 4] = [". ", ".\n", "! ", "? "];

/// Split text into overlapping chunks.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.len() <= chunk_size {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let mut end = floor_char_boundary(text, (start + chunk_size).min(text.len()));

        if end < text.len() {
            let midpoint = start + chunk_size / 2;
            // Prefer a paragraph break past the midpoint of the window.
            if let Some(p) = text[start..end].rfind("\n\n") {
                let candidate = start + p;
                if candidate > midpoint {
                    end = candidate + 2;
                } else {
                    end = find_sentence_break(text, start, end, midpoint).unwrap_or(end);
                }
            } else {
                end = find_sentence_break(text, start, end, midpoint).unwrap_or(end);
            }
        }

        let chunk = text[start..end].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        start = if end < text.len() {
            floor_char_boundary(text, end.saturating_sub(overlap))
        } else {
            text.len()
        };
    }

    chunks
}

fn find_sentence_break(text: &str, start: usize, end: usize, midpoint: usize) -> Option<usize> {
    for sep in SENTENCE_BREAKS {
        if let Some(p) = text[start..end].rfind(sep) {
            let candidate = start + p;
            if candidate > midpoint {
                return Some(candidate + sep.len());
            }
        }
    }
    None
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Title for a document: the `# ` heading, else the first short non-empty
/// line, else the filename stem with separators spaced out.
pub fn extract_title(text: &str, filename: &str) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();

    if let Some(first) = lines.first() {
        if let Some(heading) = first.strip_prefix("# ") {
            let heading = heading.trim();
            if !heading.is_empty() {
                return heading.to_string();
            }
        }
    }

    for line in lines.iter().take(5) {
        let line = line.trim();
        if !line.is_empty() && line.len() < 100 {
            return line.to_string();
        }
    }

    let stem = std::path::Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    stem.replace(['-', '_'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello world", 500, 50), vec!["hello world"]);
        assert!(chunk_text("   \n ", 500, 50).is_empty());
    }

    #[test]
    fn long_text_produces_overlapping_chunks() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text = sentence.repeat(40); // ~1840 chars
        let chunks = chunk_text(&text, 500, 50);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 510, "chunk too big: {}", chunk.len());
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "One sentence here. Another follows!\n\nA new paragraph starts. ".repeat(30);
        let a = chunk_text(&text, 500, 50);
        let b = chunk_text(&text, 500, 50);
        assert_eq!(a, b);
    }

    #[test]
    fn prefers_paragraph_break_past_midpoint() {
        let first = "a".repeat(350);
        let rest = "b".repeat(400);
        let text = format!("{first}\n\n{rest}");
        let chunks = chunk_text(&text, 500, 50);
        assert_eq!(chunks[0], first);
    }

    #[test]
    fn falls_back_to_sentence_break() {
        let first = format!("{}. ", "a".repeat(300));
        let text = format!("{first}{}", "b".repeat(600));
        let chunks = chunk_text(&text, 500, 50);
        assert_eq!(chunks[0], format!("{}.", "a".repeat(300)));
    }

    #[test]
    fn hard_cut_without_any_boundary() {
        let text = "x".repeat(1200);
        let chunks = chunk_text(&text, 500, 50);
        assert_eq!(chunks[0].len(), 500);
        // Overlap: the next chunk re-covers the last 50 chars.
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn multibyte_text_never_splits_a_char() {
        let text = "Grüße aus München! Schöne Straßenbahnen überall. ".repeat(30);
        let chunks = chunk_text(&text, 100, 20);
        assert!(!chunks.is_empty());
        // Reaching here without a panic means no char boundary was violated.
    }

    #[test]
    fn title_from_markdown_heading() {
        assert_eq!(extract_title("# Garden Notes\n\nbody", "notes.md"), "Garden Notes");
    }

    #[test]
    fn title_from_first_short_line() {
        assert_eq!(extract_title("Watering schedule\nbody text", "x.txt"), "Watering schedule");
    }

    #[test]
    fn title_from_filename_stem() {
        let long_line = "w".repeat(150);
        assert_eq!(extract_title(&long_line, "garden-care_plan.md"), "garden care plan");
    }
}
