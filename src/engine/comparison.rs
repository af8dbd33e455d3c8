use crate::model::chunk::CodeChunk;

/// Computes the key that decides whether a cached record is still valid.
///
/// Two chunks with equal keys at the same position are treated as the same
/// computation. Render-only options never participate.
pub trait ComparisonStrategy {
    fn comparison_key(&self, chunk: &CodeChunk) -> String;
}

/// Exact equality over the chunk content.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawContent;

impl ComparisonStrategy for RawContent {
    fn comparison_key(&self, chunk: &CodeChunk) -> String {
        chunk.content.clone()
    }
}

/// Ignores whitespace-only edits that keep the shape of the code: trailing
/// spaces, blank lines, runs of spaces between tokens and a uniform shift
/// of indentation. Relative indentation still counts.
///
/// Whitespace inside string literals is collapsed too, so this is opt-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedWhitespace;

impl ComparisonStrategy for NormalizedWhitespace {
    fn comparison_key(&self, chunk: &CodeChunk) -> String {
        normalize(&chunk.content)
    }
}

fn normalize(content: &str) -> String {
    let lines: Vec<String> = content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let body = line.trim_start();
            let indent = line.len() - body.len();
            let words: Vec<&str> = body.split_whitespace().collect();
            format!("{}{}", indent_marker(indent), words.join(" "))
        })
        .collect();

    // Relative indentation only: strip the common prefix.
    let common = lines
        .iter()
        .map(|l| l.chars().take_while(|c| *c == '>').count())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|l| &l[common..])
        .collect::<Vec<_>>()
        .join("\n")
}

fn indent_marker(width: usize) -> String {
    ">".repeat(width)
}

/// Content plus the options that change what gets executed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentWithOptions;

impl ComparisonStrategy for ContentWithOptions {
    fn comparison_key(&self, chunk: &CodeChunk) -> String {
        let options = serde_json::to_string(&chunk.options.semantic()).unwrap_or_default();
        format!("{}\u{0}{}", options, chunk.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::options::ChunkOptions;

    fn chunk(content: &str) -> CodeChunk {
        CodeChunk::new(0, content, ChunkOptions::default())
    }

    #[test]
    fn raw_content_sees_every_edit() {
        let a = RawContent.comparison_key(&chunk("x = 0"));
        let b = RawContent.comparison_key(&chunk("x = 0 "));
        assert_ne!(a, b);
    }

    #[test]
    fn normalized_ignores_whitespace_only_edits() {
        let a = NormalizedWhitespace.comparison_key(&chunk("x = 0\nif x:\n    y = 1\n"));
        let b = NormalizedWhitespace.comparison_key(&chunk("\n  x  =  0\n\n  if x:   \n      y = 1"));
        assert_eq!(a, b);

        let c = NormalizedWhitespace.comparison_key(&chunk("x = 0\nif x:\ny = 1"));
        assert_ne!(a, c);
    }

    #[test]
    fn options_key_ignores_render_options() {
        let mut a = chunk("plot()");
        a.options.dpi = Some(100);
        let mut b = chunk("plot()");
        b.options.dpi = Some(300);
        assert_eq!(
            ContentWithOptions.comparison_key(&a),
            ContentWithOptions.comparison_key(&b)
        );

        b.options.term = Some(true);
        assert_ne!(
            ContentWithOptions.comparison_key(&a),
            ContentWithOptions.comparison_key(&b)
        );
    }
}
