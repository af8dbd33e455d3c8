use crate::model::cache_record::TermSegment;
use crate::model::output::Output;

/// Parallel per-statement sources and outputs from a term-mode evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub sources: Vec<String>,
    pub outputs: Vec<Vec<Output>>,
}

const CONTINUATION_KEYWORDS: [&str; 4] = ["else", "elif", "except", "finally"];

/// Split code into top-level statements, the way an interactive prompt
/// would accept them.
///
/// A non-indented line starts a new statement unless brackets are still
/// open, the previous line ended with `:` or `\`, or the line continues a
/// compound statement (`else`, `elif`, ...).
pub fn split_statements(code: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut depth: i32 = 0;
    let mut continues = false;

    for line in code.trim_start_matches(['\n', '\r']).lines() {
        let trimmed = line.trim_end();
        let starts_new = !current.is_empty()
            && !trimmed.is_empty()
            && !line.starts_with([' ', '\t'])
            && depth <= 0
            && !continues
            && !CONTINUATION_KEYWORDS
                .iter()
                .any(|kw| trimmed.starts_with(kw) && trimmed[kw.len()..].starts_with([' ', ':']));

        if starts_new {
            statements.push(finish(&current));
            current.clear();
        }

        current.push(line);

        if !trimmed.is_empty() {
            depth += bracket_delta(trimmed);
            continues = trimmed.ends_with(':') || trimmed.ends_with('\\');
        }
    }

    if current.iter().any(|l| !l.trim().is_empty()) {
        statements.push(finish(&current));
    }

    statements
}

fn finish(lines: &[&str]) -> String {
    lines.join("\n").trim_end().to_string()
}

fn bracket_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '#') => break,
            (None, '(') | (None, '[') | (None, '{') => delta += 1,
            (None, ')') | (None, ']') | (None, '}') => delta -= 1,
            _ => {}
        }
    }

    delta
}

/// Group statements so that each group ends with one that produced output.
///
/// Silent statements (an assignment, an import) are folded into the next
/// statement that shows something. Trailing silent statements form a final
/// group with no outputs.
pub fn fold_transcript(transcript: Transcript) -> Vec<TermSegment> {
    let mut segments = Vec::new();
    let mut source = String::new();

    for (src, outputs) in transcript.sources.into_iter().zip(transcript.outputs) {
        if !source.is_empty() {
            source.push('\n');
        }
        source.push_str(&src);

        if !outputs.is_empty() {
            segments.push(TermSegment {
                source: std::mem::take(&mut source),
                outputs,
            });
        }
    }

    if !source.is_empty() {
        segments.push(TermSegment {
            source,
            outputs: Vec::new(),
        });
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_top_level_statements() {
        let code = "x = 1\ndef f(a):\n    return a\n\nprint(f(x))\n";
        assert_eq!(
            split_statements(code),
            vec!["x = 1", "def f(a):\n    return a", "print(f(x))"]
        );
    }

    #[test]
    fn keeps_open_brackets_and_else_together() {
        let code = "y = [1,\n2]\nif y:\n    pass\nelse:\n    pass\nz";
        assert_eq!(
            split_statements(code),
            vec!["y = [1,\n2]", "if y:\n    pass\nelse:\n    pass", "z"]
        );
    }

    #[test]
    fn folds_silent_statements_into_next_output() {
        let transcript = Transcript {
            sources: vec!["x = 1".into(), "y = 2".into(), "x + y".into(), "z = 0".into()],
            outputs: vec![vec![], vec![], vec![Output::plain_result("3")], vec![]],
        };

        let segments = fold_transcript(transcript);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].source, "x = 1\ny = 2\nx + y");
        assert_eq!(segments[0].outputs, vec![Output::plain_result("3")]);
        assert_eq!(segments[1].source, "z = 0");
        assert!(segments[1].outputs.is_empty());
    }
}
