use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};

use crate::engine::backend::Backend;
use crate::error::BackendError;
use crate::model::output::{render_inline, Output};

/// `<%= expr %>` prints the value of `expr`; `<% stmt %>` runs `stmt` and
/// keeps only what it writes (usually nothing).
fn inline_pattern() -> &'static Regex {
    static INLINE: OnceLock<Regex> = OnceLock::new();
    INLINE.get_or_init(|| Regex::new(r"(?s)<%(=)?(.*?)%>").expect("valid inline pattern"))
}

#[derive(Debug, Clone, PartialEq)]
pub enum InlineKind {
    Printing,
    Silent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineRegion {
    pub kind: InlineKind,
    pub code: String,
}

/// Regions in document order.
pub fn find_regions(content: &str) -> Vec<InlineRegion> {
    inline_pattern()
        .captures_iter(content)
        .map(|caps| region(&caps))
        .collect()
}

fn region(caps: &Captures) -> InlineRegion {
    let kind = if caps.get(1).is_some() {
        InlineKind::Printing
    } else {
        InlineKind::Silent
    };
    InlineRegion {
        kind,
        code: caps[2].trim().to_string(),
    }
}

fn substitution(kind: &InlineKind, outputs: &[Output]) -> String {
    match kind {
        InlineKind::Printing => render_inline(outputs),
        InlineKind::Silent => outputs
            .iter()
            .filter_map(|out| match out {
                Output::Stream { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect(),
    }
}

/// Replace every inline region of `content` with its evaluated text.
///
/// Regions are evaluated once each, left to right, against the live backend
/// and never through the cache. Text without delimiters is returned as is, and
/// an opening `<%` that is never closed stays in the text.
pub fn evaluate_inline<B: Backend + ?Sized>(
    backend: &mut B,
    content: &str,
    timeout: Option<Duration>,
) -> Result<String, BackendError> {
    let pattern = inline_pattern();
    if !pattern.is_match(content) {
        warn_unterminated(content);
        return Ok(content.to_string());
    }

    let mut result = String::with_capacity(content.len());
    let mut last = 0;

    for caps in pattern.captures_iter(content) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((last, last));
        let region = region(&caps);

        log::debug!("Inline {:?} `{}`", region.kind, region.code);
        let outputs = backend.evaluate(&region.code, timeout)?;

        result.push_str(&content[last..whole.0]);
        result.push_str(substitution(&region.kind, &outputs).trim_end_matches('\n'));
        last = whole.1;
    }

    warn_unterminated(&content[last..]);
    result.push_str(&content[last..]);
    Ok(result)
}

/// An opening `<%` with no closing `%>` is left in the text as written.
fn warn_unterminated(rest: &str) {
    if rest.contains("<%") {
        log::warn!("Unterminated inline region left as text: {:?}", rest.trim());
    }
}
