use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Options attached to a code chunk.
///
/// Every field is optional so that a chunk only carries what its author
/// wrote; the effective options are the defaults table overridden by the
/// chunk-local values (see [`ChunkOptions::merged_over`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate: Option<bool>,

    /// Chunk-local cache flag. Absent means "follow the global flag".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fig: Option<bool>,

    /// `false` marks a fragment whose code continues in the next chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<bool>,

    /// File path or backend symbol whose source is prepended to the chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    // Render-only options. Never part of a cache fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f_size: Option<(u32, u32)>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,

    /// Options this crate does not interpret, kept for the renderer.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/* =========================
   Defaults table
   ========================= */

/// | option   | default      |
/// |----------|--------------|
/// | evaluate | `true`       |
/// | complete | `true`       |
/// | fig      | `true`       |
/// | print    | `false`      |
/// | term     | `false`      |
/// | echo     | `true`       |
/// | results  | `"verbatim"` |
/// | f_size   | `(6, 4)`     |
/// | dpi      | `200`        |
///
/// `cache`, `name` and `source` have no default: an unset `cache` defers to
/// the global caching flag.
pub fn default_options() -> ChunkOptions {
    ChunkOptions {
        evaluate: Some(true),
        complete: Some(true),
        fig: Some(true),
        print: Some(false),
        term: Some(false),
        echo: Some(true),
        results: Some("verbatim".into()),
        f_size: Some((6, 4)),
        dpi: Some(200),
        ..ChunkOptions::default()
    }
}

impl ChunkOptions {
    /// Chunk-local values win over `defaults`.
    pub fn merged_over(&self, defaults: &ChunkOptions) -> ChunkOptions {
        ChunkOptions {
            name: self.name.clone().or_else(|| defaults.name.clone()),
            evaluate: self.evaluate.or(defaults.evaluate),
            cache: self.cache.or(defaults.cache),
            fig: self.fig.or(defaults.fig),
            complete: self.complete.or(defaults.complete),
            print: self.print.or(defaults.print),
            term: self.term.or(defaults.term),
            source: self.source.clone().or_else(|| defaults.source.clone()),
            echo: self.echo.or(defaults.echo),
            results: self.results.clone().or_else(|| defaults.results.clone()),
            f_size: self.f_size.or(defaults.f_size),
            dpi: self.dpi.or(defaults.dpi),
            width: self.width.clone().or_else(|| defaults.width.clone()),
            caption: self.caption.clone().or_else(|| defaults.caption.clone()),
            extra: defaults
                .extra
                .iter()
                .chain(&self.extra)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn evaluate(&self) -> bool {
        self.evaluate.unwrap_or(true)
    }

    pub fn complete(&self) -> bool {
        self.complete.unwrap_or(true)
    }

    pub fn fig(&self) -> bool {
        self.fig.unwrap_or(false)
    }

    pub fn term(&self) -> bool {
        self.term.unwrap_or(false)
    }

    /// Caching applies only when both the global flag and the
    /// chunk-local flag (or the global flag in its absence) are set.
    pub fn caches(&self, global_caching: bool) -> bool {
        global_caching && self.cache.unwrap_or(global_caching)
    }

    /// Options that change what gets executed, without render-only keys.
    pub fn semantic(&self) -> ChunkOptions {
        ChunkOptions {
            evaluate: self.evaluate,
            print: self.print,
            term: self.term,
            source: self.source.clone(),
            ..ChunkOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_values_override_defaults() {
        let local = ChunkOptions {
            cache: Some(false),
            fig: Some(false),
            name: Some("setup".into()),
            ..ChunkOptions::default()
        };

        let merged = local.merged_over(&default_options());
        assert_eq!(merged.fig, Some(false));
        assert_eq!(merged.cache, Some(false));
        assert_eq!(merged.evaluate, Some(true));
        assert_eq!(merged.dpi, Some(200));
        assert_eq!(merged.name.as_deref(), Some("setup"));
    }

    #[test]
    fn cache_flag_needs_global_and_local() {
        let unset = ChunkOptions::default();
        assert!(unset.caches(true));
        assert!(!unset.caches(false));

        let off = ChunkOptions { cache: Some(false), ..ChunkOptions::default() };
        assert!(!off.caches(true));

        let on = ChunkOptions { cache: Some(true), ..ChunkOptions::default() };
        assert!(!on.caches(false));
        assert!(on.caches(true));
    }

    #[test]
    fn semantic_view_drops_render_options() {
        let opts = default_options().semantic();
        assert_eq!(opts.dpi, None);
        assert_eq!(opts.f_size, None);
        assert_eq!(opts.echo, None);
        assert_eq!(opts.evaluate, Some(true));
    }

    #[test]
    fn deserializes_partial_option_maps() {
        let opts: ChunkOptions =
            serde_json::from_str(r#"{"name": "chunk2", "fig": true, "cache": true}"#).unwrap();
        assert_eq!(opts.fig, Some(true));
        assert_eq!(opts.cache, Some(true));
        assert_eq!(opts.complete, None);
    }

    #[test]
    fn unknown_options_survive_merge_but_not_fingerprint() {
        let local: ChunkOptions = serde_json::from_str(
            r#"{"name": "fig1", "wrap": "code", "label": "fig:one", "engine": "python"}"#,
        )
        .unwrap();
        assert_eq!(local.extra.len(), 3);

        let merged = local.merged_over(&default_options());
        assert_eq!(merged.extra["label"], "fig:one");
        assert!(merged.semantic().extra.is_empty());

        let json = serde_json::to_value(&merged).unwrap();
        assert_eq!(json["wrap"], "code");
        assert_eq!(json["engine"], "python");
        assert_eq!(json["dpi"], 200);
    }
}
