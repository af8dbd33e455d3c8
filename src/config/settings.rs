use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::options::{default_options, ChunkOptions};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WeaveSettings {
    /// Global caching flag. A chunk caches only if this is on.
    pub caching: bool,

    /// Relative paths resolve against the document's directory.
    pub cache_dir: PathBuf,
    pub fig_dir: PathBuf,

    /// Per-call backend timeout. `None` waits forever.
    pub timeout_secs: Option<u64>,
    pub interrupt_on_timeout: bool,

    pub kernel_url: String,
    pub kernel_name: String,

    /// Evaluated by the kernel to print a symbol's source; `{symbol}` is
    /// replaced by the symbol name.
    pub introspect_template: String,

    /// Evaluated before each chunk when set; `{width}`, `{height}` and
    /// `{dpi}` come from the chunk's options.
    pub figure_setup: Option<String>,

    pub default_options: ChunkOptions,
}

impl Default for WeaveSettings {
    fn default() -> Self {
        Self {
            caching: false,
            cache_dir: PathBuf::from("cache"),
            fig_dir: PathBuf::from("figures"),
            timeout_secs: None,
            interrupt_on_timeout: true,
            kernel_url: "http://localhost:8888".into(),
            kernel_name: "python3".into(),
            introspect_template: "import inspect; print(inspect.getsource({symbol}))".into(),
            figure_setup: None,
            default_options: default_options(),
        }
    }
}

impl WeaveSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/* =========================
   Document location
   ========================= */

/// Where a source document lives; decides where its cache and figures go.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPaths {
    pub source: PathBuf,
    pub dir: PathBuf,
    /// File name up to the first `.`: `report.pmd` -> `report`.
    pub basename: String,
}

impl DocumentPaths {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let dir = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let basename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .and_then(|n| n.split('.').next().map(str::to_string))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "string_input".to_string());

        Self { source, dir, basename }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    pub fn cache_dir(&self, settings: &WeaveSettings) -> PathBuf {
        self.resolve(&settings.cache_dir)
    }

    pub fn fig_dir(&self, settings: &WeaveSettings) -> PathBuf {
        self.resolve(&settings.fig_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_stops_at_first_dot() {
        let doc = DocumentPaths::new("/work/notes/report.tex.pmd");
        assert_eq!(doc.basename, "report");
        assert_eq!(doc.dir, PathBuf::from("/work/notes"));

        let settings = WeaveSettings::default();
        assert_eq!(doc.cache_dir(&settings), PathBuf::from("/work/notes/cache"));
    }

    #[test]
    fn absolute_cache_dir_is_kept() {
        let doc = DocumentPaths::new("report.pmd");
        let settings = WeaveSettings {
            cache_dir: PathBuf::from("/var/cache/weave"),
            ..WeaveSettings::default()
        };
        assert_eq!(doc.cache_dir(&settings), PathBuf::from("/var/cache/weave"));
        assert_eq!(doc.fig_dir(&settings), PathBuf::from("figures"));
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let settings: WeaveSettings = serde_json::from_str(r#"{"caching": true}"#).unwrap();
        assert!(settings.caching);
        assert_eq!(settings.kernel_name, "python3");
        assert_eq!(settings.default_options.dpi, Some(200));
    }
}
