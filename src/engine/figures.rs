use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::model::chunk::CodeChunk;

/// Turns a chunk's `display_data` outputs into figure references for the
/// renderer. Called only for chunks with `fig` set.
pub trait FigureSink {
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn materialize(&mut self, chunk: &CodeChunk) -> Result<Vec<String>>;
}

/// Records nothing; the renderer reads figures straight from the outputs.
#[derive(Debug, Default)]
pub struct NullFigureSink;

impl FigureSink for NullFigureSink {
    fn materialize(&mut self, _chunk: &CodeChunk) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Writes image payloads to `<fig_dir>/<basename>_<label>_<n>.<ext>`.
#[derive(Debug)]
pub struct FileFigureSink {
    fig_dir: PathBuf,
    basename: String,
}

impl FileFigureSink {
    pub fn new(fig_dir: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        Self {
            fig_dir: fig_dir.into(),
            basename: basename.into(),
        }
    }
}

impl FigureSink for FileFigureSink {
    fn prepare(&mut self) -> Result<()> {
        fs::create_dir_all(&self.fig_dir)
            .with_context(|| format!("creating figure directory {}", self.fig_dir.display()))
    }

    fn materialize(&mut self, chunk: &CodeChunk) -> Result<Vec<String>> {
        let mut written = Vec::new();

        let figures = chunk.outputs.iter().filter(|o| o.is_display_data());
        for (i, out) in figures.enumerate() {
            let Some(data) = out.data() else { continue };

            let stem = format!("{}_{}_{}", self.basename, chunk.label(), i + 1);

            let path = if let Some(png) = data.get("image/png").and_then(|v| v.as_str()) {
                let bytes = STANDARD
                    .decode(png.split_whitespace().collect::<String>())
                    .with_context(|| format!("decoding PNG data of chunk {}", chunk.number))?;
                let path = self.fig_dir.join(format!("{}.png", stem));
                fs::write(&path, bytes)?;
                path
            } else if let Some(svg) = data.get("image/svg+xml").and_then(|v| v.as_str()) {
                let path = self.fig_dir.join(format!("{}.svg", stem));
                fs::write(&path, svg)?;
                path
            } else {
                continue;
            };

            written.push(path.display().to_string());
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::options::ChunkOptions;
    use crate::model::output::Output;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn display(mime: &str, payload: &str) -> Output {
        let mut data = BTreeMap::new();
        data.insert(mime.to_string(), json!(payload));
        Output::DisplayData {
            data,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn writes_png_and_svg_figures() {
        let dir = tempdir().expect("tempdir");
        let mut sink = FileFigureSink::new(dir.path().join("figures"), "report");
        sink.prepare().unwrap();

        let mut chunk = CodeChunk::new(
            4,
            "plot()",
            ChunkOptions { name: Some("trend".into()), ..ChunkOptions::default() },
        );
        chunk.outputs = vec![
            Output::stdout("drawing\n"),
            display("image/png", &STANDARD.encode(b"\x89PNG fake")),
            display("image/svg+xml", "<svg/>"),
            display("text/html", "<b>no image</b>"),
        ];

        let written = sink.materialize(&chunk).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("report_trend_1.png"));
        assert!(written[1].ends_with("report_trend_2.svg"));
        assert_eq!(fs::read(&written[0]).unwrap(), b"\x89PNG fake");
    }
}
