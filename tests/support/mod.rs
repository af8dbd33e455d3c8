#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chunk_weaver::model::cache_record::CacheRecord;
use chunk_weaver::{Backend, BackendError, Chunk, ChunkOptions, CodeChunk, DocChunk, Output};
use serde_json::json;

/// A tiny line-oriented interpreter standing in for a kernel.
///
/// Understands `name = <int>`, `print(name)`, a bare `name`, `plot()`,
/// `fail()` and `hang()`; any other line runs silently. State is wiped on
/// `open`, like a freshly started kernel.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    pub vars: HashMap<String, i64>,
    pub sources: HashMap<String, String>,
    pub evaluated: Vec<String>,
    pub opens: usize,
    pub closes: usize,
    pub interrupts: usize,
    pub interrupt_fails: bool,
    pub saved_states: Vec<u32>,
    pub loaded_states: Vec<u32>,
    pub pre_hooks: Vec<u32>,
    pub post_hooks: Vec<u32>,
    pub open: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(&mut self, line: &str) -> Result<Option<Output>, BackendError> {
        if line == "hang()" {
            return Err(BackendError::Timeout { after: Duration::from_secs(1) });
        }
        if line == "fail()" {
            return Ok(Some(Output::error("RuntimeError", "boom")));
        }
        if line == "plot()" {
            let mut data = BTreeMap::new();
            data.insert("image/png".to_string(), json!("iVBORw0KGgo="));
            data.insert("text/plain".to_string(), json!("<Figure>"));
            return Ok(Some(Output::DisplayData { data, metadata: BTreeMap::new() }));
        }
        if let Some(name) = line.strip_prefix("print(").and_then(|r| r.strip_suffix(')')) {
            return Ok(Some(match self.vars.get(name.trim()) {
                Some(v) => Output::stdout(format!("{}\n", v)),
                None => name_error(name.trim()),
            }));
        }
        if let Some((name, value)) = line.split_once('=') {
            if let Ok(value) = value.trim().parse::<i64>() {
                self.vars.insert(name.trim().to_string(), value);
                return Ok(None);
            }
        }
        if !line.is_empty() && line.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Ok(Some(match self.vars.get(line) {
                Some(v) => Output::plain_result(v.to_string()),
                None => name_error(line),
            }));
        }
        Ok(None)
    }
}

fn name_error(name: &str) -> Output {
    Output::error("NameError", format!("name '{}' is not defined", name))
}

impl Backend for ScriptedBackend {
    fn open(&mut self) -> Result<(), BackendError> {
        self.opens += 1;
        self.open = true;
        self.vars.clear();
        Ok(())
    }

    fn evaluate(&mut self, code: &str, _timeout: Option<Duration>) -> Result<Vec<Output>, BackendError> {
        if !self.open {
            return Err(BackendError::NotOpen);
        }
        self.evaluated.push(code.to_string());

        let mut outputs = Vec::new();
        for line in code.lines().map(str::trim) {
            if let Some(out) = self.line(line)? {
                let is_error = matches!(out, Output::Error { .. });
                outputs.push(out);
                if is_error {
                    break;
                }
            }
        }
        Ok(outputs)
    }

    fn introspect(&mut self, symbol: &str) -> Result<String, BackendError> {
        self.sources
            .get(symbol)
            .cloned()
            .ok_or_else(|| BackendError::Protocol(format!("no source for {}", symbol)))
    }

    fn interrupt(&mut self) -> Result<(), BackendError> {
        self.interrupts += 1;
        if self.interrupt_fails {
            Err(BackendError::Protocol("kernel unresponsive".into()))
        } else {
            Ok(())
        }
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.closes += 1;
        self.open = false;
        Ok(())
    }

    fn pre_run_hook(&mut self, chunk: &CodeChunk) -> Result<(), BackendError> {
        self.pre_hooks.push(chunk.number);
        Ok(())
    }

    fn post_run_hook(&mut self, chunk: &CodeChunk) -> Result<(), BackendError> {
        self.post_hooks.push(chunk.number);
        Ok(())
    }

    fn save_chunk_state(&mut self, chunk: &CodeChunk, _record: &CacheRecord) {
        self.saved_states.push(chunk.number);
    }

    fn load_chunk_state(&mut self, chunk: &CodeChunk, _record: &CacheRecord) {
        self.loaded_states.push(chunk.number);
    }
}

/* =========================
   Chunk builders
   ========================= */

pub fn code(number: u32, content: &str, options: ChunkOptions) -> Chunk {
    Chunk::Code(CodeChunk::new(number, content, options))
}

pub fn doc(number: u32, content: &str) -> Chunk {
    Chunk::Doc(DocChunk::new(number, content))
}

pub fn cached(cache: bool) -> ChunkOptions {
    ChunkOptions { cache: Some(cache), ..ChunkOptions::default() }
}

pub fn code_chunks(executed: &[Chunk]) -> Vec<CodeChunk> {
    executed.iter().filter_map(Chunk::as_code).cloned().collect()
}
