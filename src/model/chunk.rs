use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::options::ChunkOptions;
use crate::model::output::Output;

/// One unit of a parsed document, as produced by the parser.
///
/// `number` is the document-order position and doubles as the cache key.
/// Chunks of any other `type` are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    Doc(DocChunk),
    Code(CodeChunk),
    #[serde(untagged)]
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChunk {
    pub number: u32,

    #[serde(default)]
    pub start_line: Option<u32>,

    pub content: String,

    /// Parser fields the engine does not read, such as doc-chunk `options`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChunk {
    pub number: u32,

    #[serde(default)]
    pub start_line: Option<u32>,

    pub content: String,

    #[serde(default)]
    pub options: ChunkOptions,

    #[serde(default)]
    pub inline: bool,

    // Filled in by the engine.
    #[serde(default)]
    pub outputs: Vec<Output>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figure: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Chunk {
    pub fn number(&self) -> Option<u32> {
        match self {
            Chunk::Doc(doc) => Some(doc.number),
            Chunk::Code(code) => Some(code.number),
            Chunk::Other(raw) => raw
                .get("number")
                .and_then(|n| n.as_u64())
                .and_then(|n| u32::try_from(n).ok()),
        }
    }

    pub fn as_code(&self) -> Option<&CodeChunk> {
        match self {
            Chunk::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_doc(&self) -> Option<&DocChunk> {
        match self {
            Chunk::Doc(doc) => Some(doc),
            _ => None,
        }
    }
}

impl DocChunk {
    pub fn new(number: u32, content: impl Into<String>) -> Self {
        Self {
            number,
            start_line: None,
            content: content.into(),
            extra: BTreeMap::new(),
        }
    }
}

impl CodeChunk {
    pub fn new(number: u32, content: impl Into<String>, options: ChunkOptions) -> Self {
        Self {
            number,
            start_line: None,
            content: content.into(),
            options,
            inline: false,
            outputs: Vec::new(),
            from_cache: None,
            figure: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn label(&self) -> String {
        self.options
            .name
            .clone()
            .unwrap_or_else(|| format!("chunk{}", self.number))
    }
}
