use serde::{Deserialize, Serialize};

use crate::model::output::Output;

/// What the cache keeps for one chunk position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub comparison_key: String,
    pub outputs: Vec<Output>,

    /// Per-statement results for chunks executed in term mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<TermSegment>,
}

/// A group of statements and the output the last of them produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermSegment {
    pub source: String,
    pub outputs: Vec<Output>,
}

impl CacheRecord {
    pub fn new(comparison_key: String, outputs: Vec<Output>) -> Self {
        Self {
            comparison_key,
            outputs,
            transcript: Vec::new(),
        }
    }

    pub fn from_transcript(comparison_key: String, transcript: Vec<TermSegment>) -> Self {
        let outputs = transcript
            .iter()
            .flat_map(|seg| seg.outputs.iter().cloned())
            .collect();
        Self {
            comparison_key,
            outputs,
            transcript,
        }
    }
}
