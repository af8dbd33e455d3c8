use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single structured result produced by the backend.
///
/// Runtime faults in user code arrive as [`Output::Error`]; they are data,
/// not engine failures, and get cached like any other output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: String,
        text: String,
    },

    DisplayData {
        data: BTreeMap<String, Value>,
        #[serde(default)]
        metadata: BTreeMap<String, Value>,
    },

    ExecuteResult {
        #[serde(default)]
        execution_count: Option<u32>,
        data: BTreeMap<String, Value>,
        #[serde(default)]
        metadata: BTreeMap<String, Value>,
    },

    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: "stdout".into(),
            text: text.into(),
        }
    }

    pub fn plain_result(text: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), Value::String(text.into()));
        Output::ExecuteResult {
            execution_count: None,
            data,
            metadata: BTreeMap::new(),
        }
    }

    pub fn error(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        let ename = ename.into();
        let evalue = evalue.into();
        Output::Error {
            traceback: vec![format!("{}: {}", ename, evalue)],
            ename,
            evalue,
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Output::Stream { .. } => "stream",
            Output::DisplayData { .. } => "display_data",
            Output::ExecuteResult { .. } => "execute_result",
            Output::Error { .. } => "error",
        }
    }

    pub fn is_display_data(&self) -> bool {
        matches!(self, Output::DisplayData { .. })
    }

    pub fn data(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn plain_text(&self) -> Option<&str> {
        self.data()
            .and_then(|d| d.get("text/plain"))
            .and_then(|v| v.as_str())
    }
}

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid ANSI pattern"))
}

pub fn strip_ansi(text: &str) -> String {
    ansi_escape().replace_all(text, "").into_owned()
}

/// Render outputs as the plain text substituted for an inline expression.
///
/// Streams and `text/plain` data are concatenated, error tracebacks are
/// joined with ANSI colour codes removed. Rich-only data (e.g. a bare
/// image) renders as nothing.
pub fn render_inline(outputs: &[Output]) -> String {
    let mut result = String::new();

    for out in outputs {
        match out {
            Output::Stream { text, .. } => result.push_str(text),
            Output::Error { traceback, .. } => result.push_str(&strip_ansi(&traceback.join(""))),
            other => {
                if let Some(text) = other.plain_text() {
                    result.push_str(text);
                }
            }
        }
    }

    result
}
