use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One web-search hit, in provider ranking order. Fields pass through the
/// provider verbatim; no deduplication happens anywhere downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

/// A fully materialized answer session. Constructed only once sources,
/// answer and related topics have all resolved; a partially resolved
/// session is never observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSession {
    pub question: String,
    pub sources: Vec<SourceItem>,
    pub answer: String,
    pub similar_topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImageResult {
    pub artifact_path: PathBuf,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileAnalysisResult {
    Image {
        description: String,
        /// Provider metadata (detected objects), passed through opaquely.
        detected_objects: Value,
    },
    Code {
        explanation: String,
    },
}

/// The single piece of shared mutable state. Exactly one variant at a
/// time; only the engine transitions it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Loading,
    Search(SearchSession),
    Image(GeneratedImageResult),
    File(FileAnalysisResult),
    Error(String),
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Search(_) => "search",
            Self::Image(_) => "image",
            Self::File(_) => "file",
            Self::Error(_) => "error",
        }
    }
}
