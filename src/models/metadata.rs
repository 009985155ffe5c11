//! Static identity records for registry slots

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Task a model slot declares. Also the key of the registry's task index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelTask {
    ChatCompletion,
    SpeechToText,
    SpeakerDiarization,
    Other(String),
}

impl ModelTask {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ChatCompletion => "chat-completion",
            Self::SpeechToText => "speech-to-text",
            Self::SpeakerDiarization => "speaker-diarization",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for ModelTask {
    fn from(value: &str) -> Self {
        match value {
            "chat-completion" => Self::ChatCompletion,
            "speech-to-text" => Self::SpeechToText,
            "speaker-diarization" => Self::SpeakerDiarization,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ModelTask {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<ModelTask> for String {
    fn from(task: ModelTask) -> Self {
        task.as_str().to_string()
    }
}

impl fmt::Display for ModelTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of a model slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Globally unique artifact name (e.g., "nvidia/canary-1b-v2")
    pub identifier: String,
    pub task: ModelTask,
    #[serde(default)]
    pub description: String,
    /// Accepted input/output encoding
    #[serde(default)]
    pub format: String,
    /// Extra declared capabilities
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl ModelMetadata {
    pub fn new(identifier: impl Into<String>, task: impl Into<ModelTask>) -> Self {
        Self {
            identifier: identifier.into(),
            task: task.into(),
            description: String::new(),
            format: String::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}
