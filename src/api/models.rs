//! API request and response models

use crate::gpu::GpuDevice;
use crate::models::ModelStatusEntry;
use crate::system::SystemMetrics;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Optional body of a load request
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Preferred accelerator ids, most preferred first
    #[serde(default)]
    pub gpu_device_ids: Option<Vec<u32>>,
}

/// Registry listing returned by the lifecycle endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub models: Vec<ModelStatusEntry>,
}

/// Dashboard payload: detected GPUs plus every model slot
#[derive(Debug, Serialize, Deserialize)]
pub struct DashboardStatus {
    pub gpus: Vec<GpuDevice>,
    pub system: SystemMetrics,
    pub models: Vec<ModelStatusEntry>,
    /// Identifiers present in the artifact cache, declared or not
    pub cached_models: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenStatus {
    pub has_token: bool,
}

/// Token update; a missing or blank token clears the stored one
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenUpdate {
    #[serde(default)]
    pub token: Option<String>,
}

/// Query parameters accepted alongside raw audio bodies
#[derive(Debug, Default, Deserialize)]
pub struct AudioQuery {
    #[serde(default)]
    pub sampling_rate: Option<u32>,
}

/// OpenAI-style text completion request
#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Slot key or model identifier; the chat-completion slot when absent
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
}

fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f64 {
    0.7
}
fn default_top_p() -> f64 {
    0.9
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    pub finish_reason: String,
}

/// Whitespace-delimited token counts
#[derive(Debug, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn from_texts(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = prompt.split_whitespace().count();
        let completion_tokens = completion.split_whitespace().count();
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}
