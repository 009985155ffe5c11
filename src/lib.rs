//! Model Gateway - on-demand model lifecycle orchestration
//!
//! Serves a catalog of heavyweight models (chat, speech-to-text, speaker
//! diarization) behind one HTTP API. Models are instantiated lazily, their
//! artifacts fetched with retry and progress reporting, and their runtimes
//! loaded and unloaded under per-instance locks.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod gpu;
pub mod health;
pub mod metrics;
pub mod models;
pub mod process;
pub mod system;
pub mod token_store;

pub use config::{GatewayConfig, ServedModelConfig};
pub use error::{ApiError, FetchError, ModelError, ModelResult, RegistryError, RegistryResult};
pub use models::{
    InferInput, InferOutput, ManagedModel, ModelBackend, ModelContext, ModelMetadata,
    ModelRegistry, ModelTask, RuntimeState,
};
pub use token_store::TokenStore;
