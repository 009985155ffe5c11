//! Model lifecycle and runtime orchestration
//!
//! - [`lifecycle`]: the capability contract and the locking wrapper around it
//! - [`runtime`]: observable per-instance runtime state
//! - [`registry`]: named slots, lazy instantiation, credential propagation
//! - [`download`], [`fetch`], [`retry`]: artifact acquisition with progress
//! - [`served`]: models hosted by an external inference server

pub mod cache;
pub mod download;
pub mod fetch;
pub mod lifecycle;
pub mod metadata;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod served;

pub use cache::{cache_repo_dir, is_repo_cached, list_cached_models};
pub use download::{ProgressSink, SnapshotRequest, download_snapshot, format_bytes, map_progress};
pub use fetch::{ArtifactFetcher, FetchRequest, HfHubFetcher, ProgressCallback};
pub use lifecycle::{InferInput, InferOutput, ManagedModel, ModelBackend, ModelContext};
pub use metadata::{ModelMetadata, ModelTask};
pub use registry::{ModelFactory, ModelRegistry, ModelStatusEntry, SlotContext, SlotDefinition};
pub use retry::{RetryPolicy, fetch_with_retry};
pub use runtime::{LifecycleState, Patch, RuntimeState, RuntimeTracker, RuntimeUpdate};
pub use served::{ServedBackend, ServedDeps};
