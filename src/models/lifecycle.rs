//! Model capability contract and the lifecycle wrapper around it
//!
//! Concrete models implement [`ModelBackend`]. They never manage locking
//! themselves: [`ManagedModel`] owns the exclusivity lock and applies the
//! double-checked protocol for load, download and unload once, for every model.
//!
//! Transitions run on spawned tasks. A caller that stops waiting (client
//! disconnect) does not cancel the transition; it finishes and leaves the
//! instance in `ready`, `idle` or `error` for the next caller to observe.

use super::cache;
use super::metadata::ModelMetadata;
use super::runtime::{LifecycleState, RuntimeState, RuntimeTracker, RuntimeUpdate};
use crate::error::{ModelError, ModelResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;

/// Everything a backend needs for one call, passed explicitly
#[derive(Debug, Clone)]
pub struct ModelContext {
    pub metadata: Arc<ModelMetadata>,
    pub cache_dir: PathBuf,
    pub hf_token: Option<String>,
    /// Ordered accelerator preference, most preferred first
    pub device_ids: Vec<u32>,
    pub runtime: Arc<RuntimeTracker>,
}

impl ModelContext {
    pub fn update_runtime(&self, update: RuntimeUpdate) {
        self.runtime.update(update);
    }

    pub fn primary_device(&self) -> Option<u32> {
        self.device_ids.first().copied()
    }

    pub fn cache_repo_dir(&self) -> PathBuf {
        cache::cache_repo_dir(&self.cache_dir, &self.metadata.identifier)
    }
}

/// Payload for one unit of inference work
#[derive(Debug, Clone)]
pub enum InferInput {
    Json(serde_json::Value),
    Audio {
        bytes: Vec<u8>,
        sampling_rate: Option<u32>,
    },
}

pub type InferOutput = serde_json::Value;

/// Capability contract every concrete model satisfies
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Acquire artifacts and initialize the runtime. Only ever invoked by
    /// [`ManagedModel`] while holding the exclusivity lock and not loaded.
    async fn load(&self, ctx: &ModelContext) -> ModelResult<()>;

    /// Acquire artifacts without initializing the runtime
    async fn download(&self, ctx: &ModelContext) -> ModelResult<()>;

    /// Release runtime resources. Must tolerate a partially loaded runtime.
    async fn unload(&self, ctx: &ModelContext) -> ModelResult<()>;

    /// Run one unit of work against a loaded runtime
    async fn infer(&self, ctx: &ModelContext, input: InferInput) -> ModelResult<InferOutput>;

    /// On-disk artifact presence
    fn is_downloaded(&self, ctx: &ModelContext) -> bool {
        cache::is_repo_cached(&ctx.cache_dir, &ctx.metadata.identifier)
    }
}

/// Lifecycle wrapper owning the locking protocol for one model instance
pub struct ManagedModel {
    metadata: Arc<ModelMetadata>,
    backend: Arc<dyn ModelBackend>,
    cache_dir: PathBuf,
    hf_token: RwLock<Option<String>>,
    device_ids: RwLock<Vec<u32>>,
    /// Devices the live runtime was started on; `None` while unloaded
    active_device_ids: RwLock<Option<Vec<u32>>>,
    /// Flips false->true->false only while `lifecycle` is held
    loaded: AtomicBool,
    /// Serializes load/download/unload transitions
    lifecycle: Mutex<()>,
    /// Serializes inference calls; unload takes it so no call sees a torn-down runtime
    inference: Mutex<()>,
    runtime: Arc<RuntimeTracker>,
}

impl ManagedModel {
    pub fn new(
        metadata: Arc<ModelMetadata>,
        backend: Arc<dyn ModelBackend>,
        cache_dir: PathBuf,
        hf_token: Option<String>,
        device_ids: Vec<u32>,
    ) -> Self {
        let model = Self {
            metadata,
            backend,
            cache_dir,
            hf_token: RwLock::new(hf_token),
            device_ids: RwLock::new(device_ids),
            active_device_ids: RwLock::new(None),
            loaded: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            inference: Mutex::new(()),
            runtime: Arc::new(RuntimeTracker::default()),
        };
        let downloaded = model.is_downloaded();
        model
            .runtime
            .update(RuntimeUpdate::new().downloaded(downloaded));
        model
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn preferred_device_ids(&self) -> Vec<u32> {
        self.device_ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn primary_device(&self) -> Option<u32> {
        self.preferred_device_ids().first().copied()
    }

    /// Device preference the running runtime was loaded with
    pub fn active_device_ids(&self) -> Option<Vec<u32>> {
        self.active_device_ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_active_device_ids(&self, device_ids: Option<Vec<u32>>) {
        *self
            .active_device_ids
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = device_ids;
    }

    /// Replace the ordered device preference. Returns whether it changed.
    ///
    /// Never reloads. [`ensure_loaded_on`](Self::ensure_loaded_on) moves a
    /// loaded runtime onto a new preference.
    pub fn update_device_preferences(&self, device_ids: &[u32]) -> bool {
        let mut current = self
            .device_ids
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_slice() == device_ids {
            return false;
        }
        *current = device_ids.to_vec();
        true
    }

    pub fn set_hf_token(&self, token: Option<String>) {
        *self
            .hf_token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    pub fn hf_token(&self) -> Option<String> {
        self.hf_token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn context(&self) -> ModelContext {
        ModelContext {
            metadata: self.metadata.clone(),
            cache_dir: self.cache_dir.clone(),
            hf_token: self.hf_token(),
            device_ids: self.preferred_device_ids(),
            runtime: self.runtime.clone(),
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.backend.is_downloaded(&self.context())
    }

    pub fn update_runtime(&self, update: RuntimeUpdate) {
        self.runtime.update(update);
    }

    /// Snapshot with `downloaded` reconciled against the disk at read time
    pub fn runtime_status(&self) -> RuntimeState {
        let mut snapshot = self.runtime.snapshot();
        snapshot.downloaded = snapshot.downloaded || self.is_downloaded();
        snapshot
    }

    /// Load the model unless already loaded
    pub async fn ensure_loaded(self: &Arc<Self>) -> ModelResult<()> {
        // Stale "not loaded" reads only cost a redundant lock acquisition
        if self.is_loaded() {
            return Ok(());
        }
        let this = Arc::clone(self);
        join_transition(tokio::spawn(async move { this.load_transition().await }).await)
    }

    /// Load the model on `device_ids`, reloading a runtime that lives elsewhere
    ///
    /// The preference update, the comparison against the live placement and
    /// any reload all happen under the exclusivity lock, so a load already in
    /// flight on other devices is moved once it completes.
    pub async fn ensure_loaded_on(self: &Arc<Self>, device_ids: Option<&[u32]>) -> ModelResult<()> {
        let Some(device_ids) = device_ids.map(<[u32]>::to_vec) else {
            return self.ensure_loaded().await;
        };
        if self.is_loaded() && self.active_device_ids().as_deref() == Some(device_ids.as_slice()) {
            return Ok(());
        }
        let this = Arc::clone(self);
        join_transition(
            tokio::spawn(async move { this.placement_transition(device_ids).await }).await,
        )
    }

    /// Fetch artifacts unless already present on disk
    pub async fn ensure_downloaded(self: &Arc<Self>) -> ModelResult<()> {
        if self.is_downloaded() {
            return Ok(());
        }
        let this = Arc::clone(self);
        join_transition(tokio::spawn(async move { this.download_transition().await }).await)
    }

    /// Release runtime resources, keeping artifacts on disk
    pub async fn unload(self: &Arc<Self>) -> ModelResult<()> {
        let this = Arc::clone(self);
        join_transition(tokio::spawn(async move { this.unload_transition().await }).await)
    }

    /// Run one inference call, loading first if needed
    pub async fn infer(self: &Arc<Self>, input: InferInput) -> ModelResult<InferOutput> {
        loop {
            self.ensure_loaded().await?;
            let _guard = self.inference.lock().await;
            // An unload may have slipped in between load and the guard
            if !self.is_loaded() {
                continue;
            }
            return self.backend.infer(&self.context(), input).await;
        }
    }

    async fn placement_transition(&self, device_ids: Vec<u32>) -> ModelResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.update_device_preferences(&device_ids);

        if self.is_loaded() && self.active_device_ids().as_deref() != Some(device_ids.as_slice()) {
            tracing::info!(
                model = %self.metadata.identifier,
                from = ?self.active_device_ids(),
                to = ?device_ids,
                "Device preference changed, reloading"
            );
            self.unload_locked().await?;
        }
        self.load_locked().await
    }

    async fn load_transition(&self) -> ModelResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.load_locked().await
    }

    /// Caller holds `lifecycle`
    async fn load_locked(&self) -> ModelResult<()> {
        if self.is_loaded() {
            return Ok(());
        }

        let ctx = self.context();
        let identifier = self.metadata.identifier.as_str();
        self.runtime.update(
            RuntimeUpdate::new()
                .state(LifecycleState::Loading)
                .progress(5)
                .status("Preparing model load")
                .downloaded(self.backend.is_downloaded(&ctx)),
        );

        tracing::info!(
            model = %identifier,
            device_ids = ?ctx.device_ids,
            "Loading model"
        );
        let started = Instant::now();

        match self.backend.load(&ctx).await {
            Ok(()) => {
                self.set_active_device_ids(Some(ctx.device_ids.clone()));
                self.loaded.store(true, Ordering::SeqCst);
                self.runtime.update(
                    RuntimeUpdate::new()
                        .state(LifecycleState::Ready)
                        .progress(100)
                        .status("Model ready")
                        .downloaded(true)
                        .clear_last_error(),
                );
                let elapsed = started.elapsed();
                crate::metrics::record_model_load(identifier, "success", elapsed);
                tracing::info!(
                    model = %identifier,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Model loaded"
                );
                Ok(())
            }
            Err(e) => {
                self.runtime.update(
                    RuntimeUpdate::new()
                        .state(LifecycleState::Error)
                        .progress(0)
                        .status(format!("Load failed: {}", e))
                        .last_error(e.to_string()),
                );
                crate::metrics::record_model_load(identifier, "failure", started.elapsed());
                tracing::error!(model = %identifier, error = %e, "Model load failed");
                Err(e)
            }
        }
    }

    async fn download_transition(&self) -> ModelResult<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_downloaded() {
            return Ok(());
        }

        let ctx = self.context();
        let identifier = self.metadata.identifier.as_str();
        // A loaded model keeps showing "ready" while artifacts are refreshed
        let was_loaded = self.is_loaded();

        let mut starting = RuntimeUpdate::new()
            .status("Downloading artifacts")
            .downloaded(false);
        if !was_loaded {
            starting = starting.state(LifecycleState::Loading).progress(5);
        }
        self.runtime.update(starting);

        tracing::info!(model = %identifier, "Downloading model artifacts");

        match self.backend.download(&ctx).await {
            Ok(()) => {
                let done = if was_loaded {
                    RuntimeUpdate::new().status("Model ready").progress(100)
                } else {
                    RuntimeUpdate::new()
                        .state(LifecycleState::Idle)
                        .progress(0)
                        .status("Artifacts cached")
                };
                self.runtime
                    .update(done.downloaded(true).clear_last_error());
                crate::metrics::record_model_download(identifier, "success");
                tracing::info!(model = %identifier, "Model artifacts downloaded");
                Ok(())
            }
            Err(e) => {
                let mut failed = RuntimeUpdate::new()
                    .status(format!("Download failed: {}", e))
                    .downloaded(self.backend.is_downloaded(&ctx))
                    .last_error(e.to_string());
                if !was_loaded {
                    failed = failed.state(LifecycleState::Error).progress(0);
                }
                self.runtime.update(failed);
                crate::metrics::record_model_download(identifier, "failure");
                tracing::error!(model = %identifier, error = %e, "Model download failed");
                Err(e)
            }
        }
    }

    async fn unload_transition(&self) -> ModelResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.unload_locked().await
    }

    /// Caller holds `lifecycle`
    async fn unload_locked(&self) -> ModelResult<()> {
        let _inference = self.inference.lock().await;

        let ctx = self.context();
        let current = self.runtime.snapshot().state;
        if !self.is_loaded() && current == LifecycleState::Idle {
            // Nothing to release
            self.runtime.update(RuntimeUpdate::new());
            return Ok(());
        }

        let identifier = self.metadata.identifier.as_str();
        let was_loaded = self.is_loaded();
        if let Err(e) = self.backend.unload(&ctx).await {
            self.runtime.update(
                RuntimeUpdate::new()
                    .status(format!("Unload failed: {}", e))
                    .last_error(e.to_string()),
            );
            tracing::error!(model = %identifier, error = %e, "Model unload failed");
            return Err(e);
        }

        self.loaded.store(false, Ordering::SeqCst);
        self.set_active_device_ids(None);
        self.runtime.update(
            RuntimeUpdate::new()
                .state(LifecycleState::Idle)
                .progress(0)
                .status("Model unloaded")
                .clear_server()
                .downloaded(self.backend.is_downloaded(&ctx)),
        );
        if was_loaded {
            crate::metrics::record_model_unload(identifier);
        }
        tracing::info!(model = %identifier, "Model unloaded");
        Ok(())
    }
}

impl std::fmt::Debug for ManagedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedModel")
            .field("identifier", &self.metadata.identifier)
            .field("loaded", &self.is_loaded())
            .field("device_ids", &self.preferred_device_ids())
            .finish()
    }
}

fn join_transition(
    result: Result<ModelResult<()>, tokio::task::JoinError>,
) -> ModelResult<()> {
    result.map_err(|e| ModelError::runtime(format!("lifecycle task failed: {}", e)))?
}
