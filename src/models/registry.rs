//! Model registry: logical key -> slot with a lazily built instance
//!
//! The registry owns the cross-cutting configuration (cache root, credential)
//! and hands it to factories explicitly through [`SlotContext`] when a slot is
//! first touched. Lookup failures are local and side-effect-free; model
//! failures pass through verbatim after the instance has recorded them.

use super::cache;
use super::lifecycle::{ManagedModel, ModelBackend};
use super::metadata::{ModelMetadata, ModelTask};
use super::runtime::RuntimeState;
use crate::error::{ModelError, ModelResult, RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Configuration a factory receives when its slot is instantiated
#[derive(Debug, Clone)]
pub struct SlotContext {
    pub key: String,
    pub metadata: Arc<ModelMetadata>,
    pub cache_dir: PathBuf,
    pub hf_token: Option<String>,
}

/// Builds the backend for a slot on first access
pub trait ModelFactory: Send + Sync {
    fn create(&self, ctx: &SlotContext) -> ModelResult<Arc<dyn ModelBackend>>;
}

impl<F> ModelFactory for F
where
    F: Fn(&SlotContext) -> ModelResult<Arc<dyn ModelBackend>> + Send + Sync,
{
    fn create(&self, ctx: &SlotContext) -> ModelResult<Arc<dyn ModelBackend>> {
        self(ctx)
    }
}

/// Declared slot used to (re)build the catalog in [`ModelRegistry::configure`]
#[derive(Clone)]
pub struct SlotDefinition {
    pub key: String,
    pub metadata: ModelMetadata,
    pub factory: Arc<dyn ModelFactory>,
}

impl SlotDefinition {
    pub fn new(
        key: impl Into<String>,
        metadata: ModelMetadata,
        factory: impl ModelFactory + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            metadata,
            factory: Arc::new(factory),
        }
    }
}

impl std::fmt::Debug for SlotDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotDefinition")
            .field("key", &self.key)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

struct ModelSlot {
    metadata: Arc<ModelMetadata>,
    factory: Arc<dyn ModelFactory>,
    instance: Option<Arc<ManagedModel>>,
}

/// Dashboard row: static metadata merged with a runtime snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatusEntry {
    pub key: String,
    pub identifier: String,
    pub task: ModelTask,
    pub loaded: bool,
    pub description: String,
    pub format: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub runtime: RuntimeState,
}

#[derive(Default)]
struct RegistryInner {
    cache_dir: PathBuf,
    hf_token: Option<String>,
    /// Declaration order, used for status listings
    order: Vec<String>,
    slots: HashMap<String, ModelSlot>,
    task_index: HashMap<ModelTask, String>,
}

impl RegistryInner {
    fn slot_context(&self, key: &str, metadata: &Arc<ModelMetadata>) -> SlotContext {
        SlotContext {
            key: key.to_string(),
            metadata: metadata.clone(),
            cache_dir: self.cache_dir.clone(),
            hf_token: self.hf_token.clone(),
        }
    }

    fn insert(&mut self, key: String, metadata: ModelMetadata, factory: Arc<dyn ModelFactory>) {
        if !self.task_index.contains_key(&metadata.task) {
            self.task_index
                .insert(metadata.task.clone(), key.clone());
        } else {
            tracing::debug!(key = %key, task = %metadata.task, "Task already served by another slot");
        }
        self.order.push(key.clone());
        self.slots.insert(
            key,
            ModelSlot {
                metadata: Arc::new(metadata),
                factory,
                instance: None,
            },
        );
    }

    fn instances(&self) -> Vec<Arc<ManagedModel>> {
        self.order
            .iter()
            .filter_map(|key| self.slots.get(key))
            .filter_map(|slot| slot.instance.clone())
            .collect()
    }
}

/// Single authoritative map from model key to slot
pub struct ModelRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ModelRegistry {
    /// Empty registry; the cache root is created by [`configure`](Self::configure)
    pub fn new(cache_dir: impl Into<PathBuf>, hf_token: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                cache_dir: cache_dir.into(),
                hf_token,
                ..Default::default()
            })),
        }
    }

    /// Set cache root and credential, then rebuild the slot catalog
    ///
    /// Instances from the previous catalog are unloaded before being dropped.
    pub async fn configure(
        &self,
        hf_token: Option<String>,
        cache_dir: impl Into<PathBuf>,
        catalog: Vec<SlotDefinition>,
    ) -> RegistryResult<()> {
        let cache_dir = cache_dir.into();
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(ModelError::from)?;

        let mut seen = std::collections::HashSet::new();
        for definition in &catalog {
            if !seen.insert(definition.key.as_str()) {
                return Err(RegistryError::DuplicateKey {
                    key: definition.key.clone(),
                });
            }
        }

        let previous = {
            let mut inner = self.inner.write().await;
            let previous = inner.instances();
            *inner = RegistryInner {
                cache_dir: cache_dir.clone(),
                hf_token,
                ..Default::default()
            };
            for definition in catalog {
                inner.insert(definition.key, definition.metadata, definition.factory);
            }
            previous
        };

        unload_all(previous).await;
        tracing::info!(cache_dir = %cache_dir.display(), "Model registry configured");
        Ok(())
    }

    /// Add a slot; fails if the key is taken, leaving the existing slot intact
    pub async fn register(
        &self,
        key: impl Into<String>,
        metadata: ModelMetadata,
        factory: impl ModelFactory + 'static,
    ) -> RegistryResult<()> {
        let key = key.into();
        let mut inner = self.inner.write().await;
        if inner.slots.contains_key(&key) {
            return Err(RegistryError::DuplicateKey { key });
        }
        tracing::debug!(key = %key, identifier = %metadata.identifier, "Registering model slot");
        inner.insert(key, metadata, Arc::new(factory));
        Ok(())
    }

    /// Instance for `key`, built on first access
    pub async fn get(&self, key: &str) -> RegistryResult<Arc<ManagedModel>> {
        {
            let inner = self.inner.read().await;
            let slot = inner.slots.get(key).ok_or_else(|| RegistryError::UnknownKey {
                key: key.to_string(),
            })?;
            if let Some(instance) = &slot.instance {
                return Ok(instance.clone());
            }
        }

        let mut inner = self.inner.write().await;
        let (metadata, factory) = match inner.slots.get(key) {
            Some(slot) => {
                if let Some(instance) = &slot.instance {
                    return Ok(instance.clone());
                }
                (slot.metadata.clone(), slot.factory.clone())
            }
            None => {
                return Err(RegistryError::UnknownKey {
                    key: key.to_string(),
                });
            }
        };

        let ctx = inner.slot_context(key, &metadata);
        let backend = factory.create(&ctx)?;
        let instance = Arc::new(ManagedModel::new(
            metadata,
            backend,
            ctx.cache_dir,
            ctx.hf_token,
            Vec::new(),
        ));
        tracing::debug!(key = %key, "Instantiated model");

        if let Some(slot) = inner.slots.get_mut(key) {
            slot.instance = Some(instance.clone());
        }
        Ok(instance)
    }

    /// Instance serving `task`
    pub async fn get_by_task(&self, task: &ModelTask) -> RegistryResult<Arc<ManagedModel>> {
        let key = {
            let inner = self.inner.read().await;
            inner
                .task_index
                .get(task)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownTask {
                    task: task.to_string(),
                })?
        };
        self.get(&key).await
    }

    /// Load `key`, first applying a new device preference if one is given
    ///
    /// An instance running on other devices is unloaded before loading again
    /// on the new ones.
    pub async fn ensure_loaded(
        &self,
        key: &str,
        device_ids: Option<&[u32]>,
    ) -> RegistryResult<Arc<ManagedModel>> {
        let model = self.get(key).await?;
        model.ensure_loaded_on(device_ids).await?;
        Ok(model)
    }

    pub async fn ensure_downloaded(&self, key: &str) -> RegistryResult<Arc<ManagedModel>> {
        let model = self.get(key).await?;
        model.ensure_downloaded().await?;
        Ok(model)
    }

    /// Unload `key` if it was ever instantiated
    pub async fn unload(&self, key: &str) -> RegistryResult<()> {
        let instance = {
            let inner = self.inner.read().await;
            let slot = inner.slots.get(key).ok_or_else(|| RegistryError::UnknownKey {
                key: key.to_string(),
            })?;
            slot.instance.clone()
        };
        if let Some(model) = instance {
            model.unload().await?;
        }
        Ok(())
    }

    /// Swap the shared credential and push it into every built instance
    pub async fn set_hf_token(&self, hf_token: Option<String>) {
        let mut inner = self.inner.write().await;
        inner.hf_token = hf_token.clone();
        for instance in inner.instances() {
            instance.set_hf_token(hf_token.clone());
        }
        tracing::info!(has_token = hf_token.is_some(), "Updated HuggingFace credential");
    }

    pub async fn hf_token(&self) -> Option<String> {
        self.inner.read().await.hf_token.clone()
    }

    pub async fn cache_dir(&self) -> PathBuf {
        self.inner.read().await.cache_dir.clone()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    /// Slot key for a client-supplied model name, either a key or an identifier
    pub async fn resolve_key(&self, name: &str) -> Option<String> {
        let inner = self.inner.read().await;
        if inner.slots.contains_key(name) {
            return Some(name.to_string());
        }
        inner
            .order
            .iter()
            .find(|key| {
                inner
                    .slots
                    .get(key.as_str())
                    .is_some_and(|slot| slot.metadata.identifier == name)
            })
            .cloned()
    }

    /// One entry per declared slot, instantiated or not
    ///
    /// Disk checks run on the blocking pool after the registry lock is released.
    pub async fn status(&self) -> Vec<ModelStatusEntry> {
        let (rows, cache_dir) = {
            let inner = self.inner.read().await;
            let rows: Vec<SlotRow> = inner
                .order
                .iter()
                .filter_map(|key| {
                    inner.slots.get(key).map(|slot| SlotRow {
                        key: key.clone(),
                        metadata: slot.metadata.clone(),
                        instance: slot.instance.clone(),
                    })
                })
                .collect();
            (rows, inner.cache_dir.clone())
        };

        tokio::task::spawn_blocking(move || {
            rows.iter()
                .map(|row| status_entry(row, &cache_dir))
                .collect()
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Status collection failed");
            Vec::new()
        })
    }

    /// Unload every loaded instance
    pub async fn shutdown(&self) {
        let instances = self.inner.read().await.instances();
        unload_all(instances).await;
    }
}

/// Slot data copied out from under the registry lock
struct SlotRow {
    key: String,
    metadata: Arc<ModelMetadata>,
    instance: Option<Arc<ManagedModel>>,
}

fn status_entry(row: &SlotRow, cache_dir: &Path) -> ModelStatusEntry {
    let metadata = &row.metadata;
    let mut params = metadata.params.clone();

    let (loaded, runtime) = match &row.instance {
        Some(instance) => {
            params.insert(
                "device_ids".to_string(),
                serde_json::json!(instance.preferred_device_ids()),
            );
            (instance.is_loaded(), instance.runtime_status())
        }
        None => (
            false,
            RuntimeState::idle(cache::is_repo_cached(cache_dir, &metadata.identifier)),
        ),
    };

    ModelStatusEntry {
        key: row.key.clone(),
        identifier: metadata.identifier.clone(),
        task: metadata.task.clone(),
        loaded,
        description: metadata.description.clone(),
        format: metadata.format.clone(),
        params,
        runtime,
    }
}

async fn unload_all(instances: Vec<Arc<ManagedModel>>) {
    for instance in instances {
        if !instance.is_loaded() {
            continue;
        }
        if let Err(e) = instance.unload().await {
            tracing::warn!(
                identifier = %instance.metadata().identifier,
                error = %e,
                "Failed to unload model"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lifecycle::{InferInput, InferOutput, ModelContext};
    use async_trait::async_trait;

    struct NoopBackend;

    #[async_trait]
    impl ModelBackend for NoopBackend {
        async fn load(&self, _ctx: &ModelContext) -> ModelResult<()> {
            Ok(())
        }

        async fn download(&self, _ctx: &ModelContext) -> ModelResult<()> {
            Ok(())
        }

        async fn unload(&self, _ctx: &ModelContext) -> ModelResult<()> {
            Ok(())
        }

        async fn infer(&self, _ctx: &ModelContext, _input: InferInput) -> ModelResult<InferOutput> {
            Ok(serde_json::Value::Null)
        }
    }

    fn noop_factory(_ctx: &SlotContext) -> ModelResult<Arc<dyn ModelBackend>> {
        Ok(Arc::new(NoopBackend))
    }

    fn metadata(identifier: &str, task: &str) -> ModelMetadata {
        ModelMetadata::new(identifier, ModelTask::from(task))
    }

    #[tokio::test]
    async fn test_new_registry_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path(), None);
        assert!(registry.keys().await.is_empty());
        assert!(registry.status().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_builds_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path(), Some("hf_abc".into()));
        registry
            .register("noop", metadata("local/noop", "unit"), noop_factory)
            .await
            .unwrap();

        let first = registry.get("noop").await.unwrap();
        let second = registry.get("noop").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.hf_token().as_deref(), Some("hf_abc"));
    }

    #[tokio::test]
    async fn test_factory_failure_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path(), None);
        registry
            .register(
                "broken",
                metadata("local/broken", "unit"),
                |_ctx: &SlotContext| -> ModelResult<Arc<dyn ModelBackend>> {
                    Err(ModelError::runtime("missing runtime"))
                },
            )
            .await
            .unwrap();

        let err = registry.get("broken").await.unwrap_err();
        assert!(matches!(err, RegistryError::Model(_)));
        assert_eq!(err.to_string(), "missing runtime");
    }

    #[tokio::test]
    async fn test_first_slot_wins_task_index() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path(), None);
        registry
            .register("a", metadata("local/a", "speech-to-text"), noop_factory)
            .await
            .unwrap();
        registry
            .register("b", metadata("local/b", "speech-to-text"), noop_factory)
            .await
            .unwrap();

        let model = registry.get_by_task(&ModelTask::SpeechToText).await.unwrap();
        assert_eq!(model.metadata().identifier, "local/a");
    }

    #[tokio::test]
    async fn test_resolve_key_accepts_identifier_alias() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path(), None);
        registry
            .register("qwen", metadata("Qwen/Qwen3-VL-30B-A3B-Instruct", "chat-completion"), noop_factory)
            .await
            .unwrap();

        assert_eq!(registry.resolve_key("qwen").await.as_deref(), Some("qwen"));
        assert_eq!(
            registry
                .resolve_key("Qwen/Qwen3-VL-30B-A3B-Instruct")
                .await
                .as_deref(),
            Some("qwen")
        );
        assert!(registry.resolve_key("gpt-4").await.is_none());
    }

    #[tokio::test]
    async fn test_configure_rejects_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path(), None);
        let catalog = vec![
            SlotDefinition::new("x", metadata("local/x", "unit"), noop_factory),
            SlotDefinition::new("x", metadata("local/y", "unit"), noop_factory),
        ];

        let err = registry
            .configure(None, dir.path().join("cache"), catalog)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKey { .. }));
    }

    /// Backend whose disk check blocks while `slow` is set
    #[derive(Default)]
    struct SlowDiskBackend {
        slow: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ModelBackend for SlowDiskBackend {
        async fn load(&self, _ctx: &ModelContext) -> ModelResult<()> {
            Ok(())
        }

        async fn download(&self, _ctx: &ModelContext) -> ModelResult<()> {
            Ok(())
        }

        async fn unload(&self, _ctx: &ModelContext) -> ModelResult<()> {
            Ok(())
        }

        async fn infer(&self, _ctx: &ModelContext, _input: InferInput) -> ModelResult<InferOutput> {
            Ok(serde_json::Value::Null)
        }

        fn is_downloaded(&self, _ctx: &ModelContext) -> bool {
            if self.slow.load(std::sync::atomic::Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            false
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_disk_checks_do_not_hold_registry_lock() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ModelRegistry::new(dir.path(), None));
        let backend = Arc::new(SlowDiskBackend::default());
        let factory_backend = backend.clone();
        registry
            .register(
                "slow",
                metadata("local/slow", "unit"),
                move |_ctx: &SlotContext| -> ModelResult<Arc<dyn ModelBackend>> {
                    Ok(factory_backend.clone())
                },
            )
            .await
            .unwrap();
        registry.get("slow").await.unwrap();
        backend.slow.store(true, std::sync::atomic::Ordering::SeqCst);

        let status = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.status().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // A writer gets in while the disk check is still running
        tokio::time::timeout(
            std::time::Duration::from_millis(150),
            registry.register("late", metadata("local/late", "unit"), noop_factory),
        )
        .await
        .expect("registry write lock blocked by status")
        .unwrap();

        let status = status.await.unwrap();
        assert_eq!(status[0].key, "slow");
    }

    #[tokio::test]
    async fn test_status_of_untouched_slot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path(), None);
        registry
            .register(
                "noop",
                metadata("local/noop", "unit").with_param("max_tokens", serde_json::json!(512)),
                noop_factory,
            )
            .await
            .unwrap();
        std::fs::create_dir_all(dir.path().join("models--local--noop")).unwrap();

        let status = registry.status().await;
        assert_eq!(status.len(), 1);
        let entry = &status[0];
        assert!(!entry.loaded);
        assert!(entry.runtime.downloaded);
        assert_eq!(entry.params["max_tokens"], 512);
        assert!(!entry.params.contains_key("device_ids"));
    }
}
