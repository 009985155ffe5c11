//! Shared test doubles for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use model_gateway::models::cache;
use model_gateway::models::registry::SlotContext;
use model_gateway::models::runtime::RuntimeUpdate;
use model_gateway::{
    InferInput, InferOutput, ModelBackend, ModelContext, ModelError, ModelMetadata,
    ModelRegistry, ModelResult, ModelTask,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backend that counts calls, sleeps to widen race windows, and writes
/// artifacts into the cache on load and download
#[derive(Default)]
pub struct DummyBackend {
    pub loads: AtomicUsize,
    pub downloads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub infers: AtomicUsize,
    pub fail_load: AtomicBool,
    pub fail_download: AtomicBool,
    pub delay: Duration,
    /// Device preference seen by each load, in order
    pub loaded_on: Mutex<Vec<Vec<u32>>>,
    /// Credential seen by the most recent load
    pub last_token: Mutex<Option<String>>,
}

impl DummyBackend {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn infers(&self) -> usize {
        self.infers.load(Ordering::SeqCst)
    }

    fn write_artifacts(&self, ctx: &ModelContext) -> ModelResult<()> {
        let snapshot = ctx.cache_repo_dir().join("snapshots").join("main");
        std::fs::create_dir_all(&snapshot)?;
        std::fs::write(snapshot.join("weights.bin"), b"weights")?;
        Ok(())
    }
}

#[async_trait]
impl ModelBackend for DummyBackend {
    async fn load(&self, ctx: &ModelContext) -> ModelResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        ctx.update_runtime(RuntimeUpdate::new().progress(40).status("Warming up"));
        tokio::time::sleep(self.delay).await;

        if self.fail_load.load(Ordering::SeqCst) {
            return Err(ModelError::runtime("simulated load failure"));
        }

        self.write_artifacts(ctx)?;
        self.loaded_on
            .lock()
            .unwrap()
            .push(ctx.device_ids.clone());
        *self.last_token.lock().unwrap() = ctx.hf_token.clone();
        Ok(())
    }

    async fn download(&self, ctx: &ModelContext) -> ModelResult<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        if self.fail_download.load(Ordering::SeqCst) {
            return Err(ModelError::runtime("HTTP 403: gated repository"));
        }
        self.write_artifacts(ctx)
    }

    async fn unload(&self, _ctx: &ModelContext) -> ModelResult<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn infer(&self, ctx: &ModelContext, input: InferInput) -> ModelResult<InferOutput> {
        self.infers.fetch_add(1, Ordering::SeqCst);
        match input {
            InferInput::Json(payload) => {
                // Chat requests get an assistant reply repeating the last message
                let reply = payload
                    .pointer("/messages")
                    .and_then(|messages| messages.as_array())
                    .and_then(|messages| messages.last())
                    .and_then(|message| message["content"].as_str())
                    .map(|content| format!("echo: {}", content));
                let mut output = json!({
                    "model": ctx.metadata.identifier,
                    "echo": payload,
                });
                if let Some(reply) = reply {
                    output["choices"] = json!([{
                        "index": 0,
                        "message": { "role": "assistant", "content": reply },
                    }]);
                }
                Ok(output)
            }
            InferInput::Audio {
                bytes,
                sampling_rate,
            } => Ok(json!({
                "model": ctx.metadata.identifier,
                "bytes": bytes.len(),
                "sampling_rate": sampling_rate,
            })),
        }
    }
}

/// Whether the dummy backend's artifacts for `key` are on disk
pub fn artifacts_present(cache_dir: &Path, key: &str) -> bool {
    cache::is_repo_cached(cache_dir, &format!("local/{}", key))
}

pub fn metadata(identifier: &str, task: ModelTask) -> ModelMetadata {
    ModelMetadata::new(identifier, task)
        .with_description("Test double")
        .with_format("json")
}

/// Register `backend` under `key`; every instantiation shares the same backend
pub async fn register_dummy(
    registry: &ModelRegistry,
    key: &str,
    task: ModelTask,
    backend: Arc<DummyBackend>,
) {
    registry
        .register(
            key,
            metadata(&format!("local/{}", key), task),
            move |_ctx: &SlotContext| -> ModelResult<Arc<dyn ModelBackend>> {
                Ok(backend.clone())
            },
        )
        .await
        .unwrap();
}

/// Registry with one dummy slot per core task
pub async fn dummy_registry(
    cache_dir: &Path,
) -> (ModelRegistry, Arc<DummyBackend>, Arc<DummyBackend>, Arc<DummyBackend>) {
    let registry = ModelRegistry::new(cache_dir, None);
    let chat = Arc::new(DummyBackend::default());
    let speech = Arc::new(DummyBackend::default());
    let diarizer = Arc::new(DummyBackend::default());

    register_dummy(&registry, "chat", ModelTask::ChatCompletion, chat.clone()).await;
    register_dummy(&registry, "speech", ModelTask::SpeechToText, speech.clone()).await;
    register_dummy(
        &registry,
        "diarizer",
        ModelTask::SpeakerDiarization,
        diarizer.clone(),
    )
    .await;

    (registry, chat, speech, diarizer)
}
