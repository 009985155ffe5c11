//! Models hosted by an external inference server process
//!
//! Loading pulls the snapshot through the progress engine, spawns the server
//! with the snapshot path and credential in its own environment, then waits
//! for its health endpoint. Inference is forwarded over HTTP.

use super::download::{SnapshotRequest, download_snapshot};
use super::fetch::{ArtifactFetcher, FetchRequest, HfHubFetcher};
use super::lifecycle::{InferInput, InferOutput, ModelBackend, ModelContext};
use super::metadata::ModelMetadata;
use super::registry::{SlotContext, SlotDefinition};
use super::retry::RetryPolicy;
use super::runtime::{JsonMap, RuntimeUpdate};
use crate::config::ServedModelConfig;
use crate::error::{ModelError, ModelResult};
use crate::gpu::{self, DevicePlan, DevicePolicy, GpuInfo, GpuDetector};
use crate::health::ReadinessCheck;
use crate::process::{PortAllocator, ProcessHandle, ProcessManager, SpawnConfig, SystemProcessManager};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// First port tried when a server has no fixed port
const PORT_SEARCH_START: u16 = 18000;

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress published once the server answers its health check
pub const SERVER_READY_PROGRESS: f64 = 90.0;

/// Collaborators shared by every served model
#[derive(Clone)]
pub struct ServedDeps {
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub process_manager: Arc<dyn ProcessManager>,
    pub readiness: ReadinessCheck,
    pub retry: RetryPolicy,
    pub device_policy: DevicePolicy,
    pub gpu_detector: GpuDetector,
    pub log_dir: Option<PathBuf>,
    /// Shared by every served model so concurrent loads get distinct ports
    pub ports: PortAllocator,
}

impl ServedDeps {
    /// Production collaborators: hf-hub, real processes, nvidia-smi
    pub fn system(retry: RetryPolicy, device_policy: DevicePolicy, log_dir: Option<PathBuf>) -> Self {
        Self {
            fetcher: Arc::new(HfHubFetcher::new()),
            process_manager: Arc::new(SystemProcessManager::new()),
            readiness: ReadinessCheck::new(),
            retry,
            device_policy,
            gpu_detector: Arc::new(gpu::detect_gpus),
            log_dir,
            ports: PortAllocator::new(PORT_SEARCH_START),
        }
    }
}

struct RunningServer {
    handle: ProcessHandle,
    port: u16,
    base_url: String,
}

/// [`ModelBackend`] backed by a spawned inference server
pub struct ServedBackend {
    config: ServedModelConfig,
    deps: ServedDeps,
    client: reqwest::Client,
    server: Mutex<Option<RunningServer>>,
}

impl ServedBackend {
    pub fn new(config: ServedModelConfig, deps: ServedDeps) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .unwrap_or_default();
        Self {
            config,
            deps,
            client,
            server: Mutex::new(None),
        }
    }

    fn fetch_request(&self, ctx: &ModelContext) -> FetchRequest {
        FetchRequest {
            repo_id: ctx.metadata.identifier.clone(),
            cache_dir: ctx.cache_dir.clone(),
            token: ctx.hf_token.clone(),
            file_patterns: self.config.file_patterns.clone(),
        }
    }

    async fn plan_device(&self, ctx: &ModelContext) -> ModelResult<DevicePlan> {
        let detect = self.deps.gpu_detector.clone();
        let gpus = tokio::task::spawn_blocking(move || detect())
            .await
            .unwrap_or_default();
        let plan = self.deps.device_policy.plan(&gpus, &ctx.device_ids)?;

        let mut details = JsonMap::new();
        details.insert("device".to_string(), json!(plan.label()));
        details.insert("requested_device_ids".to_string(), json!(ctx.device_ids));
        details.insert("detected_gpus".to_string(), json!(gpus.indices()));
        ctx.update_runtime(
            RuntimeUpdate::new()
                .details(details)
                .status(format!("Placing {} on {}", self.config.key, plan.label())),
        );
        Ok(plan)
    }

    fn spawn_config(
        &self,
        ctx: &ModelContext,
        snapshot: &Path,
        port: u16,
        plan: &DevicePlan,
    ) -> SpawnConfig {
        let model_path = snapshot.to_string_lossy().to_string();
        let args = self
            .config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{model_path}", &model_path)
                    .replace("{model_id}", &ctx.metadata.identifier)
            })
            .collect();

        let mut env = vec![
            ("CUDA_VISIBLE_DEVICES".to_string(), plan.cuda_visible_devices()),
            ("MODEL_PATH".to_string(), model_path),
            ("MODEL_ID".to_string(), ctx.metadata.identifier.clone()),
            ("PORT".to_string(), port.to_string()),
        ];
        if let Some(token) = &ctx.hf_token {
            env.push(("HF_TOKEN".to_string(), token.clone()));
        }

        SpawnConfig {
            name: self.config.key.clone(),
            command: self.config.command.clone(),
            args,
            env,
            port,
            log_dir: self.deps.log_dir.clone(),
        }
    }

    /// Spawn the server on a reserved `port` and wait until it is healthy
    async fn start_server(
        &self,
        ctx: &ModelContext,
        snapshot: &Path,
        port: u16,
        plan: &DevicePlan,
    ) -> ModelResult<RunningServer> {
        let key = self.config.key.as_str();
        ctx.update_runtime(
            RuntimeUpdate::new()
                .progress(self.config.load_download_range.1)
                .status(format!("Starting {} server on port {}", key, port)),
        );
        let handle = self
            .deps
            .process_manager
            .spawn(self.spawn_config(ctx, snapshot, port, plan))
            .await
            .map_err(|e| ModelError::runtime(format!("{:#}", e)))?;

        let base_url = format!("http://127.0.0.1:{}", port);
        let health_url = format!("{}{}", base_url, self.config.health_path);
        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let manager = self.deps.process_manager.clone();
        let check_handle = handle.clone();
        let ready = self
            .deps
            .readiness
            .wait_for_ready(&health_url, timeout, || {
                let manager = manager.clone();
                let handle = check_handle.clone();
                async move { manager.is_running(&handle).await }
            })
            .await;

        if let Err(e) = ready {
            self.stop_handle(handle).await;
            return Err(ModelError::runtime(format!("{} server failed to start: {:#}", key, e)));
        }

        let pid = self.deps.process_manager.pid(&handle).await;
        let mut server = JsonMap::new();
        server.insert(
            "endpoint".to_string(),
            json!(format!("{}{}", base_url, self.config.endpoint)),
        );
        server.insert("type".to_string(), json!("process"));
        server.insert("device".to_string(), json!(plan.label()));
        server.insert("port".to_string(), json!(port));
        server.insert("pid".to_string(), json!(pid));
        ctx.update_runtime(
            RuntimeUpdate::new()
                .progress(SERVER_READY_PROGRESS)
                .status(format!("{} server ready", key))
                .server(server),
        );

        Ok(RunningServer {
            handle,
            port,
            base_url,
        })
    }

    async fn stop_handle(&self, handle: ProcessHandle) {
        if let Err(e) = self.deps.process_manager.stop(handle, STOP_TIMEOUT).await {
            tracing::warn!(model = %self.config.key, error = %e, "Failed to stop inference server");
        }
    }
}

#[async_trait]
impl ModelBackend for ServedBackend {
    async fn load(&self, ctx: &ModelContext) -> ModelResult<()> {
        let key = self.config.key.as_str();
        ctx.update_runtime(
            RuntimeUpdate::new()
                .progress(10)
                .status("Validating environment"),
        );

        let plan = self.plan_device(ctx).await?;

        let snapshot = download_snapshot(
            self.deps.fetcher.as_ref(),
            &SnapshotRequest {
                fetch: self.fetch_request(ctx),
                progress_range: self.config.load_download_range,
                label: format!("Downloading {}", key),
            },
            ctx.runtime.clone(),
            &self.deps.retry,
        )
        .await?;

        let port = match self.config.port {
            Some(port) => self.deps.ports.reserve_fixed(port),
            None => self.deps.ports.reserve(),
        }
        .map_err(|e| ModelError::runtime(format!("{:#}", e)))?;

        match self.start_server(ctx, &snapshot, port, &plan).await {
            Ok(running) => {
                *self.server.lock().await = Some(running);
                Ok(())
            }
            Err(e) => {
                self.deps.ports.release(port);
                Err(e)
            }
        }
    }

    async fn download(&self, ctx: &ModelContext) -> ModelResult<()> {
        download_snapshot(
            self.deps.fetcher.as_ref(),
            &SnapshotRequest {
                fetch: self.fetch_request(ctx),
                progress_range: self.config.download_range,
                label: format!("Downloading {}", self.config.key),
            },
            ctx.runtime.clone(),
            &self.deps.retry,
        )
        .await?;
        Ok(())
    }

    async fn unload(&self, _ctx: &ModelContext) -> ModelResult<()> {
        // Held across the stop so a failed stop leaves the server in place
        let mut server = self.server.lock().await;
        let Some(running) = server.as_ref() else {
            return Ok(());
        };

        tracing::info!(model = %self.config.key, "Stopping inference server");
        self.deps
            .process_manager
            .stop(running.handle.clone(), STOP_TIMEOUT)
            .await
            .map_err(|e| ModelError::runtime(format!("{:#}", e)))?;

        if let Some(running) = server.take() {
            self.deps.ports.release(running.port);
        }
        Ok(())
    }

    async fn infer(&self, ctx: &ModelContext, input: InferInput) -> ModelResult<InferOutput> {
        let base_url = match self.server.lock().await.as_ref() {
            Some(running) => running.base_url.clone(),
            None => {
                return Err(ModelError::NotLoaded {
                    identifier: ctx.metadata.identifier.clone(),
                });
            }
        };
        let url = format!("{}{}", base_url, self.config.endpoint);

        let request = match input {
            InferInput::Json(body) => self.client.post(&url).json(&body),
            InferInput::Audio {
                bytes,
                sampling_rate,
            } => {
                let mut request = self
                    .client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(bytes);
                if let Some(rate) = sampling_rate {
                    request = request.query(&[("sampling_rate", rate)]);
                }
                request
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ModelError::runtime(format!("inference request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::runtime(format!(
                "inference server returned {}: {}",
                status,
                body.trim()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ModelError::runtime(format!("invalid inference response: {}", e)))
    }
}

/// Static identity of a served slot
pub fn metadata_for(config: &ServedModelConfig) -> ModelMetadata {
    ModelMetadata::new(config.identifier.clone(), config.task.clone())
        .with_description(config.description.clone())
        .with_format(config.format.clone())
        .with_param("endpoint", json!(config.endpoint))
        .with_param("file_patterns", json!(config.file_patterns))
}

/// Slot catalog for the configured served models
pub fn catalog(configs: &[ServedModelConfig], deps: &ServedDeps) -> Vec<SlotDefinition> {
    configs
        .iter()
        .map(|config| {
            let factory_config = config.clone();
            let factory_deps = deps.clone();
            SlotDefinition::new(
                config.key.clone(),
                metadata_for(config),
                move |_ctx: &SlotContext| -> ModelResult<Arc<dyn ModelBackend>> {
                    Ok(Arc::new(ServedBackend::new(
                        factory_config.clone(),
                        factory_deps.clone(),
                    )))
                },
            )
        })
        .collect()
}
