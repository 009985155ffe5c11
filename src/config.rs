//! Configuration structures and loading logic

use crate::gpu::DevicePolicy;
use crate::models::metadata::ModelTask;
use crate::models::retry::RetryPolicy;
use crate::models::served::SERVER_READY_PROGRESS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub api_host: String,
    pub api_port: u16,
    /// Shared artifact cache root, also home of the persisted token
    pub model_cache_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub huggingface_token: Option<String>,
    /// Bearer keys accepted on `/v1/*`; empty leaves those routes open
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub openai_api_keys: Vec<String>,
    /// When false every model is loaded at startup
    pub lazy_load_models: bool,
    /// Where inference server stdout/stderr is appended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_log_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub device_policy: DevicePolicy,
    pub models: Vec<ServedModelConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            api_port: default_api_port(),
            model_cache_dir: default_model_cache_dir(),
            huggingface_token: None,
            openai_api_keys: Vec::new(),
            lazy_load_models: true,
            server_log_dir: None,
            retry: RetryPolicy::default(),
            device_policy: DevicePolicy::default(),
            models: default_models(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(host) = std::env::var("GATEWAY_API_HOST") {
            config.api_host = host;
        }
        if let Ok(port) = std::env::var("GATEWAY_API_PORT") {
            config.api_port = port.parse().context("Invalid GATEWAY_API_PORT value")?;
        }
        if let Ok(cache_dir) = std::env::var("MODEL_CACHE_DIR") {
            config.model_cache_dir = PathBuf::from(cache_dir);
        }
        if let Ok(token) = std::env::var("HUGGINGFACE_TOKEN") {
            let token = token.trim().to_string();
            config.huggingface_token = (!token.is_empty()).then_some(token);
        }
        if let Ok(keys) = std::env::var("OPENAI_API_KEYS") {
            config.openai_api_keys = split_api_keys(&keys);
        }
        if let Ok(lazy) = std::env::var("LAZY_LOAD_MODELS") {
            config.lazy_load_models = parse_bool(&lazy)
                .with_context(|| format!("Invalid LAZY_LOAD_MODELS value: {}", lazy))?;
        }
        if let Ok(log_dir) = std::env::var("GATEWAY_SERVER_LOG_DIR") {
            config.server_log_dir = Some(PathBuf::from(log_dir));
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }

        let mut keys = HashSet::new();
        let mut tasks = HashSet::new();

        for model in &self.models {
            if model.key.is_empty() {
                anyhow::bail!("Model key cannot be empty");
            }
            if model.key.contains('/') || model.key.contains('\\') {
                anyhow::bail!("Model key '{}' cannot contain path separators", model.key);
            }
            if !keys.insert(&model.key) {
                anyhow::bail!("Duplicate model key: {}", model.key);
            }
            if !tasks.insert(&model.task) {
                anyhow::bail!(
                    "Task '{}' is declared by more than one model (second: '{}')",
                    model.task,
                    model.key
                );
            }
            if model.identifier.is_empty() {
                anyhow::bail!("Model '{}' has an empty identifier", model.key);
            }
            if model.command.is_empty() {
                anyhow::bail!("Model '{}' has no server command", model.key);
            }
            for (name, (start, end)) in [
                ("download_range", model.download_range),
                ("load_download_range", model.load_download_range),
            ] {
                if !(0.0..=100.0).contains(&start) || !(0.0..=100.0).contains(&end) || start > end
                {
                    anyhow::bail!(
                        "Model '{}' {} must satisfy 0 <= start <= end <= 100 (got [{}, {}])",
                        model.key,
                        name,
                        start,
                        end
                    );
                }
            }
            let load_end = model.load_download_range.1;
            if load_end > SERVER_READY_PROGRESS {
                anyhow::bail!(
                    "Model '{}' load_download_range must end at or below {} (got {})",
                    model.key,
                    SERVER_READY_PROGRESS,
                    load_end
                );
            }
            if let Some(port) = model.port
                && (port < 1024 || port == self.api_port)
            {
                anyhow::bail!("Model '{}' port {} is not usable", model.key, port);
            }
        }

        Ok(())
    }
}

/// One model slot served by an external inference server process
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServedModelConfig {
    /// Registry key (e.g., "canary")
    pub key: String,
    /// Artifact repository id (e.g., "nvidia/canary-1b-v2")
    pub identifier: String,
    pub task: ModelTask,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub format: String,

    /// Glob patterns restricting the snapshot download; empty fetches everything
    #[serde(default)]
    pub file_patterns: Vec<String>,

    /// Server executable. Args may use `{port}`, `{model_path}` and `{model_id}`.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Inference path on the server
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Fixed server port; a free one is picked when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Progress sub-range for an explicit download
    #[serde(default = "default_download_range")]
    pub download_range: (f64, f64),

    /// Progress sub-range for the download step of a load
    #[serde(default = "default_load_download_range")]
    pub load_download_range: (f64, f64),
}

// Default functions
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8000
}
fn default_model_cache_dir() -> PathBuf {
    PathBuf::from("/models")
}
fn default_endpoint() -> String {
    "/infer".to_string()
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_startup_timeout() -> u64 {
    600
}
fn default_download_range() -> (f64, f64) {
    (10.0, 95.0)
}
fn default_load_download_range() -> (f64, f64) {
    (20.0, 80.0)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}

/// Comma-separated key list; blanks are dropped
fn split_api_keys(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(String::from)
        .collect()
}

/// Built-in catalog: chat, speech-to-text and diarization
pub fn default_models() -> Vec<ServedModelConfig> {
    vec![
        ServedModelConfig {
            key: "qwen".to_string(),
            identifier: "Qwen/Qwen3-VL-30B-A3B-Instruct".to_string(),
            task: ModelTask::ChatCompletion,
            description: "Qwen3 VL 30B A3B Instruct model for multimodal chat completions"
                .to_string(),
            format: "chatml".to_string(),
            file_patterns: vec![
                "*.json".to_string(),
                "*.safetensors".to_string(),
                "*.txt".to_string(),
                "*.jinja".to_string(),
            ],
            command: "vllm".to_string(),
            args: vec![
                "serve".to_string(),
                "{model_path}".to_string(),
                "--served-model-name".to_string(),
                "{model_id}".to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            endpoint: "/v1/chat/completions".to_string(),
            health_path: default_health_path(),
            port: None,
            startup_timeout_secs: 1800,
            download_range: default_download_range(),
            load_download_range: (15.0, 70.0),
        },
        ServedModelConfig {
            key: "canary".to_string(),
            identifier: "nvidia/canary-1b-v2".to_string(),
            task: ModelTask::SpeechToText,
            description: "NVIDIA Canary multilingual ASR model".to_string(),
            format: "wav/ogg/flac".to_string(),
            file_patterns: vec!["*.nemo".to_string(), "*.json".to_string()],
            command: "uvicorn".to_string(),
            args: vec![
                "asr_canary.app:app".to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            endpoint: "/v1/audio/transcriptions".to_string(),
            health_path: default_health_path(),
            port: None,
            startup_timeout_secs: default_startup_timeout(),
            download_range: default_download_range(),
            load_download_range: default_load_download_range(),
        },
        ServedModelConfig {
            key: "pyannote".to_string(),
            identifier: "pyannote/speaker-diarization-community-1".to_string(),
            task: ModelTask::SpeakerDiarization,
            description: "Pyannote community speaker diarization pipeline".to_string(),
            format: "wav/ogg/flac".to_string(),
            file_patterns: ["*.bin", "*.ckpt", "*.pt", "*.yaml", "*.json"]
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            command: "uvicorn".to_string(),
            args: vec![
                "diarizer.app:app".to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            endpoint: "/v1/audio/diarize".to_string(),
            health_path: default_health_path(),
            port: None,
            startup_timeout_secs: default_startup_timeout(),
            download_range: (28.0, 96.0),
            load_download_range: (32.0, 78.0),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.api_host, "0.0.0.0");
        assert_eq!(config.api_port, 8000);
        assert_eq!(config.model_cache_dir, PathBuf::from("/models"));
        assert!(config.lazy_load_models);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.models.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            api_port = 9100
            lazy_load_models = false

            [retry]
            max_attempts = 2

            [device_policy]
            min_free_memory_mib = 8000
            allow_cpu_fallback = false

            [[models]]
            key = "echo"
            identifier = "local/echo"
            task = "echo"
            command = "/usr/local/bin/echo-server"
            args = ["--port", "{port}"]
            download_range = [5.0, 50.0]
        "#;
        let config: GatewayConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.api_port, 9100);
        assert!(!config.lazy_load_models);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 1500);
        assert_eq!(config.device_policy.min_free_memory_mib, Some(8000));
        assert_eq!(config.models.len(), 1);

        let model = &config.models[0];
        assert_eq!(model.task, ModelTask::Other("echo".into()));
        assert_eq!(model.endpoint, "/infer");
        assert_eq!(model.download_range, (5.0, 50.0));
        assert_eq!(model.load_download_range, (20.0, 80.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_validation() {
        let config = GatewayConfig {
            api_port: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_key_detection() {
        let mut config = GatewayConfig::default();
        let mut copy = config.models[0].clone();
        copy.task = ModelTask::Other("second".into());
        config.models.push(copy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_task_detection() {
        let mut config = GatewayConfig::default();
        let mut copy = config.models[1].clone();
        copy.key = "canary-2".into();
        config.models.push(copy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_key_validation() {
        let mut config = GatewayConfig::default();
        config.models[0].key = "bad/key".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = GatewayConfig::default();
        config.models[2].load_download_range = (80.0, 20.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_range_must_leave_room_for_server_start() {
        let mut config = GatewayConfig::default();
        config.models[1].load_download_range = (20.0, 90.0);
        assert!(config.validate().is_ok());

        config.models[1].load_download_range = (20.0, 95.0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("load_download_range"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = GatewayConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_split_api_keys() {
        assert_eq!(split_api_keys(" sk-a, ,sk-b ,"), vec!["sk-a", "sk-b"]);
        assert!(split_api_keys("").is_empty());
    }

    #[test]
    fn test_api_keys_from_toml() {
        let config: GatewayConfig = toml::from_str(r#"openai_api_keys = ["sk-a"]"#).unwrap();
        assert_eq!(config.openai_api_keys, vec!["sk-a"]);
        assert!(GatewayConfig::default().openai_api_keys.is_empty());
    }
}
