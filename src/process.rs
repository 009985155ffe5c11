//! Inference server process lifecycle

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Configuration for spawning an inference server process
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// Registry key, used for log file naming
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment for the child only; the gateway's own env is untouched
    pub env: Vec<(String, String)>,
    pub port: u16,
    /// Append stdout/stderr to `<log_dir>/<name>.log` when set
    pub log_dir: Option<PathBuf>,
}

impl SpawnConfig {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

/// Trait for managing process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a new server process
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle>;

    /// Stop a process gracefully with timeout
    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> Result<()>;

    /// Check if process is running
    async fn is_running(&self, handle: &ProcessHandle) -> bool;

    /// Get process ID
    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<HashMap<String, Child>>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn open_log(config: &SpawnConfig) -> Result<Option<std::fs::File>> {
    let Some(log_dir) = &config.log_dir else {
        return Ok(None);
    };
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;
    let log_path = log_dir.join(format!("{}.log", config.name));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {:?}", log_path))?;
    Ok(Some(file))
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        match open_log(&config)? {
            Some(log_file) => {
                let stdout_file = log_file
                    .try_clone()
                    .context("Failed to clone log file for stdout")?;
                cmd.stdout(stdout_file).stderr(log_file);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", config.command))?;

        let pid = child.id().context("Failed to get PID")?;
        let handle_id = format!("process_{}", pid);

        tracing::info!(
            name = %config.name,
            command = %config.command,
            port = config.port,
            pid = pid,
            "Inference server spawned"
        );

        let handle = ProcessHandle {
            id: handle_id.clone(),
        };

        self.processes.write().await.insert(handle_id, child);

        Ok(handle)
    }

    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> Result<()> {
        let child = self.processes.write().await.remove(&handle.id);

        if let Some(mut child) = child
            && let Some(pid) = child.id()
        {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;

                let pid = Pid::from_raw(pid as i32);
                let _ = kill(pid, Signal::SIGTERM);

                tokio::select! {
                    _ = child.wait() => {
                        tracing::info!("Process stopped gracefully");
                    }
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!("Graceful shutdown timeout, sending SIGKILL");
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = pid;
                let _ = child.kill().await;
            }
        }

        Ok(())
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        let mut processes = self.processes.write().await;
        match processes.get_mut(&handle.id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).and_then(|p| p.id())
    }
}

/// Find a free local TCP port, starting the search at `start_port`
pub fn find_free_port(start_port: u16) -> Result<u16> {
    find_free_port_excluding(start_port, &HashSet::new())
}

fn find_free_port_excluding(start_port: u16, excluded: &HashSet<u16>) -> Result<u16> {
    const MAX_ATTEMPTS: u16 = 1000;

    for offset in 0..MAX_ATTEMPTS {
        let port = start_port.saturating_add(offset);
        if excluded.contains(&port) {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }

    anyhow::bail!(
        "Could not find free port in range {}-{}",
        start_port,
        start_port.saturating_add(MAX_ATTEMPTS)
    )
}

/// Server ports handed out by this gateway
///
/// A test bind only shows a port is free right now; a server spawned on it
/// binds later. Reservations keep two concurrent loads from being given the
/// same port in that window.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start_port: u16,
    reserved: Arc<std::sync::Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(start_port: u16) -> Self {
        Self {
            start_port,
            reserved: Arc::new(std::sync::Mutex::new(HashSet::new())),
        }
    }

    fn reserved(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the first free, unreserved port at or above the start port
    pub fn reserve(&self) -> Result<u16> {
        let mut reserved = self.reserved();
        let port = find_free_port_excluding(self.start_port, &reserved)?;
        reserved.insert(port);
        tracing::debug!(port, "Reserved server port");
        Ok(port)
    }

    /// Reserve a configured port; fails if this gateway already holds it
    pub fn reserve_fixed(&self, port: u16) -> Result<u16> {
        if !self.reserved().insert(port) {
            anyhow::bail!("Port {} is already in use by another model server", port);
        }
        Ok(port)
    }

    pub fn release(&self, port: u16) {
        if self.reserved().remove(&port) {
            tracing::debug!(port, "Released server port");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved().contains(&port)
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::mocks::MockProcessManager;
    use super::*;

    #[tokio::test]
    async fn test_mock_spawn_and_stop() {
        let manager = MockProcessManager::new();
        let handle = manager
            .spawn(SpawnConfig {
                name: "canary".into(),
                command: "/usr/bin/true".into(),
                port: 9100,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(manager.is_running(&handle).await);
        assert_eq!(manager.pid(&handle).await, Some(1000));

        manager
            .stop(handle.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!manager.is_running(&handle).await);
        assert_eq!(manager.process_count().await, 0);
    }

    #[test]
    fn test_env_value_lookup() {
        let config = SpawnConfig {
            env: vec![("PORT".into(), "9100".into())],
            ..Default::default()
        };
        assert_eq!(config.env_value("PORT"), Some("9100"));
        assert_eq!(config.env_value("HF_TOKEN"), None);
    }

    #[test]
    fn test_find_free_port() {
        let port = find_free_port(20000).unwrap();
        assert!(port >= 20000);
    }

    #[test]
    fn test_port_allocator_never_hands_out_a_port_twice() {
        let ports = PortAllocator::new(21000);

        let first = ports.reserve().unwrap();
        let second = ports.reserve().unwrap();
        assert_ne!(first, second);
        assert!(ports.is_reserved(first));
        assert!(ports.is_reserved(second));

        ports.release(first);
        assert!(!ports.is_reserved(first));
        assert_eq!(ports.reserve().unwrap(), first);
    }

    #[test]
    fn test_port_allocator_fixed_ports() {
        let ports = PortAllocator::new(21100);

        assert_eq!(ports.reserve_fixed(21100).unwrap(), 21100);
        assert!(ports.reserve_fixed(21100).is_err());
        // Auto allocation skips the fixed reservation
        assert_ne!(ports.reserve().unwrap(), 21100);

        ports.release(21100);
        assert_eq!(ports.reserve_fixed(21100).unwrap(), 21100);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_manager_stops_child() {
        let manager = SystemProcessManager::new();
        let handle = manager
            .spawn(SpawnConfig {
                name: "sleeper".into(),
                command: "sleep".into(),
                args: vec!["30".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(manager.is_running(&handle).await);
        assert!(manager.pid(&handle).await.is_some());

        manager
            .stop(handle.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!manager.is_running(&handle).await);
    }
}
