//! Host CPU and memory utilization shown on the dashboard

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use sysinfo::System;

/// Host utilization in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of host metrics, swappable in tests
pub type SystemSampler = Arc<dyn Fn() -> SystemMetrics + Send + Sync>;

/// Keeps one `sysinfo::System` so CPU usage is measured between samples
pub struct SystemMonitor {
    system: Mutex<System>,
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    /// Current utilization; CPU usage covers the time since the previous sample
    pub fn sample(&self) -> SystemMetrics {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();

        SystemMetrics {
            cpu_percent: system.global_cpu_usage(),
            memory_percent: percent(system.used_memory(), system.total_memory()),
        }
    }

    pub fn into_sampler(self) -> SystemSampler {
        let monitor = Arc::new(self);
        Arc::new(move || monitor.sample())
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(4, 4), 100.0);
    }

    #[test]
    fn test_sample_is_in_range() {
        let monitor = SystemMonitor::new();
        let metrics = monitor.sample();
        assert!((0.0..=100.0).contains(&metrics.memory_percent));
        assert!(metrics.cpu_percent >= 0.0);
    }
}
