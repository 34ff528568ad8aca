//! System load sampling for admission control.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::ThrottleConfig;

/// Point-in-time view of system load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// Global CPU usage, 0-100.
    pub cpu_percent: f32,
    /// Used memory as a share of total, 0-100.
    pub mem_percent: f32,
    /// Workers running when the snapshot was taken.
    pub active_worker_count: usize,
    /// When the underlying measurement was made.
    pub sampled_at: Instant,
}

impl ResourceSnapshot {
    /// A snapshot reporting an idle machine.
    pub fn idle() -> Self {
        Self {
            cpu_percent: 0.0,
            mem_percent: 0.0,
            active_worker_count: 0,
            sampled_at: Instant::now(),
        }
    }

    /// Stamp the supervisor's own worker count onto the snapshot.
    pub fn with_active_workers(mut self, count: usize) -> Self {
        self.active_worker_count = count;
        self
    }
}

/// Returns true when CPU or memory is above its configured ceiling.
pub fn should_throttle(snapshot: &ResourceSnapshot, thresholds: &ThrottleConfig) -> bool {
    snapshot.cpu_percent > thresholds.cpu_ceiling_percent
        || snapshot.mem_percent > thresholds.mem_ceiling_percent
}

/// Source of resource snapshots.
///
/// `sample` is called on every scheduling iteration and must not block;
/// implementations return a cached measurement.
pub trait ResourceMonitor: Send + Sync {
    fn sample(&self) -> ResourceSnapshot;
}

/// Monitor that always reports the same load. Useful to disable throttling.
#[derive(Debug, Clone, Copy)]
pub struct FixedMonitor {
    cpu_percent: f32,
    mem_percent: f32,
}

impl FixedMonitor {
    pub fn new(cpu_percent: f32, mem_percent: f32) -> Self {
        Self {
            cpu_percent,
            mem_percent,
        }
    }

    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl ResourceMonitor for FixedMonitor {
    fn sample(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: self.cpu_percent,
            mem_percent: self.mem_percent,
            active_worker_count: 0,
            sampled_at: Instant::now(),
        }
    }
}

/// Host monitor backed by `sysinfo`, refreshed on a background task.
pub struct SystemMonitor {
    latest: watch::Receiver<ResourceSnapshot>,
    refresher: JoinHandle<()>,
}

impl SystemMonitor {
    /// Start sampling every `interval`. Must be called inside a Tokio runtime.
    pub fn spawn(interval: Duration) -> Arc<Self> {
        let mut sys = System::new();
        // CPU usage is a delta; prime the first measurement.
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let (tx, rx) = watch::channel(measure(&sys));

        let refresher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                let snapshot = measure(&sys);
                trace!(
                    cpu = snapshot.cpu_percent,
                    mem = snapshot.mem_percent,
                    "Resource sample"
                );
                if tx.send(snapshot).is_err() {
                    break;
                }
            }
            debug!("System monitor stopped");
        });

        Arc::new(Self {
            latest: rx,
            refresher,
        })
    }
}

impl ResourceMonitor for SystemMonitor {
    fn sample(&self) -> ResourceSnapshot {
        *self.latest.borrow()
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

fn measure(sys: &System) -> ResourceSnapshot {
    let total = sys.total_memory();
    let mem_percent = if total == 0 {
        0.0
    } else {
        (sys.used_memory() as f64 / total as f64 * 100.0) as f32
    };
    ResourceSnapshot {
        cpu_percent: sys.global_cpu_usage(),
        mem_percent,
        active_worker_count: 0,
        sampled_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cpu: f32, mem: f32) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: cpu,
            mem_percent: mem,
            ..ResourceSnapshot::idle()
        }
    }

    #[test]
    fn test_should_throttle() {
        let thresholds = ThrottleConfig {
            cpu_ceiling_percent: 80.0,
            mem_ceiling_percent: 70.0,
            ..ThrottleConfig::default()
        };
        assert!(!should_throttle(&snapshot(10.0, 10.0), &thresholds));
        assert!(!should_throttle(&snapshot(80.0, 70.0), &thresholds));
        assert!(should_throttle(&snapshot(80.1, 10.0), &thresholds));
        assert!(should_throttle(&snapshot(10.0, 95.0), &thresholds));
    }

    #[test]
    fn test_fixed_monitor() {
        let sample = FixedMonitor::new(50.0, 25.0).sample().with_active_workers(3);
        assert_eq!(sample.cpu_percent, 50.0);
        assert_eq!(sample.active_worker_count, 3);
    }

    #[tokio::test]
    async fn test_system_monitor_reports_sane_values() {
        let monitor = SystemMonitor::spawn(Duration::from_millis(250));
        let sample = monitor.sample();
        assert!((0.0..=100.0).contains(&sample.mem_percent));
        assert!(sample.cpu_percent >= 0.0);
    }
}
