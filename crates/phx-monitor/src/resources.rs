//! ---
//! phx_section: "03-persistence-logging"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Resource monitor and metrics export utilities."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use phx_common::MonitorConfig;
use phx_core::{MonitorReport, MonitorSession, ResourceMonitor, ResourceStatus, Result};
use sysinfo::System;
use tokio::sync::watch;
use tracing::debug;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Resource monitor reading host memory through `sysinfo`.
#[derive(Debug, Clone)]
pub struct SysinfoMonitor {
    min_available_bytes: u64,
    sample_interval: Duration,
}

impl SysinfoMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            min_available_bytes: config.min_available_memory_mb * BYTES_PER_MB,
            sample_interval: config.sample_interval.max(Duration::from_millis(10)),
        }
    }

    fn start(&self, label: &'static str) -> Box<dyn MonitorSession> {
        Box::new(SamplingSession::start(label, self.sample_interval))
    }
}

#[async_trait]
impl ResourceMonitor for SysinfoMonitor {
    async fn check_system_resources(&self) -> Result<ResourceStatus> {
        let (available, total) = tokio::task::spawn_blocking(|| {
            let mut system = System::new();
            system.refresh_memory();
            (system.available_memory(), system.total_memory())
        })
        .await
        .map_err(|err| phx_core::UpdateError::execution("sample memory", err))?;

        let detail = format!(
            "{} MB of {} MB available, {} MB required",
            available / BYTES_PER_MB,
            total / BYTES_PER_MB,
            self.min_available_bytes / BYTES_PER_MB
        );
        Ok(ResourceStatus {
            sufficient: available >= self.min_available_bytes,
            detail,
        })
    }

    fn start_update_monitoring(&self) -> Box<dyn MonitorSession> {
        self.start("update")
    }

    fn start_rollback_monitoring(&self) -> Box<dyn MonitorSession> {
        self.start("rollback")
    }
}

#[derive(Debug, Default)]
struct Samples {
    count: u64,
    peak_used: u64,
}

impl Samples {
    fn observe(&mut self, system: &mut System) {
        system.refresh_memory();
        self.count += 1;
        self.peak_used = self.peak_used.max(system.used_memory());
    }
}

/// Samples used memory on a tokio interval until stopped.
#[derive(Debug)]
struct SamplingSession {
    label: &'static str,
    started: Instant,
    elapsed: Option<Duration>,
    samples: Arc<Mutex<Samples>>,
    stop: Option<watch::Sender<bool>>,
}

impl SamplingSession {
    fn start(label: &'static str, interval: Duration) -> Self {
        let samples = Arc::new(Mutex::new(Samples::default()));
        let stop = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, mut rx) = watch::channel(false);
                let shared = samples.clone();
                handle.spawn(async move {
                    let mut system = System::new();
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => shared.lock().observe(&mut system),
                            changed = rx.changed() => {
                                if changed.is_err() || *rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!(label, "monitoring session finished");
                });
                Some(tx)
            }
            Err(_) => {
                debug!(label, "no runtime; monitoring records wall time only");
                None
            }
        };
        Self {
            label,
            started: Instant::now(),
            elapsed: None,
            samples,
            stop,
        }
    }
}

impl MonitorSession for SamplingSession {
    fn stop(&mut self) {
        if self.elapsed.is_some() {
            return;
        }
        self.elapsed = Some(self.started.elapsed());
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }

    fn results(&self) -> MonitorReport {
        let elapsed = self.elapsed.unwrap_or_else(|| self.started.elapsed());
        let samples = self.samples.lock();
        MonitorReport {
            label: self.label.to_owned(),
            duration_ms: elapsed.as_millis() as u64,
            samples: samples.count,
            peak_memory_bytes: samples.peak_used,
        }
    }
}

impl Drop for SamplingSession {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}
