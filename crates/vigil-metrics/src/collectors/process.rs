use std::{sync::Arc, time::Instant};

use tracing::warn;
use vigil_common::error::Result;

use crate::registry::{MetricRegistry, RegistrationHandle};

pub struct ProcessMetrics {
    registry: Arc<MetricRegistry>,
    start_time: Instant,
    uptime_seconds: RegistrationHandle,
    resident_memory_bytes: RegistrationHandle,
}

impl ProcessMetrics {
    pub fn register(registry: &Arc<MetricRegistry>) -> Result<Self> {
        Ok(Self {
            registry: Arc::clone(registry),
            start_time: Instant::now(),
            uptime_seconds: registry.register_gauge(
                "vigil_uptime_seconds",
                "Process uptime in seconds",
                &[],
            )?,
            resident_memory_bytes: registry.register_gauge(
                "vigil_process_resident_memory_bytes",
                "Resident memory size of the process in bytes",
                &[],
            )?,
        })
    }

    pub fn refresh(&self) {
        let uptime = self.start_time.elapsed().as_secs_f64();
        if let Err(err) = self.registry.set(&self.uptime_seconds, &[], uptime) {
            warn!(error = %err, "failed to refresh uptime gauge");
        }

        if let Some(resident_bytes) = read_resident_memory_bytes()
            && let Err(err) = self
                .registry
                .set(&self.resident_memory_bytes, &[], resident_bytes as f64)
        {
            warn!(error = %err, "failed to refresh resident memory gauge");
        }
    }
}

#[cfg(target_os = "linux")]
fn read_resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb = rest
                .split_whitespace()
                .next()
                .and_then(|value| value.parse::<u64>().ok())?;
            return kb.checked_mul(1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_resident_memory_bytes() -> Option<u64> {
    None
}
