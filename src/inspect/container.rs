//! Runtime-side inspection of one container: storage mount, resource sample,
//! process table, and log tail.
//!
//! The `classify_*` functions are pure and only append to a [`Detection`].

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ScanConfig, ThresholdConfig};
use crate::detect::signatures::{
    contains_any, find_matches, LOG_CATEGORIES, PROCESS_DENYLIST, SUSPICIOUS_LOG_WORDS,
};
use crate::detect::{
    Detection, Metrics, NetworkEvidence, ProcessEvidence, ScanError, TYPE_HIGH_CPU_SMALL_VOLUME,
    TYPE_HIGH_NETWORK, TYPE_SUSPICIOUS_LOG, TYPE_SUSPICIOUS_PROCESS,
};
use crate::runtime::{ContainerInfo, ContainerRuntime, ProcessInfo, ResourceStats};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A container's persistent storage as seen from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMount {
    /// Host path of the bind-mount source.
    pub host_path: String,
    /// Base name of the source path, the hosted server's UUID.
    pub volume_id: String,
}

pub struct ContainerInspector {
    runtime: Arc<dyn ContainerRuntime>,
    mount_target: String,
    log_tail_lines: u32,
    thresholds: ThresholdConfig,
}

impl ContainerInspector {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        scan: &ScanConfig,
        thresholds: &ThresholdConfig,
    ) -> Self {
        Self {
            runtime,
            mount_target: scan.mount_target.clone(),
            log_tail_lines: scan.log_tail_lines,
            thresholds: thresholds.clone(),
        }
    }

    /// Inspect runtime metadata and locate the persistent-storage mount.
    pub async fn locate(&self, id: &str) -> Result<(ContainerInfo, StorageMount), ScanError> {
        let info = self.runtime.inspect(id).await?;
        let mount = storage_mount(&info, &self.mount_target).ok_or_else(|| {
            ScanError::NoStorageMount {
                container: id.to_string(),
                target: self.mount_target.clone(),
            }
        })?;
        Ok((info, mount))
    }

    /// Sample resources, list processes, and read the log tail, classifying
    /// each into `detection`.
    pub async fn inspect(
        &self,
        id: &str,
        volume_mb: f64,
        detection: &mut Detection,
    ) -> Result<(), ScanError> {
        let stats = self.runtime.stats(id).await?;
        classify_resources(&stats, volume_mb, &self.thresholds, detection);

        let processes = self.runtime.processes(id).await?;
        debug!(container = id, count = processes.len(), "process table read");
        classify_processes(&processes, detection);

        let logs = self.runtime.logs(id, self.log_tail_lines).await?;
        classify_logs(&logs, detection);
        Ok(())
    }
}

/// The bind mount whose destination is `target`.
pub fn storage_mount(info: &ContainerInfo, target: &str) -> Option<StorageMount> {
    let mount = info
        .mounts
        .iter()
        .find(|m| m.destination.trim_end_matches('/') == target.trim_end_matches('/'))?;
    let volume_id = Path::new(&mount.source)
        .file_name()?
        .to_string_lossy()
        .into_owned();
    Some(StorageMount {
        host_path: mount.source.clone(),
        volume_id,
    })
}

pub fn classify_resources(
    stats: &ResourceStats,
    volume_mb: f64,
    thresholds: &ThresholdConfig,
    detection: &mut Detection,
) {
    detection.metrics = Metrics {
        cpu_percent: stats.cpu_percent,
        memory_mb: stats.memory_bytes as f64 / BYTES_PER_MB,
        network_mb: stats.network_bytes() as f64 / BYTES_PER_MB,
    };

    if volume_mb < thresholds.small_volume_mb && stats.cpu_percent > thresholds.high_cpu_percent {
        detection.add_type(TYPE_HIGH_CPU_SMALL_VOLUME);
    }

    let network = stats.network_bytes();
    if network > thresholds.high_network_bytes {
        detection.network.push(NetworkEvidence {
            reason: "Network I/O above threshold".to_string(),
            bytes: network,
            threshold: thresholds.high_network_bytes,
        });
        detection.add_type(TYPE_HIGH_NETWORK);
    }
}

pub fn classify_processes(processes: &[ProcessInfo], detection: &mut Detection) {
    let mut found = false;
    for process in processes {
        if let Some(pattern) = find_matches(&process.command, PROCESS_DENYLIST).first() {
            detection.processes.push(ProcessEvidence {
                pid: process.pid.clone(),
                command: process.command.clone(),
                pattern: (*pattern).to_string(),
            });
            found = true;
        }
    }
    if found {
        detection.add_type(TYPE_SUSPICIOUS_PROCESS);
    }
}

/// Each indicator category contributes its own type; the flat word list
/// contributes one shared type. The tail is kept on the detection either way.
pub fn classify_logs(logs: &str, detection: &mut Detection) {
    for category in LOG_CATEGORIES {
        if contains_any(logs, category.indicators) {
            detection.add_type(category.detection_type);
        }
    }
    if contains_any(logs, SUSPICIOUS_LOG_WORDS) {
        detection.add_type(TYPE_SUSPICIOUS_LOG);
    }
    detection.logs = logs.to_string();
}
