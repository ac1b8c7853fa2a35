use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Detection, DetectionStore, ScanError};
use crate::alert::DetectionSink;
use crate::config::{ScannerConfig, MAX_FLAG_WINDOW_HOURS};
use crate::inspect::{directory_size, ContainerInspector, VolumeInspector, VolumeLimits};
use crate::intel::{FlagStatus, HashIntelStore};
use crate::runtime::ContainerRuntime;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Result of scanning one container.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// The server was flagged inside the re-alert window; nothing was read.
    Skipped {
        volume_id: String,
        last_flagged_at: Option<DateTime<Utc>>,
    },
    /// The scan found nothing. Nothing was stored.
    Clean { volume_id: String },
    /// A detection was stored and dispatched.
    Detected(Detection),
    /// Shutdown interrupted the volume walk. The partial result was dropped.
    Cancelled { volume_id: String },
}

impl ScanOutcome {
    pub fn detection(&self) -> Option<&Detection> {
        match self {
            ScanOutcome::Detected(d) => Some(d),
            _ => None,
        }
    }
}

/// Composes the inspectors into one scan per container.
///
/// All collaborators are injected, so the engine runs against fake runtimes
/// and recording sinks in tests.
pub struct DetectionEngine {
    runtime: Arc<dyn ContainerRuntime>,
    intel: Arc<HashIntelStore>,
    store: Arc<DetectionStore>,
    sink: Arc<dyn DetectionSink>,
    containers: ContainerInspector,
    volumes: VolumeInspector,
    flag_window: chrono::Duration,
    cancel: CancellationToken,
}

impl DetectionEngine {
    pub fn new(
        config: &ScannerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        intel: Arc<HashIntelStore>,
        store: Arc<DetectionStore>,
        sink: Arc<dyn DetectionSink>,
        cancel: CancellationToken,
    ) -> Self {
        let containers =
            ContainerInspector::new(Arc::clone(&runtime), &config.scanner, &config.thresholds);
        let volumes = VolumeInspector::new(
            Arc::clone(&intel),
            VolumeLimits::from_config(&config.scanner, &config.thresholds),
        );
        Self {
            runtime,
            intel,
            store,
            sink,
            containers,
            volumes,
            flag_window: chrono::Duration::hours(
                config.thresholds.flag_window_hours.clamp(1, MAX_FLAG_WINDOW_HOURS),
            ),
            cancel,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn intel(&self) -> &Arc<HashIntelStore> {
        &self.intel
    }

    pub fn store(&self) -> &Arc<DetectionStore> {
        &self.store
    }

    /// Scan one container end to end.
    ///
    /// Errors cover this container only: a missing storage mount or a
    /// runtime failure while reading it.
    pub async fn scan_container(&self, id: &str) -> Result<ScanOutcome, ScanError> {
        let (info, mount) = self.containers.locate(id).await?;
        let volume_id = mount.volume_id.clone();

        match self.intel.is_flagged(&volume_id).await {
            FlagStatus::Known(flag) if flag.flagged_within(self.flag_window, Utc::now()) => {
                info!(
                    container = %info.id,
                    volume = %volume_id,
                    times_flagged = flag.times_flagged,
                    "server flagged recently, skipping scan"
                );
                return Ok(ScanOutcome::Skipped {
                    volume_id,
                    last_flagged_at: flag.last_flagged_at,
                });
            }
            FlagStatus::Known(_) => {}
            FlagStatus::Unknown => {
                debug!(volume = %volume_id, "flag status unknown, scanning anyway");
            }
        }

        let mut detection = Detection::new(&info.id, &volume_id);
        let host_path = Path::new(&mount.host_path);
        detection.volume_size = directory_size(host_path).await as f64 / BYTES_PER_MB;

        self.containers
            .inspect(&info.id, detection.volume_size, &mut detection)
            .await?;
        self.volumes
            .inspect(host_path, &volume_id, &mut detection, &self.cancel)
            .await;

        if self.cancel.is_cancelled() {
            info!(container = %detection.container_id, volume = %volume_id, "scan cancelled, discarding partial result");
            return Ok(ScanOutcome::Cancelled { volume_id });
        }

        if detection.is_empty() {
            debug!(container = %detection.container_id, volume = %volume_id, "scan clean");
            return Ok(ScanOutcome::Clean { volume_id });
        }

        info!(
            id = %detection.id,
            container = %detection.container_id,
            volume = %volume_id,
            types = ?detection.distinct_types(),
            "detection recorded"
        );
        self.store.insert(detection.clone()).await;
        self.sink.on_detection(&detection).await;
        Ok(ScanOutcome::Detected(detection))
    }
}
