use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{partition_batches, StatusHandle};
use crate::detect::{DetectionEngine, ScanOutcome};
use crate::runtime::RuntimeError;

/// Tally of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub containers: usize,
    pub batches: usize,
    pub detected: usize,
    pub clean: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Scan every running container once, `batch_size` at a time.
///
/// Every member of a batch finishes before the next batch starts. A failing
/// container is logged and counted; it never aborts the cycle. Cancellation
/// is honoured between batches.
pub async fn run_cycle(
    engine: &DetectionEngine,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<CycleReport, RuntimeError> {
    let started = Instant::now();
    let ids = engine.runtime().list_running().await?;
    let mut report = CycleReport {
        containers: ids.len(),
        ..Default::default()
    };

    for batch in partition_batches(&ids, batch_size) {
        if cancel.is_cancelled() {
            info!("scan cycle cancelled between batches");
            break;
        }
        report.batches += 1;

        let results = join_all(batch.iter().map(|id| engine.scan_container(id))).await;
        for (id, result) in batch.iter().zip(results) {
            match result {
                Ok(ScanOutcome::Detected(_)) => report.detected += 1,
                Ok(ScanOutcome::Clean { .. }) => report.clean += 1,
                Ok(ScanOutcome::Skipped { .. }) => report.skipped += 1,
                Ok(ScanOutcome::Cancelled { .. }) => report.cancelled += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(container = %id, error = %e, "container scan failed");
                }
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

/// Main scan loop.
///
/// Syncs the hash store once, then alternates between a full cycle and a
/// fixed sleep until `cancel` fires.
pub async fn run_scan_loop(
    engine: Arc<DetectionEngine>,
    interval: Duration,
    batch_size: usize,
    status: StatusHandle,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), batch_size, "scan loop started");

    if engine.intel().has_authority() {
        match engine.intel().sync().await {
            Ok(count) => info!(count, "initial hash sync complete"),
            Err(e) => warn!(error = %e, "initial hash sync failed, continuing with empty cache"),
        }
    }

    loop {
        status.cycle_started().await;
        let report = match run_cycle(&engine, batch_size, &cancel).await {
            Ok(report) => {
                info!(
                    containers = report.containers,
                    detected = report.detected,
                    skipped = report.skipped,
                    cancelled = report.cancelled,
                    failed = report.failed,
                    duration_ms = report.duration_ms,
                    "scan cycle complete"
                );
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "failed to list containers");
                None
            }
        };
        status.cycle_finished(report).await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("scan loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::DetectionSink;
    use crate::config::ScannerConfig;
    use crate::detect::{Detection, DetectionStore};
    use crate::intel::{HashIntelStore, IntelSettings};
    use crate::runtime::{ContainerInfo, ContainerRuntime, Mount, ProcessInfo, ResourceStats};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Every container maps to the same empty volume. `stats` is slow so
    /// batch members overlap.
    struct SlowRuntime {
        ids: Vec<String>,
        volume: String,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        events: Mutex<Vec<(String, bool)>>,
        broken: Option<String>,
    }

    impl SlowRuntime {
        fn new(n: usize, volume: &std::path::Path) -> Self {
            Self {
                ids: (0..n).map(|i| format!("container{:02}", i)).collect(),
                volume: volume.display().to_string(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                events: Mutex::new(Vec::new()),
                broken: None,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for SlowRuntime {
        async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
            Ok(self.ids.clone())
        }

        async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
            if self.broken.as_deref() == Some(id) {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            Ok(ContainerInfo {
                id: id.to_string(),
                name: id.to_string(),
                mounts: vec![Mount {
                    kind: "bind".to_string(),
                    source: self.volume.clone(),
                    destination: "/home/container".to_string(),
                }],
            })
        }

        async fn stats(&self, id: &str) -> Result<ResourceStats, RuntimeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.events.lock().unwrap().push((id.to_string(), true));
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.events.lock().unwrap().push((id.to_string(), false));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ResourceStats::default())
        }

        async fn processes(&self, _id: &str) -> Result<Vec<ProcessInfo>, RuntimeError> {
            Ok(Vec::new())
        }

        async fn logs(&self, _id: &str, _tail: u32) -> Result<String, RuntimeError> {
            Ok(String::new())
        }
    }

    struct NoopSink;

    #[async_trait]
    impl DetectionSink for NoopSink {
        async fn on_detection(&self, _detection: &Detection) {}
    }

    fn engine(runtime: Arc<SlowRuntime>) -> DetectionEngine {
        DetectionEngine::new(
            &ScannerConfig::default(),
            runtime,
            Arc::new(HashIntelStore::local(IntelSettings::default())),
            Arc::new(DetectionStore::in_memory(100)),
            Arc::new(NoopSink),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_cycle_runs_sequential_batches() {
        let volume = tempfile::tempdir().unwrap();
        let runtime = Arc::new(SlowRuntime::new(12, volume.path()));
        let engine = engine(Arc::clone(&runtime));

        let report = run_cycle(&engine, 5, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.containers, 12);
        assert_eq!(report.batches, 3);
        assert_eq!(report.clean, 12);
        assert_eq!(runtime.max_in_flight.load(Ordering::SeqCst), 5);

        // No container of a later batch starts before the earlier batch ends.
        let events = runtime.events.lock().unwrap().clone();
        let batch_of = |id: &str| id.trim_start_matches("container").parse::<usize>().unwrap() / 5;
        let mut finished = [0usize; 3];
        for (id, is_start) in &events {
            let batch = batch_of(id.as_str());
            if *is_start {
                for earlier in 0..batch {
                    let expected = if earlier < 2 { 5 } else { 2 };
                    assert_eq!(finished[earlier], expected, "{} started early", id);
                }
            } else {
                finished[batch] += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_failed_container_does_not_abort_cycle() {
        let volume = tempfile::tempdir().unwrap();
        let mut runtime = SlowRuntime::new(6, volume.path());
        runtime.broken = Some("container02".to_string());
        let engine = engine(Arc::new(runtime));

        let report = run_cycle(&engine, 5, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.clean, 5);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_stops_before_next_batch() {
        let volume = tempfile::tempdir().unwrap();
        let runtime = Arc::new(SlowRuntime::new(12, volume.path()));
        let engine = engine(runtime);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run_cycle(&engine, 5, &cancel).await.unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(report.containers, 12);
    }

    #[tokio::test]
    async fn test_loop_exits_on_cancel() {
        let volume = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine(Arc::new(SlowRuntime::new(2, volume.path()))));
        let status = StatusHandle::default();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_scan_loop(
            engine,
            Duration::from_secs(3600),
            5,
            status.clone(),
            cancel.clone(),
        ));
        while status.snapshot().await.cycles_completed == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let snapshot = status.snapshot().await;
        assert_eq!(snapshot.cycles_completed, 1);
        assert_eq!(snapshot.last_cycle.unwrap().clean, 2);
    }
}
