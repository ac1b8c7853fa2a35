//! Scan scheduling: fixed-interval cycles over every running container,
//! processed in bounded concurrent batches.

pub mod engine;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

pub use self::engine::{run_cycle, run_scan_loop, CycleReport};

/// Split `ids` into consecutive batches of at most `size`.
pub fn partition_batches(ids: &[String], size: usize) -> Vec<Vec<String>> {
    ids.chunks(size.max(1)).map(<[String]>::to_vec).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub state: ScanState,
    pub cycles_completed: u64,
    pub last_cycle_started: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleReport>,
}

/// Shared view of the scan loop, read by the control API.
#[derive(Clone, Default)]
pub struct StatusHandle(Arc<RwLock<SchedulerStatus>>);

impl StatusHandle {
    pub async fn snapshot(&self) -> SchedulerStatus {
        self.0.read().await.clone()
    }

    pub(crate) async fn cycle_started(&self) {
        let mut status = self.0.write().await;
        status.state = ScanState::Scanning;
        status.last_cycle_started = Some(Utc::now());
    }

    pub(crate) async fn cycle_finished(&self, report: Option<CycleReport>) {
        let mut status = self.0.write().await;
        status.state = ScanState::Idle;
        status.cycles_completed += 1;
        if report.is_some() {
            status.last_cycle = report;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{}", i)).collect()
    }

    #[test]
    fn test_partition_twelve_by_five() {
        let sizes: Vec<usize> = partition_batches(&ids(12), 5).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
    }

    #[test]
    fn test_partition_keeps_order() {
        let batches = partition_batches(&ids(3), 2);
        assert_eq!(batches, vec![vec!["c0", "c1"], vec!["c2"]]);
        assert!(partition_batches(&[], 5).is_empty());
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let status = StatusHandle::default();
        assert_eq!(status.snapshot().await.state, ScanState::Idle);

        status.cycle_started().await;
        assert_eq!(status.snapshot().await.state, ScanState::Scanning);

        status.cycle_finished(None).await;
        let snapshot = status.snapshot().await;
        assert_eq!(snapshot.state, ScanState::Idle);
        assert_eq!(snapshot.cycles_completed, 1);
    }
}
