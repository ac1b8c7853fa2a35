//! Detection records, evidence types, and the scan engine.

pub mod engine;
pub mod signatures;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::runtime::RuntimeError;

pub use self::engine::{DetectionEngine, ScanOutcome};
pub use self::store::{DetectionStats, DetectionStore};

// Category strings recorded in `Detection::types`.
pub const TYPE_HIGH_CPU_SMALL_VOLUME: &str = "High CPU with Small Volume";
pub const TYPE_HIGH_NETWORK: &str = "High Network Usage";
pub const TYPE_SUSPICIOUS_PROCESS: &str = "Suspicious Process";
pub const TYPE_SUSPICIOUS_LOG: &str = "Suspicious Log Content";
pub const TYPE_KNOWN_MALICIOUS_FILE: &str = "Known Malicious File";
pub const TYPE_SUSPICIOUS_FILE: &str = "Suspicious File";
pub const TYPE_SUSPICIOUS_CONTENT: &str = "Suspicious Content";
pub const TYPE_SMALL_JAR: &str = "Small JAR File";
pub const TYPE_PACKAGE_CACHE: &str = "Package Manager Artifacts";
pub const TYPE_SUSPICIOUS_STARTUP: &str = "Suspicious Startup Script";
pub const TYPE_BOT_DEPENDENCY: &str = "Messaging Bot Dependency";

/// Why a single container could not be scanned.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("container {container} has no persistent-storage mount at {target}")]
    NoStorageMount { container: String, target: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Resource sample taken once at scan time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEvidence {
    pub pid: String,
    pub command: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEvidence {
    pub path: String,
    pub reason: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEvidence {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NpmEvidence {
    pub path: String,
    pub package: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEvidence {
    pub reason: String,
    pub bytes: u64,
    pub threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentEvidence {
    pub path: String,
    pub reason: String,
    pub matches: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashMatch {
    pub path: String,
    pub hash: String,
    pub file_name: String,
    pub detection_type: String,
}

/// One scan's findings for one container.
///
/// Built by exactly one scan task, then frozen once stored. A rescan always
/// produces a new record with a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub container_id: String,
    pub volume_id: String,
    /// Categories in the order they were observed. Not deduplicated.
    pub types: Vec<String>,
    pub metrics: Metrics,
    pub processes: Vec<ProcessEvidence>,
    pub files: Vec<FileEvidence>,
    pub cache: Vec<CacheEvidence>,
    pub npm: Vec<NpmEvidence>,
    pub network: Vec<NetworkEvidence>,
    pub suspicious_content: Vec<ContentEvidence>,
    pub hash_matches: Vec<HashMatch>,
    pub logs: String,
    pub volume_size: f64,
}

impl Detection {
    pub fn new(container_id: &str, volume_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            container_id: short_id(container_id).to_string(),
            volume_id: volume_id.to_string(),
            types: Vec::new(),
            metrics: Metrics::default(),
            processes: Vec::new(),
            files: Vec::new(),
            cache: Vec::new(),
            npm: Vec::new(),
            network: Vec::new(),
            suspicious_content: Vec::new(),
            hash_matches: Vec::new(),
            logs: String::new(),
            volume_size: 0.0,
        }
    }

    pub fn add_type(&mut self, kind: &str) {
        self.types.push(kind.to_string());
    }

    pub fn has_type(&self, kind: &str) -> bool {
        self.types.iter().any(|t| t == kind)
    }

    /// Types with repeats removed, first occurrence order kept.
    pub fn distinct_types(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for t in &self.types {
            if !seen.contains(&t.as_str()) {
                seen.push(t);
            }
        }
        seen
    }

    /// True when the scan found nothing worth storing.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
            && self.processes.is_empty()
            && self.files.is_empty()
            && self.cache.is_empty()
            && self.npm.is_empty()
            && self.network.is_empty()
            && self.suspicious_content.is_empty()
            && self.hash_matches.is_empty()
    }
}

/// Runtime ids are reported in their 12-character short form.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_detection_is_empty() {
        let d = Detection::new("0123456789abcdef0123", "vol-1");
        assert!(d.is_empty());
        assert_eq!(d.container_id, "0123456789ab");
    }

    #[test]
    fn test_any_evidence_makes_non_empty() {
        let mut d = Detection::new("abc", "vol-1");
        d.cache.push(CacheEvidence {
            path: ".npm".to_string(),
            reason: "npm cache directory".to_string(),
        });
        assert!(!d.is_empty());

        let mut d = Detection::new("abc", "vol-1");
        d.add_type(TYPE_HIGH_NETWORK);
        assert!(!d.is_empty());
    }

    #[test]
    fn test_logs_and_metrics_alone_are_empty() {
        let mut d = Detection::new("abc", "vol-1");
        d.logs = "Done (3.2s)! For help, type \"help\"".to_string();
        d.metrics.cpu_percent = 12.0;
        d.volume_size = 120.0;
        assert!(d.is_empty());
    }

    #[test]
    fn test_types_keep_duplicates() {
        let mut d = Detection::new("abc", "vol-1");
        d.add_type(TYPE_SUSPICIOUS_FILE);
        d.add_type(TYPE_SUSPICIOUS_CONTENT);
        d.add_type(TYPE_SUSPICIOUS_FILE);
        assert_eq!(d.types.len(), 3);
        assert_eq!(
            d.distinct_types(),
            vec![TYPE_SUSPICIOUS_FILE, TYPE_SUSPICIOUS_CONTENT]
        );
    }

    #[test]
    fn test_serializes_camel_case() {
        let d = Detection::new("abc", "vol-1");
        let json = serde_json::to_value(&d).unwrap();
        assert!(json.get("containerId").is_some());
        assert!(json.get("hashMatches").is_some());
        assert!(json.get("suspiciousContent").is_some());
        assert!(json.get("volumeSize").is_some());
        assert!(json["metrics"].get("cpuPercent").is_some());
    }
}
