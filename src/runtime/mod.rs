//! Container runtime boundary.
//!
//! The scanner only needs five read operations from the runtime. They sit
//! behind [`ContainerRuntime`] so the engine can be driven by a fake in tests.

pub mod docker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::docker::DockerCli;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("runtime command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("unexpected runtime output for {what}: {message}")]
    Parse { what: String, message: String },
}

/// A bind or volume mount reported by `inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub kind: String,
    pub source: String,
    pub destination: String,
}

/// The subset of runtime metadata the scanner uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub mounts: Vec<Mount>,
}

/// One resource sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

impl ResourceStats {
    pub fn network_bytes(&self) -> u64 {
        self.network_rx_bytes.saturating_add(self.network_tx_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: String,
    pub command: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ids of every running container.
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    async fn stats(&self, id: &str) -> Result<ResourceStats, RuntimeError>;

    async fn processes(&self, id: &str) -> Result<Vec<ProcessInfo>, RuntimeError>;

    /// The last `tail` lines of combined stdout/stderr.
    async fn logs(&self, id: &str, tail: u32) -> Result<String, RuntimeError>;
}
