use std::sync::Arc;

use crate::detect::{DetectionEngine, DetectionStore};
use crate::platform::PlatformClient;
use crate::scheduler::StatusHandle;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DetectionEngine>,
    pub store: Arc<DetectionStore>,
    /// Resolves volumes to nodes for `/api/stats`. `None` reports `unknown`.
    pub platform: Option<Arc<PlatformClient>>,
    pub status: StatusHandle,
    pub auth_token: Option<Arc<str>>,
}
