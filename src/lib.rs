//! abusescan -- abuse-detection scanner for game-server hosting containers.
//!
//! This crate provides the core library for container and volume inspection,
//! hash intelligence, detection storage, alerting and enforcement, scan
//! scheduling, and the control API.

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod inspect;
pub mod intel;
pub mod platform;
pub mod runtime;
pub mod scheduler;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::alert::AlertSink;
use crate::config::ScannerConfig;
use crate::detect::{DetectionEngine, DetectionStore};
use crate::intel::HashIntelStore;
use crate::platform::PlatformClient;
use crate::runtime::{ContainerRuntime, DockerCli};

/// Every long-lived component, constructed once and shared by the scan loop,
/// the control API, and one-shot CLI commands.
pub struct Scanner {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub intel: Arc<HashIntelStore>,
    pub platform: Arc<PlatformClient>,
    pub store: Arc<DetectionStore>,
    pub engine: Arc<DetectionEngine>,
}

impl Scanner {
    pub async fn build(config: &ScannerConfig, cancel: CancellationToken) -> Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerCli::new(config.scanner.docker_bin.clone()));
        let intel = Arc::new(
            HashIntelStore::from_config(&config.intel).context("building hash intelligence store")?,
        );
        let platform =
            Arc::new(PlatformClient::new(&config.panel).context("building control-plane client")?);

        let store = match &config.storage.db_path {
            Some(path) => {
                tracing::info!(db_path = %path.display(), "Initializing detection database");
                let pool = storage::open_pool(path)?;
                Arc::new(DetectionStore::with_pool(config.storage.max_detections, pool).await?)
            }
            None => Arc::new(DetectionStore::in_memory(config.storage.max_detections)),
        };

        let sink = Arc::new(
            AlertSink::new(
                Arc::clone(&platform),
                Arc::clone(&intel),
                &config.alerts,
                &config.thresholds,
            )
            .context("building alert sink")?,
        );
        let engine = Arc::new(DetectionEngine::new(
            config,
            Arc::clone(&runtime),
            Arc::clone(&intel),
            Arc::clone(&store),
            sink,
            cancel,
        ));

        Ok(Self {
            runtime,
            intel,
            platform,
            store,
            engine,
        })
    }
}

/// Start the scanner daemon: scan loop and control API, until SIGINT/SIGTERM.
pub async fn serve(config: ScannerConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let scanner = Scanner::build(&config, cancel.clone()).await?;

    let addr: SocketAddr = config
        .api
        .listen_address
        .parse()
        .with_context(|| format!("invalid api.listen_address {}", config.api.listen_address))?;
    if config.api.auth_token.is_none() && !addr.ip().is_loopback() {
        tracing::warn!(%addr, "control API is unauthenticated and not bound to loopback");
    }

    // Scan loop (background task)
    let status = scheduler::StatusHandle::default();
    let scan_loop = tokio::spawn(scheduler::run_scan_loop(
        Arc::clone(&scanner.engine),
        config.scanner.interval(),
        config.scanner.batch_size,
        status.clone(),
        cancel.clone(),
    ));

    // Control API
    let app = api::router(api::state::AppState {
        engine: Arc::clone(&scanner.engine),
        store: Arc::clone(&scanner.store),
        platform: Some(Arc::clone(&scanner.platform)),
        status,
        auth_token: config.api.auth_token.as_deref().map(Arc::from),
    });

    tracing::info!(%addr, "abusescan listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    scan_loop.await.context("scan loop panicked")?;
    tracing::info!("abusescan stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM and cancels `cancel`.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}
