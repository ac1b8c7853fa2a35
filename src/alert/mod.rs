//! Alert and enforcement dispatch.
//!
//! The detection engine hands every stored detection to a [`DetectionSink`].
//! [`AlertSink`] resolves control-plane context, posts the report to the
//! webhook, then suspends the owning server. Each step fails independently.

pub mod report;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::{info, warn};

use crate::config::{AlertConfig, ThresholdConfig};
use crate::detect::Detection;
use crate::intel::HashIntelStore;
use crate::platform::PlatformClient;

pub use self::report::{AlertReport, ReportContext};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// Receives every detection the engine stores.
#[async_trait]
pub trait DetectionSink: Send + Sync {
    async fn on_detection(&self, detection: &Detection);
}

pub struct AlertSink {
    platform: Arc<PlatformClient>,
    intel: Arc<HashIntelStore>,
    http: Client,
    webhook_url: Option<String>,
    auto_suspend: bool,
    recent_account_days: i64,
}

impl AlertSink {
    pub fn new(
        platform: Arc<PlatformClient>,
        intel: Arc<HashIntelStore>,
        alerts: &AlertConfig,
        thresholds: &ThresholdConfig,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            platform,
            intel,
            http,
            webhook_url: alerts.webhook_url.clone(),
            auto_suspend: alerts.auto_suspend,
            recent_account_days: thresholds.recent_account_days,
        })
    }

    /// Server, owner, and node for a volume. Lookup failures leave gaps.
    async fn resolve_context(&self, volume_id: &str) -> ReportContext {
        let mut context = ReportContext::default();

        let server = match self.platform.server_by_volume_uuid(volume_id).await {
            Ok(server) => server,
            Err(e) => {
                warn!(volume = volume_id, error = %e, "server lookup failed");
                None
            }
        };
        let Some(server) = server else {
            return context;
        };

        match self.platform.user_by_id(server.user).await {
            Ok(user) => context.user = Some(user),
            Err(e) => warn!(user_id = server.user, error = %e, "user lookup failed"),
        }
        match self.platform.node_by_id(server.node).await {
            Ok(node) => context.node = Some(node),
            Err(e) => warn!(node_id = server.node, error = %e, "node lookup failed"),
        }
        context.server = Some(server);
        context
    }

    async fn send(&self, report: &AlertReport) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let result = self
            .http
            .post(url)
            .json(&report.to_webhook_payload())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(title = %report.title, "alert delivered");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "webhook rejected alert");
            }
            Err(e) => warn!(error = %e, "alert delivery failed"),
        }
    }
}

#[async_trait]
impl DetectionSink for AlertSink {
    async fn on_detection(&self, detection: &Detection) {
        let now = Utc::now();
        let context = self.resolve_context(&detection.volume_id).await;
        let report = AlertReport::build(detection, &context, self.recent_account_days, now);

        self.send(&report).await;

        if detection.types.is_empty() || !self.auto_suspend {
            return;
        }
        let Some(server) = &context.server else {
            warn!(volume = %detection.volume_id, "no control-plane server for volume, cannot suspend");
            return;
        };

        let suspended = self.platform.suspend(server.id).await;
        info!(
            server_id = server.id,
            volume = %detection.volume_id,
            suspended,
            "enforcement attempted"
        );
        // An unsuspended server stays eligible for the next cycle.
        if suspended {
            self.intel.record_flag(&detection.volume_id, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PanelConfig;
    use crate::detect::{ProcessEvidence, TYPE_SUSPICIOUS_PROCESS};
    use crate::intel::{FlagStatus, IntelSettings};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VOLUME: &str = "8d2f0c1e-aaaa-bbbb-cccc-123456789abc";

    async fn mock_panel(panel: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/application/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{"object": "server", "attributes": {
                    "id": 4, "uuid": VOLUME, "identifier": "8d2f0c1e", "name": "Survival",
                    "user": 11, "node": 1, "suspended": false
                }}],
                "meta": {"pagination": {"current_page": 1, "total_pages": 1}}
            })))
            .mount(panel)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/application/users/11"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "attributes": {"id": 11, "username": "steve", "email": "s@example.com",
                               "created_at": "2020-01-01T00:00:00+00:00"}
            })))
            .mount(panel)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/application/nodes/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "attributes": {"id": 1, "name": "de-fra-1", "fqdn": "fra1.example.com"}
            })))
            .mount(panel)
            .await;
    }

    fn sink(panel: &MockServer, webhook: Option<String>, auto_suspend: bool) -> (AlertSink, Arc<HashIntelStore>) {
        let platform = Arc::new(
            PlatformClient::new(&PanelConfig {
                url: panel.uri(),
                api_key: "k".to_string(),
                server_cache_secs: 300,
                page_size: 50,
            })
            .unwrap(),
        );
        let intel = Arc::new(HashIntelStore::local(IntelSettings::default()));
        let alerts = AlertConfig {
            webhook_url: webhook,
            auto_suspend,
        };
        let sink = AlertSink::new(platform, Arc::clone(&intel), &alerts, &ThresholdConfig::default())
            .unwrap();
        (sink, intel)
    }

    fn detection() -> Detection {
        let mut d = Detection::new("0123456789abcdef", VOLUME);
        d.processes.push(ProcessEvidence {
            pid: "77".to_string(),
            command: "./xmrig".to_string(),
            pattern: "xmrig".to_string(),
        });
        d.add_type(TYPE_SUSPICIOUS_PROCESS);
        d
    }

    #[tokio::test]
    async fn test_alert_then_suspend() {
        let panel = MockServer::start().await;
        mock_panel(&panel).await;
        Mock::given(method("POST"))
            .and(path("/api/application/servers/4/suspend"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&panel)
            .await;

        let webhook = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&webhook)
            .await;

        let (sink, intel) = sink(&panel, Some(format!("{}/hook", webhook.uri())), true);
        sink.on_detection(&detection()).await;

        let requests = webhook.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let fields = body["embeds"][0]["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["name"] == "Node" && f["value"] == "de-fra-1"));

        match intel.is_flagged(VOLUME).await {
            FlagStatus::Known(flag) => assert_eq!(flag.times_flagged, 1),
            FlagStatus::Unknown => panic!("flag should be recorded locally"),
        }
    }

    #[tokio::test]
    async fn test_webhook_failure_does_not_block_suspension() {
        let panel = MockServer::start().await;
        mock_panel(&panel).await;
        Mock::given(method("POST"))
            .and(path("/api/application/servers/4/suspend"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&panel)
            .await;

        let webhook = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&webhook)
            .await;

        let (sink, _) = sink(&panel, Some(webhook.uri()), true);
        sink.on_detection(&detection()).await;
    }

    #[tokio::test]
    async fn test_rejected_suspension_is_not_recorded() {
        let panel = MockServer::start().await;
        mock_panel(&panel).await;
        Mock::given(method("POST"))
            .and(path("/api/application/servers/4/suspend"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&panel)
            .await;

        let (sink, intel) = sink(&panel, None, true);
        sink.on_detection(&detection()).await;

        match intel.is_flagged(VOLUME).await {
            FlagStatus::Known(flag) => {
                assert_eq!(flag.times_flagged, 0);
                assert!(flag.last_flagged_at.is_none());
            }
            FlagStatus::Unknown => panic!("local store always knows"),
        }
    }

    #[tokio::test]
    async fn test_alert_only_mode_never_suspends() {
        let panel = MockServer::start().await;
        mock_panel(&panel).await;
        Mock::given(method("POST"))
            .and(path("/api/application/servers/4/suspend"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&panel)
            .await;

        let (sink, intel) = sink(&panel, None, false);
        sink.on_detection(&detection()).await;

        match intel.is_flagged(VOLUME).await {
            FlagStatus::Known(flag) => assert!(flag.last_flagged_at.is_none()),
            FlagStatus::Unknown => panic!("local store always knows"),
        }
    }

    #[tokio::test]
    async fn test_evidence_without_types_is_not_enforced() {
        let panel = MockServer::start().await;
        mock_panel(&panel).await;
        Mock::given(method("POST"))
            .and(path("/api/application/servers/4/suspend"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&panel)
            .await;

        let (sink, _) = sink(&panel, None, true);
        let mut d = detection();
        d.types.clear();
        sink.on_detection(&d).await;
    }
}
