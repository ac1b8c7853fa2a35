//! Hosting control-plane client.
//!
//! Read lookups are cached in memory: the server list for a short window,
//! users and nodes for the process lifetime. Suspension is the only write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PanelConfig;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("control plane returned {status} for {path}")]
    Status { status: u16, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub uuid: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub user: u64,
    pub node: u64,
    #[serde(default)]
    pub suspended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fqdn: String,
}

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Object<T> {
    attributes: T,
}

#[derive(Deserialize)]
struct ListPage<T> {
    data: Vec<Object<T>>,
    #[serde(default)]
    meta: Option<ListMeta>,
}

#[derive(Deserialize)]
struct ListMeta {
    pagination: Pagination,
}

#[derive(Deserialize)]
struct Pagination {
    current_page: u32,
    total_pages: u32,
}

// ---------------------------------------------------------------------------
// PlatformClient
// ---------------------------------------------------------------------------

pub struct PlatformClient {
    http: Client,
    base_url: String,
    api_key: String,
    page_size: u32,
    server_ttl: Duration,
    servers: RwLock<Option<(Instant, Arc<Vec<Server>>)>>,
    users: RwLock<HashMap<u64, User>>,
    nodes: RwLock<HashMap<u64, Node>>,
}

impl PlatformClient {
    pub fn new(config: &PanelConfig) -> Result<Self, PlatformError> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            page_size: config.page_size.max(1),
            server_ttl: Duration::from_secs(config.server_cache_secs),
            servers: RwLock::new(None),
            users: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        let url = format!("{}/api/application/{}", self.base_url, path);
        debug!(%url, "GET request");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PlatformError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    /// Every server on the platform, walking all pages.
    ///
    /// Served from a cache younger than the configured window unless `force`.
    pub async fn list_servers(&self, force: bool) -> Result<Arc<Vec<Server>>, PlatformError> {
        if !force {
            if let Some((fetched_at, servers)) = self.servers.read().await.as_ref() {
                if fetched_at.elapsed() < self.server_ttl {
                    return Ok(Arc::clone(servers));
                }
            }
        }

        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!("servers?page={}&per_page={}", page, self.page_size);
            let body: ListPage<Server> = self.get(&path).await?;
            all.extend(body.data.into_iter().map(|o| o.attributes));
            match body.meta {
                Some(meta) if meta.pagination.current_page < meta.pagination.total_pages => {
                    page = meta.pagination.current_page + 1;
                }
                _ => break,
            }
        }

        debug!(count = all.len(), "server list refreshed");
        let servers = Arc::new(all);
        *self.servers.write().await = Some((Instant::now(), Arc::clone(&servers)));
        Ok(servers)
    }

    /// Find the server whose UUID names a volume. Linear in the server count.
    pub async fn server_by_volume_uuid(&self, uuid: &str) -> Result<Option<Server>, PlatformError> {
        let servers = self.list_servers(false).await?;
        Ok(servers.iter().find(|s| s.uuid == uuid).cloned())
    }

    pub async fn user_by_id(&self, id: u64) -> Result<User, PlatformError> {
        if let Some(user) = self.users.read().await.get(&id) {
            return Ok(user.clone());
        }
        let body: Object<User> = self.get(&format!("users/{}", id)).await?;
        self.users.write().await.insert(id, body.attributes.clone());
        Ok(body.attributes)
    }

    pub async fn node_by_id(&self, id: u64) -> Result<Node, PlatformError> {
        if let Some(node) = self.nodes.read().await.get(&id) {
            return Ok(node.clone());
        }
        let body: Object<Node> = self.get(&format!("nodes/{}", id)).await?;
        self.nodes.write().await.insert(id, body.attributes.clone());
        Ok(body.attributes)
    }

    /// Suspend a server. Failures are logged and reported as `false`.
    pub async fn suspend(&self, server_id: u64) -> bool {
        let url = format!("{}/api/application/servers/{}/suspend", self.base_url, server_id);
        let result = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(server_id, "server suspended");
                true
            }
            Ok(response) => {
                warn!(server_id, status = response.status().as_u16(), "suspension rejected");
                false
            }
            Err(e) => {
                warn!(server_id, error = %e, "suspension request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> PlatformClient {
        PlatformClient::new(&PanelConfig {
            url: server.uri(),
            api_key: "ptla_test".to_string(),
            server_cache_secs: 300,
            page_size: 2,
        })
        .unwrap()
    }

    fn server_obj(id: u64, uuid: &str) -> serde_json::Value {
        json!({"object": "server", "attributes": {
            "id": id, "uuid": uuid, "identifier": &uuid[..8], "name": format!("srv{}", id),
            "user": 10 + id, "node": 1, "suspended": false
        }})
    }

    #[tokio::test]
    async fn test_list_servers_walks_pages_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/application/servers"))
            .and(query_param("page", "1"))
            .and(header("authorization", "Bearer ptla_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [server_obj(1, "aaaaaaaa-1111"), server_obj(2, "bbbbbbbb-2222")],
                "meta": {"pagination": {"total": 3, "count": 2, "per_page": 2, "current_page": 1, "total_pages": 2}}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/application/servers"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [server_obj(3, "cccccccc-3333")],
                "meta": {"pagination": {"total": 3, "count": 1, "per_page": 2, "current_page": 2, "total_pages": 2}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let platform = client(&server);
        let servers = platform.list_servers(false).await.unwrap();
        assert_eq!(servers.len(), 3);

        // Second call is served from cache.
        let found = platform.server_by_volume_uuid("cccccccc-3333").await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(3));
        assert!(platform.server_by_volume_uuid("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_lookup_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/application/users/11"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "user",
                "attributes": {"id": 11, "username": "steve", "email": "steve@example.com",
                               "created_at": "2026-10-14T08:00:00+00:00"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let platform = client(&server);
        let first = platform.user_by_id(11).await.unwrap();
        let second = platform.user_by_id(11).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.username, "steve");
        assert!(first.created_at.is_some());
    }

    #[tokio::test]
    async fn test_node_lookup_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/application/nodes/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let platform = client(&server);
        let err = platform.node_by_id(9).await.unwrap_err();
        assert!(matches!(err, PlatformError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_suspend_reports_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/application/servers/1/suspend"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/application/servers/2/suspend"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let platform = client(&server);
        assert!(platform.suspend(1).await);
        assert!(!platform.suspend(2).await);
    }
}
