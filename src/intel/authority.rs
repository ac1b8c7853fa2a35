//! HTTP client for the remote hash authority.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::IntelError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A known-malicious hash as served by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHash {
    pub hash: String,
    pub file_name: String,
    pub detection_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HashSubmission<'a> {
    pub hash: &'a str,
    pub file_name: &'a str,
    pub detection_type: &'a str,
    pub server_id: &'a str,
    pub metadata: &'a serde_json::Value,
}

/// Flag history for one hosted server, across every scanner instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFlag {
    #[serde(default)]
    pub times_flagged: u32,
    #[serde(default)]
    pub last_flagged: Option<DateTime<Utc>>,
}

pub struct AuthorityClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AuthorityClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, IntelError> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// `GET hashes`: the full known-malicious set.
    pub async fn fetch_hashes(&self) -> Result<Vec<RemoteHash>, IntelError> {
        let url = format!("{}/hashes", self.base_url);
        debug!(%url, "fetching hash set");
        let response = self.authorized(self.http.get(&url)).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// `POST hashes`: report one hash.
    pub async fn submit_hash(&self, submission: &HashSubmission<'_>) -> Result<(), IntelError> {
        let url = format!("{}/hashes", self.base_url);
        debug!(%url, hash = submission.hash, "submitting hash");
        let response = self
            .authorized(self.http.post(&url))
            .json(submission)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// `GET servers/{id}`. A 404 means the server has never been flagged.
    pub async fn server_flag(&self, server_id: &str) -> Result<RemoteFlag, IntelError> {
        let url = format!("{}/servers/{}", self.base_url, server_id);
        let response = self.authorized(self.http.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RemoteFlag::default());
        }
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, IntelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IntelError::Status {
        status: status.as_u16(),
        body,
    })
}
