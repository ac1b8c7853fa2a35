//! Hash intelligence store.
//!
//! A local cache of known-malicious file hashes and per-server flag history,
//! kept in sync with an optional remote authority. Every remote failure is
//! logged and absorbed here: callers only ever see cached data, "absent", or
//! [`FlagStatus::Unknown`].

pub mod authority;

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::IntelConfig;

pub use self::authority::{AuthorityClient, HashSubmission, RemoteFlag, RemoteHash};

/// Retry spacing after a failed sync, capped by the sync interval.
const SYNC_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum IntelError {
    #[error("hash authority request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hash authority returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no hash authority configured")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HashEntry {
    pub file_name: String,
    pub detection_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFlag {
    pub times_flagged: u32,
    pub last_flagged_at: Option<DateTime<Utc>>,
}

impl ServerFlag {
    /// Whether the last flag is strictly younger than `window` at `now`.
    pub fn flagged_within(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_flagged_at {
            Some(at) => now.signed_duration_since(at) < window,
            None => false,
        }
    }
}

/// Result of a flag lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagStatus {
    Known(ServerFlag),
    /// The authority could not be reached. Callers proceed with the scan.
    Unknown,
}

/// Cache sizing and timing.
#[derive(Debug, Clone)]
pub struct IntelSettings {
    pub sync_interval: Duration,
    pub cache_ttl: Duration,
    pub max_hashes: u64,
    pub max_flags: u64,
    pub flag_ttl: Duration,
}

impl IntelSettings {
    pub fn from_config(config: &IntelConfig) -> Self {
        let sync_interval = Duration::from_secs(config.sync_interval_secs);
        Self {
            sync_interval,
            cache_ttl: sync_interval,
            max_hashes: config.max_hashes,
            max_flags: config.max_flags,
            flag_ttl: Duration::from_secs(config.flag_ttl_secs),
        }
    }
}

impl Default for IntelSettings {
    fn default() -> Self {
        Self::from_config(&IntelConfig::default())
    }
}

#[derive(Default)]
struct SyncState {
    last_success: Option<Instant>,
    last_attempt: Option<Instant>,
    /// The authority's set as of the last successful sync.
    known_good: Vec<(String, HashEntry)>,
}

/// Live hash cache plus the local submissions made since it was built.
struct HashTable {
    cache: Cache<String, HashEntry>,
    submitted: Vec<(Instant, String, HashEntry)>,
}

pub struct HashIntelStore {
    authority: Option<AuthorityClient>,
    /// Swapped wholesale on every sync attempt.
    hashes: RwLock<HashTable>,
    flags: Cache<String, ServerFlag>,
    settings: IntelSettings,
    sync_state: Mutex<SyncState>,
}

impl HashIntelStore {
    pub fn new(authority: Option<AuthorityClient>, settings: IntelSettings) -> Self {
        let hashes = RwLock::new(HashTable {
            cache: build_hash_cache(&settings),
            submitted: Vec::new(),
        });
        let flags = Cache::builder()
            .max_capacity(settings.max_flags)
            .time_to_live(settings.flag_ttl)
            .build();
        Self {
            authority,
            hashes,
            flags,
            settings,
            sync_state: Mutex::new(SyncState::default()),
        }
    }

    /// Build from config; a missing `intel.url` yields a local-only store.
    pub fn from_config(config: &IntelConfig) -> Result<Self, IntelError> {
        let authority = match &config.url {
            Some(url) => Some(AuthorityClient::new(url, config.api_key.clone())?),
            None => {
                info!("no hash authority configured, running with local hash cache only");
                None
            }
        };
        Ok(Self::new(authority, IntelSettings::from_config(config)))
    }

    /// A store with no remote authority.
    pub fn local(settings: IntelSettings) -> Self {
        Self::new(None, settings)
    }

    pub fn has_authority(&self) -> bool {
        self.authority.is_some()
    }

    /// Look up a content hash, syncing first when the last successful sync
    /// is older than the sync interval.
    pub async fn lookup(&self, hash: &str) -> Option<HashEntry> {
        self.sync_if_stale().await;
        self.hash_cache().get(hash)
    }

    fn hash_cache(&self) -> Cache<String, HashEntry> {
        self.hashes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .cache
            .clone()
    }

    /// Record a hash locally and report it to the authority.
    ///
    /// The local write happens first, so the hash is recognized for the rest
    /// of the cycle even when the remote call fails.
    pub async fn submit(
        &self,
        hash: &str,
        file_name: &str,
        detection_type: &str,
        server_id: &str,
        metadata: serde_json::Value,
    ) {
        let entry = HashEntry {
            file_name: file_name.to_string(),
            detection_type: detection_type.to_string(),
        };
        {
            // Held across both writes so a concurrent swap sees the submission.
            let mut table = self
                .hashes
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            table.cache.insert(hash.to_string(), entry.clone());
            // Only a sync can drop the entry, and a local store never syncs.
            if self.authority.is_some() {
                table.submitted.push((Instant::now(), hash.to_string(), entry));
                if table.submitted.len() as u64 > self.settings.max_hashes {
                    table.submitted.remove(0);
                }
            }
        }

        let Some(authority) = &self.authority else {
            return;
        };
        let submission = HashSubmission {
            hash,
            file_name,
            detection_type,
            server_id,
            metadata: &metadata,
        };
        if let Err(e) = authority.submit_hash(&submission).await {
            warn!(hash, server_id, error = %e, "failed to submit hash to authority");
        }
    }

    /// Flag history for `server_id`: local cache first, then the authority.
    pub async fn is_flagged(&self, server_id: &str) -> FlagStatus {
        if let Some(flag) = self.flags.get(server_id) {
            return FlagStatus::Known(flag);
        }

        let Some(authority) = &self.authority else {
            return FlagStatus::Known(ServerFlag {
                times_flagged: 0,
                last_flagged_at: None,
            });
        };

        match authority.server_flag(server_id).await {
            Ok(remote) => {
                let flag = ServerFlag {
                    times_flagged: remote.times_flagged,
                    last_flagged_at: remote.last_flagged,
                };
                self.flags.insert(server_id.to_string(), flag);
                FlagStatus::Known(flag)
            }
            Err(e) => {
                warn!(server_id, error = %e, "flag lookup failed, status unknown");
                FlagStatus::Unknown
            }
        }
    }

    /// Note a new flag locally so the re-alert window holds before the
    /// authority catches up.
    pub fn record_flag(&self, server_id: &str, at: DateTime<Utc>) {
        let times_flagged = self
            .flags
            .get(server_id)
            .map_or(0, |f| f.times_flagged)
            .saturating_add(1);
        self.flags.insert(
            server_id.to_string(),
            ServerFlag {
                times_flagged,
                last_flagged_at: Some(at),
            },
        );
    }

    /// Replace the local hash set with the authority's full set.
    ///
    /// Returns the number of hashes loaded.
    pub async fn sync(&self) -> Result<usize, IntelError> {
        let mut state = self.sync_state.lock().await;
        self.sync_locked(&mut state).await
    }

    async fn sync_if_stale(&self) {
        if self.authority.is_none() {
            return;
        }
        let mut state = self.sync_state.lock().await;
        let now = Instant::now();
        let stale = state
            .last_success
            .map_or(true, |t| now.duration_since(t) >= self.settings.sync_interval);
        if !stale {
            return;
        }
        let retry_after = SYNC_RETRY.min(self.settings.sync_interval);
        let cooling_down = state
            .last_attempt
            .is_some_and(|t| state.last_success.map_or(true, |s| t > s) && now.duration_since(t) < retry_after);
        if cooling_down {
            return;
        }
        if let Err(e) = self.sync_locked(&mut state).await {
            warn!(error = %e, "hash sync failed, keeping previous cache");
        }
    }

    /// Rebuild the live cache from `remote` plus local submissions.
    ///
    /// After a successful fetch (`keep_since` set), submissions made before
    /// the fetch started are replayed this once and then dropped. After a
    /// failed one (`None`), every entry still live is carried over as well.
    fn rebuild(&self, remote: &[(String, HashEntry)], keep_since: Option<Instant>) {
        let fresh = build_hash_cache(&self.settings);
        for (hash, entry) in remote {
            fresh.insert(hash.clone(), entry.clone());
        }

        let mut table = self
            .hashes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if keep_since.is_none() {
            for (hash, entry) in table.cache.iter() {
                fresh.insert((*hash).clone(), entry);
            }
        }
        for (_, hash, entry) in &table.submitted {
            fresh.insert(hash.clone(), entry.clone());
        }
        if let Some(since) = keep_since {
            table.submitted.retain(|(at, _, _)| *at >= since);
        }
        table.cache = fresh;
    }

    async fn sync_locked(&self, state: &mut SyncState) -> Result<usize, IntelError> {
        let authority = self.authority.as_ref().ok_or(IntelError::NotConfigured)?;
        let started = Instant::now();
        state.last_attempt = Some(started);

        let remote = match authority.fetch_hashes().await {
            Ok(remote) => remote,
            Err(e) => {
                // Entries may have aged out while the authority was down.
                self.rebuild(&state.known_good, None);
                return Err(e);
            }
        };
        let count = remote.len();

        let refreshed_at = Instant::now();
        state.known_good = remote
            .into_iter()
            .map(|entry| {
                (
                    entry.hash,
                    HashEntry {
                        file_name: entry.file_name,
                        detection_type: entry.detection_type,
                    },
                )
            })
            .collect();
        self.rebuild(&state.known_good, Some(started));

        state.last_success = Some(refreshed_at);
        info!(count, "hash set synced from authority");
        Ok(count)
    }
}

fn build_hash_cache(settings: &IntelSettings) -> Cache<String, HashEntry> {
    Cache::builder()
        .max_capacity(settings.max_hashes)
        .time_to_live(settings.cache_ttl)
        .build()
}

impl std::fmt::Debug for HashIntelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIntelStore")
            .field("has_authority", &self.authority.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
