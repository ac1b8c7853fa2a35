//! Persistent-volume inspection.
//!
//! Walks a server volume with an explicit stack of `(directory, relative
//! path)` pairs, applying skip rules before descending. Every kept file is
//! hashed and checked three independent ways: known hash, suspicious
//! name/extension, and suspicious content. Unreadable files are skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ScanConfig, ThresholdConfig};
use crate::detect::signatures::{
    self, find_matches, BOT_PACKAGES, PACKAGE_SENTINELS, SERVER_JAR, SKIP_EXTENSIONS,
    SKIP_FILENAMES, SKIP_PREFIXES, STARTUP_SCRIPTS, SUSPICIOUS_CONTENT_WORDS,
    SUSPICIOUS_EXTENSIONS, SUSPICIOUS_NAMES,
};
use crate::detect::{
    CacheEvidence, ContentEvidence, Detection, FileEvidence, HashMatch, NpmEvidence,
    TYPE_BOT_DEPENDENCY, TYPE_KNOWN_MALICIOUS_FILE, TYPE_PACKAGE_CACHE, TYPE_SMALL_JAR,
    TYPE_SUSPICIOUS_CONTENT, TYPE_SUSPICIOUS_FILE, TYPE_SUSPICIOUS_STARTUP,
};
use crate::intel::HashIntelStore;

/// Buffer size for streaming file reads (64 KiB).
const BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct VolumeLimits {
    pub max_hash_bytes: u64,
    pub max_content_bytes: u64,
    pub max_jar_bytes: u64,
}

impl VolumeLimits {
    pub fn from_config(scan: &ScanConfig, thresholds: &ThresholdConfig) -> Self {
        Self {
            max_hash_bytes: scan.max_hash_bytes,
            max_content_bytes: scan.max_content_bytes,
            max_jar_bytes: thresholds.max_jar_bytes,
        }
    }
}

impl Default for VolumeLimits {
    fn default() -> Self {
        Self::from_config(&ScanConfig::default(), &ThresholdConfig::default())
    }
}

pub struct VolumeInspector {
    intel: Arc<HashIntelStore>,
    limits: VolumeLimits,
}

impl VolumeInspector {
    pub fn new(intel: Arc<HashIntelStore>, limits: VolumeLimits) -> Self {
        Self { intel, limits }
    }

    /// Inspect the volume at `root`, recording findings into `detection`.
    ///
    /// `server_id` is attached to every hash submission.
    pub async fn inspect(
        &self,
        root: &Path,
        server_id: &str,
        detection: &mut Detection,
        cancel: &CancellationToken,
    ) {
        self.check_package_sentinels(root, detection).await;
        self.check_startup_scripts(root, detection).await;
        let jar_looked_up = self.check_server_jar(root, server_id, detection).await;

        let mut stack: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];
        while let Some((dir, rel)) = stack.pop() {
            if cancel.is_cancelled() {
                debug!(root = %root.display(), "volume walk cancelled");
                return;
            }

            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "cannot read directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(dir = %dir.display(), error = %e, "directory listing aborted");
                        break;
                    }
                };
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                // Links may point outside the volume.
                if file_type.is_symlink() {
                    continue;
                }

                let name = entry.file_name().to_string_lossy().into_owned();
                let rel_path = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", rel, name)
                };

                if file_type.is_dir() {
                    if !skip_dir(&rel_path) {
                        stack.push((entry.path(), rel_path));
                    }
                } else if file_type.is_file() && !skip_file(&rel_path, &name) {
                    let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                    let root_special = rel.is_empty() && is_fixed_path(&name);
                    let hash_looked_up = jar_looked_up && rel.is_empty() && name == SERVER_JAR;
                    let file = WalkedFile {
                        path: entry.path(),
                        rel_path,
                        name,
                        size,
                        root_special,
                        hash_looked_up,
                    };
                    self.inspect_file(&file, server_id, detection).await;
                }
            }
        }
    }

    async fn inspect_file(
        &self,
        file: &WalkedFile,
        server_id: &str,
        detection: &mut Detection,
    ) {
        let path = file.path.as_path();
        let rel_path = file.rel_path.as_str();
        let name = file.name.as_str();
        let size = file.size;
        let hash = if size <= self.limits.max_hash_bytes {
            match sha256_file(path).await {
                Ok(h) => Some(h),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "cannot hash file, skipping");
                    return;
                }
            }
        } else {
            None
        };

        if let Some(hash) = hash.as_ref().filter(|_| !file.hash_looked_up) {
            if let Some(entry) = self.intel.lookup(hash).await {
                detection.hash_matches.push(HashMatch {
                    path: rel_path.to_string(),
                    hash: hash.clone(),
                    file_name: entry.file_name,
                    detection_type: entry.detection_type,
                });
                detection.add_type(TYPE_KNOWN_MALICIOUS_FILE);
            }
        }

        // Startup scripts and the main jar have their own checks.
        if file.root_special {
            return;
        }

        if let Some(reason) = suspicious_name_reason(name) {
            detection.files.push(FileEvidence {
                path: rel_path.to_string(),
                reason: reason.clone(),
                size,
                hash: hash.clone(),
            });
            detection.add_type(TYPE_SUSPICIOUS_FILE);
            if let Some(hash) = &hash {
                self.intel
                    .submit(
                        hash,
                        name,
                        TYPE_SUSPICIOUS_FILE,
                        server_id,
                        json!({ "path": rel_path, "size": size, "reason": reason }),
                    )
                    .await;
            }
        }

        if size > self.limits.max_content_bytes {
            return;
        }
        let Ok(content) = tokio::fs::read_to_string(path).await else {
            return;
        };

        let mut matches: Vec<String> = find_matches(&content, SUSPICIOUS_CONTENT_WORDS)
            .into_iter()
            .map(String::from)
            .collect();
        if let Some(endpoint) = signatures::ipv4_port_regex().find(&content) {
            matches.push(endpoint.as_str().to_string());
        }
        if !matches.is_empty() {
            detection.suspicious_content.push(ContentEvidence {
                path: rel_path.to_string(),
                reason: "Suspicious content".to_string(),
                matches: matches.clone(),
                hash: hash.clone(),
            });
            detection.add_type(TYPE_SUSPICIOUS_CONTENT);
            if let Some(hash) = &hash {
                self.intel
                    .submit(
                        hash,
                        name,
                        TYPE_SUSPICIOUS_CONTENT,
                        server_id,
                        json!({ "path": rel_path, "size": size, "matches": matches }),
                    )
                    .await;
            }
        }

        if name == "package.json" {
            check_manifest(rel_path, &content, detection);
        }
    }

    async fn check_package_sentinels(&self, root: &Path, detection: &mut Detection) {
        let mut found = false;
        for (rel, reason) in PACKAGE_SENTINELS {
            if tokio::fs::symlink_metadata(root.join(rel)).await.is_ok() {
                detection.cache.push(CacheEvidence {
                    path: (*rel).to_string(),
                    reason: (*reason).to_string(),
                });
                found = true;
            }
        }
        if found {
            detection.add_type(TYPE_PACKAGE_CACHE);
        }
    }

    async fn check_startup_scripts(&self, root: &Path, detection: &mut Detection) {
        for script in STARTUP_SCRIPTS {
            let path = root.join(script);
            let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
                continue;
            };
            if !meta.is_file() || meta.len() > self.limits.max_content_bytes {
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };

            let mut matches = find_matches(&content, SUSPICIOUS_CONTENT_WORDS);
            for hit in find_matches(&content, signatures::PROCESS_DENYLIST) {
                if !matches.contains(&hit) {
                    matches.push(hit);
                }
            }
            if !matches.is_empty() {
                detection.suspicious_content.push(ContentEvidence {
                    path: (*script).to_string(),
                    reason: "Suspicious startup script".to_string(),
                    matches: matches.into_iter().map(String::from).collect(),
                    hash: None,
                });
                detection.add_type(TYPE_SUSPICIOUS_STARTUP);
            }
        }
    }

    /// Returns whether the jar's hash was already looked up.
    async fn check_server_jar(
        &self,
        root: &Path,
        server_id: &str,
        detection: &mut Detection,
    ) -> bool {
        let path = root.join(SERVER_JAR);
        let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
            return false;
        };
        if !meta.is_file() || meta.len() >= self.limits.max_jar_bytes {
            return false;
        }

        let size = meta.len();
        let hash = match sha256_file(&path).await {
            Ok(h) => Some(h),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "cannot hash server jar");
                None
            }
        };

        // Matched before our own submission replaces the stored entry.
        if let Some(hash) = &hash {
            if let Some(entry) = self.intel.lookup(hash).await {
                detection.hash_matches.push(HashMatch {
                    path: SERVER_JAR.to_string(),
                    hash: hash.clone(),
                    file_name: entry.file_name,
                    detection_type: entry.detection_type,
                });
                detection.add_type(TYPE_KNOWN_MALICIOUS_FILE);
            }
        }

        detection.files.push(FileEvidence {
            path: SERVER_JAR.to_string(),
            reason: "Suspicious small server.jar".to_string(),
            size,
            hash: hash.clone(),
        });
        detection.add_type(TYPE_SMALL_JAR);

        let Some(hash) = hash else {
            return false;
        };
        self.intel
            .submit(
                &hash,
                SERVER_JAR,
                TYPE_SMALL_JAR,
                server_id,
                json!({ "size": size, "threshold": self.limits.max_jar_bytes }),
            )
            .await;
        true
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct WalkedFile {
    path: PathBuf,
    rel_path: String,
    name: String,
    size: u64,
    /// A root-level startup script or main jar.
    root_special: bool,
    /// Already matched against the hash store by the jar check.
    hash_looked_up: bool,
}

fn skip_dir(rel_path: &str) -> bool {
    let with_slash = format!("{}/", rel_path);
    SKIP_PREFIXES.iter().any(|p| with_slash.starts_with(p))
}

fn skip_file(rel_path: &str, name: &str) -> bool {
    if SKIP_PREFIXES.iter().any(|p| rel_path.starts_with(p)) {
        return true;
    }
    if SKIP_FILENAMES.contains(&name) {
        return true;
    }
    match extension(name) {
        Some(ext) => SKIP_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

fn is_fixed_path(name: &str) -> bool {
    name == SERVER_JAR || STARTUP_SCRIPTS.contains(&name)
}

fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn suspicious_name_reason(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    if let Some(hit) = SUSPICIOUS_NAMES.iter().find(|n| lower.contains(*n)) {
        return Some(format!("Suspicious filename: {}", hit));
    }
    let ext = extension(name)?;
    if SUSPICIOUS_EXTENSIONS.contains(&ext.as_str()) {
        return Some(format!("Suspicious extension: .{}", ext));
    }
    None
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, serde_json::Value>,
}

fn check_manifest(rel_path: &str, content: &str, detection: &mut Detection) {
    let Ok(manifest) = serde_json::from_str::<Manifest>(content) else {
        debug!(path = rel_path, "unparsable package manifest");
        return;
    };

    let mut found = false;
    for package in manifest.dependencies.keys().chain(manifest.dev_dependencies.keys()) {
        if BOT_PACKAGES.contains(&package.as_str()) {
            detection.npm.push(NpmEvidence {
                path: rel_path.to_string(),
                package: package.clone(),
                reason: "Messaging automation library".to_string(),
            });
            found = true;
        }
    }
    if found {
        detection.add_type(TYPE_BOT_DEPENDENCY);
    }
}

/// Compute SHA-256 of a file, streaming to avoid loading it all into memory.
///
/// Returns lowercase hex-encoded digest.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Total size in bytes of every regular file under `root`, links excluded.
pub async fn directory_size(root: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total = total.saturating_add(entry.metadata().await.map(|m| m.len()).unwrap_or(0));
            }
        }
    }
    total
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
