//! SQLite persistence for detections.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::detect::Detection;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("opening detection database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Save one detection. Re-saving the same id is a no-op.
pub fn save_detection(pool: &Pool, detection: &Detection) -> Result<()> {
    let conn = pool.get()?;
    let types_json = serde_json::to_string(&detection.types)?;
    let detection_json = serde_json::to_string(detection)?;

    conn.execute(
        "INSERT OR IGNORE INTO detections
            (id, container_id, volume_id, types_json, detection_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            detection.id.to_string(),
            detection.container_id,
            detection.volume_id,
            types_json,
            detection_json,
            detection
                .created_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        ],
    )?;

    Ok(())
}

/// The newest `limit` detections, returned oldest first.
pub fn load_recent(pool: &Pool, limit: usize) -> Result<Vec<Detection>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT detection_json FROM detections
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

    let mut detections = Vec::new();
    for row in rows {
        let json = row?;
        match serde_json::from_str::<Detection>(&json) {
            Ok(d) => detections.push(d),
            Err(e) => tracing::warn!(error = %e, "skipping unreadable stored detection"),
        }
    }
    detections.reverse();
    Ok(detections)
}

/// Delete everything but the newest `keep` rows. Returns rows removed.
pub fn prune(pool: &Pool, keep: usize) -> Result<usize> {
    let conn = pool.get()?;
    let removed = conn.execute(
        "DELETE FROM detections WHERE rowid NOT IN (
            SELECT rowid FROM detections ORDER BY created_at DESC, rowid DESC LIMIT ?1
         )",
        params![keep as i64],
    )?;
    Ok(removed)
}
