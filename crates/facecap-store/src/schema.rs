//! Schema versioning for the video store.
//!
//! The version lives in SQLite's `user_version` header field; containers are
//! tables. Raising the version runs one idempotent step, "ensure every
//! required container exists", under an exclusive lock. Every open checks for
//! the containers and forces a version bump when one is missing.

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// Container holding every video artifact, keyed by artifact key.
pub const VIDEOS: &str = "videos";

const REQUIRED_CONTAINERS: &[(&str, &str)] = &[(
    VIDEOS,
    "CREATE TABLE IF NOT EXISTS videos (
        key       TEXT PRIMARY KEY NOT NULL,
        blob      BLOB NOT NULL,
        mime_type TEXT NOT NULL,
        size      INTEGER NOT NULL
    )",
)];

/// Busy wait for ordinary reads and writes once the schema is settled.
const OPERATION_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Version and container set observed when a connection was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSchema {
    pub version: u32,
    pub containers: BTreeSet<String>,
}

impl StoreSchema {
    pub fn has_container(&self, name: &str) -> bool {
        self.containers.contains(name)
    }

    fn is_complete(&self) -> bool {
        REQUIRED_CONTAINERS.iter().all(|(name, _)| self.has_container(name))
    }
}

/// Bring the store to at least `min_version` and report its schema.
///
/// The version never goes down: opening an older request against a newer
/// store keeps the newer version. A store missing a required container is
/// upgraded to a strictly higher version. Lock contention fails immediately
/// with `DatabaseBusy` instead of waiting.
pub(crate) fn open_schema(conn: &mut Connection, min_version: u32) -> rusqlite::Result<StoreSchema> {
    conn.busy_timeout(Duration::ZERO)?;

    let mut schema = read_schema(conn)?;
    let existing = schema.version;
    let mut target = min_version.max(existing);
    if target == existing && !schema.is_complete() {
        target = existing + 1;
    }
    if target > existing {
        upgrade(conn, existing, target)?;
        schema = read_schema(conn)?;
    }

    conn.busy_timeout(OPERATION_BUSY_TIMEOUT)?;
    Ok(schema)
}

fn upgrade(conn: &mut Connection, from: u32, to: u32) -> rusqlite::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

    // Another consumer may have upgraded between our read and the lock.
    let current = read_version(&tx)?;
    if current >= to {
        return tx.commit();
    }

    for (name, ddl) in REQUIRED_CONTAINERS {
        tx.execute_batch(ddl)?;
        tracing::debug!(container = name, "container ensured");
    }
    tx.pragma_update(None, "user_version", to)?;
    tx.commit()?;

    tracing::info!(from, to, "store schema upgraded");
    Ok(())
}

fn read_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn read_schema(conn: &Connection) -> rusqlite::Result<StoreSchema> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let containers = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;

    Ok(StoreSchema {
        version: read_version(conn)?,
        containers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_store_gets_videos_container() {
        let mut conn = Connection::open_in_memory().unwrap();
        let schema = open_schema(&mut conn, 1).unwrap();
        assert_eq!(schema.version, 1);
        assert!(schema.has_container(VIDEOS));
    }

    #[test]
    fn test_same_version_skips_upgrade() {
        let mut conn = Connection::open_in_memory().unwrap();
        open_schema(&mut conn, 1).unwrap();

        let schema = open_schema(&mut conn, 1).unwrap();
        assert_eq!(schema.version, 1);
        assert!(schema.has_container(VIDEOS));
    }

    #[test]
    fn test_missing_container_forces_higher_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 1u32).unwrap();

        let schema = open_schema(&mut conn, 1).unwrap();
        assert_eq!(schema.version, 2);
        assert!(schema.has_container(VIDEOS));
    }

    #[test]
    fn test_higher_version_repairs_missing_container() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE settings (k TEXT); PRAGMA user_version = 1;").unwrap();

        let schema = open_schema(&mut conn, 2).unwrap();
        assert_eq!(schema.version, 2);
        assert!(schema.has_container(VIDEOS));
        assert!(schema.has_container("settings"));
    }

    #[test]
    fn test_upgrade_is_idempotent_over_existing_container() {
        let mut conn = Connection::open_in_memory().unwrap();
        open_schema(&mut conn, 1).unwrap();
        conn.execute("INSERT INTO videos VALUES ('video_1', x'00', 'video/webm', 1)", []).unwrap();

        let schema = open_schema(&mut conn, 3).unwrap();
        assert_eq!(schema.version, 3);
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM videos", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_version_never_downgrades() {
        let mut conn = Connection::open_in_memory().unwrap();
        open_schema(&mut conn, 4).unwrap();
        assert_eq!(open_schema(&mut conn, 1).unwrap().version, 4);
    }
}
