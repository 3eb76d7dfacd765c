//! Database schema migrations for SQLite.
//!
//! Each migration transforms the schema from version N to N+1 inside one
//! transaction.

use rusqlite::Connection;
use tracing::{debug, info};

use chatmesh_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        info!(from = current, to = CURRENT_VERSION, "migrating store schema");
        let tx = conn.transaction()?;
        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }
        tx.commit()?;
    } else {
        debug!(version = current, "store schema up to date");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: entities, file payloads, peers.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Replicated entities, one row per (kind, id)
        CREATE TABLE entities (
            kind TEXT NOT NULL,               -- EntityKind wire name
            entity_id BLOB NOT NULL,          -- 16 bytes
            sort_ts INTEGER NOT NULL,         -- conflict timestamp, i64::MIN when absent
            content_hash BLOB NOT NULL,       -- 32 bytes, Blake3 of canonical encoding
            body BLOB NOT NULL,               -- CBOR-encoded Entity
            updated_at INTEGER NOT NULL,      -- local time of last write
            PRIMARY KEY (kind, entity_id)
        );

        -- Binary payloads of File entities
        CREATE TABLE file_payloads (
            file_id BLOB PRIMARY KEY,
            payload BLOB NOT NULL,
            stored_at INTEGER NOT NULL
        );

        -- Known peers
        CREATE TABLE peers (
            peer_id BLOB PRIMARY KEY,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            state TEXT NOT NULL,
            last_heartbeat INTEGER NOT NULL,
            name TEXT,
            UNIQUE (host, port)
        );

        CREATE INDEX idx_entities_sync_order ON entities(kind, sort_ts, entity_id);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["entities", "file_payloads", "peers", "schema_migrations"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
