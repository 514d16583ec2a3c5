//! Persistent chat history.
//!
//! One SQLite file per node. The natural key is `(origin_id, seqno)` and
//! inserts are idempotent: a duplicate is reported, never an error and
//! never a second row. A schema-version table drives additive migrations so
//! old databases upgrade in place.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use qmesh_codec::NodeId;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// Additive migrations, applied in order. Index + 1 is the schema version.
const MIGRATIONS: &[&str] = &[
    // v1: chat rows with the natural key and the display-order indexes
    "CREATE TABLE chat_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_id BLOB NOT NULL,
        seqno INTEGER NOT NULL,
        channel TEXT NOT NULL,
        nick TEXT NOT NULL,
        text TEXT NOT NULL,
        created_ts INTEGER NOT NULL,
        local_insert_ts INTEGER NOT NULL,
        UNIQUE(origin_id, seqno)
    );
    CREATE INDEX idx_chat_channel_created ON chat_messages(channel, created_ts);
    CREATE INDEX idx_chat_channel_origin_seqno ON chat_messages(channel, origin_id, seqno);",
];

/// One persisted chat row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Originating node
    pub origin: NodeId,
    /// Per-origin sequence number
    pub seqno: u32,
    /// Channel or DM key
    pub channel: String,
    /// Sender nickname
    pub nick: String,
    /// Message text
    pub text: String,
    /// Sender-stamped UTC unix seconds
    pub created_ts: u64,
    /// Unix seconds this node persisted the row
    pub local_insert_ts: u64,
}

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was newly persisted
    Inserted,
    /// A row with this `(origin, seqno)` already existed; nothing changed
    Duplicate,
}

/// SQLite-backed chat store.
///
/// The connection lives behind one mutex: writes are serialized, readers
/// hold the lock only for the duration of their query. Writes are durable
/// before `insert` returns.
pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    /// Open or create the database at `path` and bring the schema current.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> StoreResult<ChatStore> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(busy_timeout)?;
        apply_migrations(&conn)?;
        Ok(ChatStore {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store for tests.
    pub fn open_in_memory() -> StoreResult<ChatStore> {
        let conn = Connection::open_in_memory()?;
        apply_migrations(&conn)?;
        Ok(ChatStore {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a row, ignoring duplicates of the natural key.
    pub fn insert(&self, row: &StoredMessage) -> StoreResult<InsertOutcome> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO chat_messages
                     (origin_id, seqno, channel, nick, text, created_ts, local_insert_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.origin.as_bytes().as_slice(),
                    row.seqno,
                    row.channel,
                    row.nick,
                    row.text,
                    row.created_ts,
                    row.local_insert_ts,
                ],
            )
            .map_err(StoreError::from_sqlite)?;
        if changed == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::Duplicate)
        }
    }

    /// Whether a row with this natural key exists.
    pub fn contains(&self, origin: &NodeId, seqno: u32) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM chat_messages WHERE origin_id = ?1 AND seqno = ?2 LIMIT 1",
                params![origin.as_bytes().as_slice(), seqno],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Rows for one origin on one channel with `start <= seqno <= end`,
    /// ordered by seqno.
    pub fn get_range(
        &self,
        channel: &str,
        origin: &NodeId,
        start: u32,
        end: u32,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT origin_id, seqno, channel, nick, text, created_ts, local_insert_ts
             FROM chat_messages
             WHERE channel = ?1 AND origin_id = ?2 AND seqno BETWEEN ?3 AND ?4
             ORDER BY seqno ASC",
        )?;
        let rows = stmt
            .query_map(
                params![channel, origin.as_bytes().as_slice(), start, end],
                row_to_message,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Highest stored seqno for one origin on one channel.
    pub fn max_seqno(&self, channel: &str, origin: &NodeId) -> StoreResult<Option<u32>> {
        let conn = self.conn.lock().unwrap();
        let max: Option<u32> = conn.query_row(
            "SELECT MAX(seqno) FROM chat_messages WHERE channel = ?1 AND origin_id = ?2",
            params![channel, origin.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Highest stored seqno per `(channel, origin)` pair, for seeding the
    /// gap detector at startup.
    pub fn max_seqnos(&self) -> StoreResult<Vec<(String, NodeId, u32)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT channel, origin_id, MAX(seqno)
             FROM chat_messages GROUP BY channel, origin_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let channel: String = row.get(0)?;
                let origin = node_id_column(row, 1)?;
                let seqno: u32 = row.get(2)?;
                Ok((channel, origin, seqno))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The newest `limit` rows on a channel, reordered oldest to newest for
    /// display.
    pub fn get_recent(&self, channel: &str, limit: usize) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT origin_id, seqno, channel, nick, text, created_ts, local_insert_ts
             FROM chat_messages
             WHERE channel = ?1
             ORDER BY created_ts DESC, origin_id DESC, seqno DESC
             LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![channel, limit as i64], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Channel and DM keys ordered by most recent activity.
    pub fn list_channels(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT channel, MAX(created_ts) AS last_ts
             FROM chat_messages GROUP BY channel ORDER BY last_ts DESC",
        )?;
        let channels = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(channels)
    }

    /// Every row on a channel in display order: `created_ts` ascending with
    /// `(origin, seqno)` as the deterministic tie-break.
    pub fn export(&self, channel: &str) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT origin_id, seqno, channel, nick, text, created_ts, local_insert_ts
             FROM chat_messages
             WHERE channel = ?1
             ORDER BY created_ts ASC, origin_id ASC, seqno ASC",
        )?;
        let rows = stmt
            .query_map(params![channel], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete rows older than `cutoff_ts`. Returns the rows removed.
    pub fn prune_older_than(&self, cutoff_ts: u64) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM chat_messages WHERE created_ts < ?1",
                params![cutoff_ts],
            )
            .map_err(StoreError::from_sqlite)?;
        if deleted > 0 {
            info!(deleted, cutoff_ts, "pruned aged chat rows");
        }
        Ok(deleted)
    }

    /// Keep only the newest `keep` rows per channel. Returns rows removed.
    pub fn prune_keep_last_n(&self, keep: usize) -> StoreResult<usize> {
        let channels = self.list_channels()?;
        let conn = self.conn.lock().unwrap();
        let mut deleted = 0usize;
        for channel in channels {
            deleted += conn
                .execute(
                    "DELETE FROM chat_messages
                     WHERE channel = ?1 AND id NOT IN (
                         SELECT id FROM chat_messages WHERE channel = ?1
                         ORDER BY created_ts DESC, id DESC LIMIT ?2
                     )",
                    params![channel, keep as i64],
                )
                .map_err(StoreError::from_sqlite)?;
        }
        Ok(deleted)
    }

    /// Current schema version.
    pub fn schema_version(&self) -> StoreResult<u32> {
        let conn = self.conn.lock().unwrap();
        Ok(read_schema_version(&conn)?)
    }
}

fn apply_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let mut version = read_schema_version(conn)?;
    if version as usize > MIGRATIONS.len() {
        return Err(StoreError::InvalidRow(format!(
            "database schema version {} is newer than this build supports",
            version
        )));
    }
    while (version as usize) < MIGRATIONS.len() {
        conn.execute_batch(MIGRATIONS[version as usize])?;
        version += 1;
        conn.execute("DELETE FROM schema_version", [])?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![version],
        )?;
        info!(version, "applied schema migration");
    }
    Ok(())
}

fn read_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn node_id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NodeId> {
    let blob: Vec<u8> = row.get(idx)?;
    NodeId::from_slice(&blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, Box::new(e))
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        origin: node_id_column(row, 0)?,
        seqno: row.get(1)?,
        channel: row.get(2)?,
        nick: row.get(3)?,
        text: row.get(4)?,
        created_ts: row.get(5)?,
        local_insert_ts: row.get(6)?,
    })
}
