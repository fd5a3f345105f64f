//! SQLite message store.
//!
//! SQLite has no row-level locks, so this backend reports
//! `supports_non_blocking_lock() == false` and is only usable with
//! `LockingMode::Unlocked`. Writers are serialized on one connection and each
//! claim runs inside `BEGIN IMMEDIATE`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, Row};
use tokio::sync::{Mutex, MutexGuard};
use tzdispatch_core::error::{DispatchError, Result};
use tzdispatch_core::traits::{ClaimTransaction, MessageStore};
use tzdispatch_core::types::{
    CandidateQuery, Message, MessageStatus, NewMessage, OriginRef, Provider, QueueStats,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    origin_table TEXT,
    origin_id INTEGER,
    recipient TEXT NOT NULL,
    body TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    provider TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    sent_flag INTEGER NOT NULL DEFAULT 0,
    delivered_flag INTEGER NOT NULL DEFAULT 0,
    send_after TEXT,
    time_zone TEXT,
    sent_at TEXT,
    delivered_at TEXT,
    fetched_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_status_provider_send_after
    ON messages (status, provider, send_after, id);
CREATE INDEX IF NOT EXISTS idx_messages_provider_status_priority
    ON messages (provider, status, priority, id);
";

const COLUMNS: &str = "id, origin_table, origin_id, recipient, body, priority, provider, status, \
    sent_flag, delivered_flag, send_after, time_zone, sent_at, delivered_at, fetched_at, \
    created_at, updated_at";

fn store_err(e: rusqlite::Error) -> DispatchError {
    DispatchError::store(e.to_string())
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| conversion_err(idx, e))
        })
        .transpose()
}

fn get_required_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    get_ts(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(idx, "timestamp".into(), Type::Null))
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let origin_table: Option<String> = row.get(1)?;
    let origin_id: Option<i64> = row.get(2)?;
    let provider: Provider = row
        .get::<_, String>(6)?
        .parse()
        .map_err(|e| conversion_err(6, e))?;
    let status: MessageStatus = row
        .get::<_, String>(7)?
        .parse()
        .map_err(|e| conversion_err(7, e))?;

    Ok(Message {
        id: row.get(0)?,
        origin: origin_table.zip(origin_id).map(|(table, id)| OriginRef { table, id }),
        recipient: row.get(3)?,
        body: row.get(4)?,
        priority: row.get(5)?,
        provider,
        status,
        sent_flag: row.get(8)?,
        delivered_flag: row.get(9)?,
        send_after: get_ts(row, 10)?,
        time_zone: row.get(11)?,
        sent_at: get_ts(row, 12)?,
        delivered_at: get_ts(row, 13)?,
        fetched_at: get_ts(row, 14)?,
        created_at: get_required_ts(row, 15)?,
        updated_at: get_required_ts(row, 16)?,
    })
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn scan(conn: &Connection, query: &CandidateQuery) -> Result<Vec<Message>> {
    let mut params = vec![
        Value::Text(query.provider.as_str().to_string()),
        Value::Text(ts(query.now)),
    ];
    // Membership against the precomputed zone list keeps the predicate indexable.
    let zone_clause = if query.valid_zones.is_empty() {
        "time_zone IS NULL".to_string()
    } else {
        let clause = format!(
            "(time_zone IS NULL OR time_zone IN ({}))",
            placeholders(3, query.valid_zones.len())
        );
        params.extend(query.valid_zones.iter().cloned().map(Value::Text));
        clause
    };
    let limit_idx = params.len() + 1;
    params.push(Value::Integer(i64::try_from(query.limit).unwrap_or(i64::MAX)));

    let sql = format!(
        "SELECT {COLUMNS} FROM messages
         WHERE status = 'pending' AND provider = ?1
           AND (send_after IS NULL OR send_after <= ?2)
           AND {zone_clause}
         ORDER BY priority DESC, id ASC
         LIMIT ?{limit_idx}"
    );
    let mut stmt = conn.prepare(&sql).map_err(store_err)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), row_to_message)
        .map_err(store_err)?;
    let messages = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)?;
    tracing::debug!("sqlite scan for {} matched {} rows", query.provider, messages.len());
    Ok(messages)
}

fn fetch(conn: &Connection, ids: &[i64]) -> Result<Vec<Message>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {COLUMNS} FROM messages WHERE id IN ({}) ORDER BY priority DESC, id ASC",
        placeholders(1, ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(store_err)?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), row_to_message)
        .map_err(store_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
}

fn mark(conn: &Connection, ids: &[i64], sent_at: DateTime<Utc>) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE messages SET status = 'sent', sent_flag = 1, sent_at = ?1, updated_at = ?1
         WHERE status = 'pending' AND id IN ({})",
        placeholders(2, ids.len())
    );
    let mut params = vec![Value::Text(ts(sent_at))];
    params.extend(ids.iter().map(|id| Value::Integer(*id)));
    let changed = conn
        .execute(&sql, params_from_iter(params.iter()))
        .map_err(store_err)?;
    Ok(changed as u64)
}

pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Open (or create) a queue database at `path` and bootstrap the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        tracing::debug!("📦 SQLite queue opened: {}", path.display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn supports_non_blocking_lock(&self) -> bool {
        false
    }

    async fn insert(&self, message: NewMessage) -> Result<Message> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let (origin_table, origin_id) = match &message.origin {
            Some(o) => (Some(o.table.clone()), Some(o.id)),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO messages (origin_table, origin_id, recipient, body, priority, provider,
                status, send_after, time_zone, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, ?9)",
            rusqlite::params![
                origin_table,
                origin_id,
                message.recipient,
                message.body,
                message.priority,
                message.provider.as_str(),
                message.send_after.map(ts),
                message.time_zone,
                ts(now),
            ],
        )
        .map_err(store_err)?;
        let id = conn.last_insert_rowid();
        let mut inserted = fetch(&conn, &[id])?;
        inserted
            .pop()
            .ok_or_else(|| DispatchError::store(format!("inserted row {id} not found")))
    }

    async fn scan_candidates(&self, query: &CandidateQuery) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        scan(&conn, query)
    }

    async fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        fetch(&conn, ids)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock().await;
        let count = |status: &str| -> Result<u64> {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE status = ?1",
                [status],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(store_err)
        };
        let pending = count("pending")?;
        let sent = count("sent")?;

        let mut stmt = conn
            .prepare(
                "SELECT provider, COUNT(*) FROM messages WHERE status = 'pending'
                 GROUP BY provider ORDER BY provider",
            )
            .map_err(store_err)?;
        let mut by_provider = stmt
            .query_map([], |r| {
                let provider: Provider = r.get::<_, String>(0)?.parse().map_err(|e| conversion_err(0, e))?;
                Ok((provider, r.get::<_, i64>(1)? as u64))
            })
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        let mut stmt = conn
            .prepare(
                "SELECT time_zone, COUNT(*) FROM messages WHERE status = 'pending'
                 GROUP BY time_zone ORDER BY time_zone",
            )
            .map_err(store_err)?;
        let by_time_zone = stmt
            .query_map([], |r| Ok((r.get::<_, Option<String>>(0)?, r.get::<_, i64>(1)? as u64)))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        // enum order, not alphabetical
        by_provider.sort();
        Ok(QueueStats { pending, sent, by_provider, by_time_zone })
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn ClaimTransaction + 'a>> {
        let conn = self.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(store_err)?;
        Ok(Box::new(SqliteTransaction { conn, finished: false }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

#[async_trait]
impl ClaimTransaction for SqliteTransaction<'_> {
    async fn scan_candidates_for_update(&mut self, _query: &CandidateQuery) -> Result<Vec<Message>> {
        Err(DispatchError::store("SQLite does not support non-blocking row locks"))
    }

    async fn scan_candidates(&mut self, query: &CandidateQuery) -> Result<Vec<Message>> {
        scan(&self.conn, query)
    }

    async fn mark_sent(&mut self, ids: &[i64], sent_at: DateTime<Utc>) -> Result<u64> {
        mark(&self.conn, ids, sent_at)
    }

    async fn fetch_by_ids(&mut self, ids: &[i64]) -> Result<Vec<Message>> {
        fetch(&self.conn, ids)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.conn.execute_batch("COMMIT").map_err(store_err)?;
        this.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("⚠️ SQLite rollback failed: {e}");
            }
        }
    }
}
