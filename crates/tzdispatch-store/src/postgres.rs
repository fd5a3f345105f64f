//! PostgreSQL message store via sqlx.
//!
//! The only backend with real non-blocking row locks: claim scans run
//! `FOR UPDATE SKIP LOCKED`, so concurrent claimers partition the backlog
//! instead of queueing behind each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tzdispatch_core::error::{DispatchError, Result};
use tzdispatch_core::traits::{ClaimTransaction, MessageStore};
use tzdispatch_core::types::{
    CandidateQuery, Message, MessageStatus, NewMessage, OriginRef, Provider, QueueStats,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        id BIGSERIAL PRIMARY KEY,
        origin_table TEXT,
        origin_id BIGINT,
        recipient TEXT NOT NULL,
        body TEXT NOT NULL,
        priority SMALLINT NOT NULL DEFAULT 0,
        provider TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        sent_flag BOOLEAN NOT NULL DEFAULT FALSE,
        delivered_flag BOOLEAN NOT NULL DEFAULT FALSE,
        send_after TIMESTAMPTZ,
        time_zone TEXT,
        sent_at TIMESTAMPTZ,
        delivered_at TIMESTAMPTZ,
        fetched_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_status_provider_send_after
        ON messages (status, provider, send_after, id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_provider_status_priority
        ON messages (provider, status, priority, id)",
];

const COLUMNS: &str = "id, origin_table, origin_id, recipient, body, priority, provider, status, \
    sent_flag, delivered_flag, send_after, time_zone, sent_at, delivered_at, fetched_at, \
    created_at, updated_at";

const CANDIDATES: &str = "FROM messages
    WHERE status = 'pending' AND provider = $1
      AND (send_after IS NULL OR send_after <= $2)
      AND (time_zone IS NULL OR time_zone = ANY($3))
    ORDER BY priority DESC, id ASC
    LIMIT $4";

fn store_err(e: sqlx::Error) -> DispatchError {
    DispatchError::store(e.to_string())
}

fn decode_err(column: &str, e: DispatchError) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    }
}

fn row_to_message(row: &PgRow) -> std::result::Result<Message, sqlx::Error> {
    let origin_table: Option<String> = row.try_get("origin_table")?;
    let origin_id: Option<i64> = row.try_get("origin_id")?;
    let priority: i16 = row.try_get("priority")?;
    let provider: Provider = row
        .try_get::<String, _>("provider")?
        .parse()
        .map_err(|e| decode_err("provider", e))?;
    let status: MessageStatus = row
        .try_get::<String, _>("status")?
        .parse()
        .map_err(|e| decode_err("status", e))?;

    Ok(Message {
        id: row.try_get("id")?,
        origin: origin_table.zip(origin_id).map(|(table, id)| OriginRef { table, id }),
        recipient: row.try_get("recipient")?,
        body: row.try_get("body")?,
        priority: u8::try_from(priority).unwrap_or(u8::MAX),
        provider,
        status,
        sent_flag: row.try_get("sent_flag")?,
        delivered_flag: row.try_get("delivered_flag")?,
        send_after: row.try_get("send_after")?,
        time_zone: row.try_get("time_zone")?,
        sent_at: row.try_get("sent_at")?,
        delivered_at: row.try_get("delivered_at")?,
        fetched_at: row.try_get("fetched_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn decode_rows(rows: &[PgRow]) -> Result<Vec<Message>> {
    rows.iter()
        .map(row_to_message)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(store_err)
}

fn candidate_sql(for_update: bool) -> String {
    if for_update {
        format!("SELECT {COLUMNS} {CANDIDATES} FOR UPDATE SKIP LOCKED")
    } else {
        format!("SELECT {COLUMNS} {CANDIDATES}")
    }
}

fn fetch_sql() -> String {
    format!("SELECT {COLUMNS} FROM messages WHERE id = ANY($1) ORDER BY priority DESC, id ASC")
}

fn limit(query: &CandidateQuery) -> i64 {
    i64::try_from(query.limit).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(store_err)?;
        tracing::info!("🐘 Connected to PostgreSQL (pool size {max_connections})");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent table and index bootstrap.
    pub async fn init_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(store_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    fn name(&self) -> &str {
        "postgres"
    }

    fn supports_non_blocking_lock(&self) -> bool {
        true
    }

    async fn insert(&self, message: NewMessage) -> Result<Message> {
        let sql = format!(
            "INSERT INTO messages (origin_table, origin_id, recipient, body, priority, provider,
                status, send_after, time_zone, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, NOW(), NOW())
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(message.origin.as_ref().map(|o| o.table.clone()))
            .bind(message.origin.as_ref().map(|o| o.id))
            .bind(&message.recipient)
            .bind(&message.body)
            .bind(i16::from(message.priority))
            .bind(message.provider.as_str())
            .bind(message.send_after)
            .bind(&message.time_zone)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        row_to_message(&row).map_err(store_err)
    }

    async fn scan_candidates(&self, query: &CandidateQuery) -> Result<Vec<Message>> {
        let rows = sqlx::query(&candidate_sql(false))
            .bind(query.provider.as_str())
            .bind(query.now)
            .bind(&query.valid_zones)
            .bind(limit(query))
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        decode_rows(&rows)
    }

    async fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<Message>> {
        let rows = sqlx::query(&fetch_sql())
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        decode_rows(&rows)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let (pending, sent): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE status = 'pending'),
                    COUNT(*) FILTER (WHERE status = 'sent')
             FROM messages",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        let provider_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT provider, COUNT(*) FROM messages WHERE status = 'pending' GROUP BY provider",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        let mut by_provider = provider_rows
            .into_iter()
            .map(|(p, n)| Ok((p.parse::<Provider>()?, n as u64)))
            .collect::<Result<Vec<_>>>()?;
        by_provider.sort();

        let by_time_zone: Vec<(Option<String>, i64)> = sqlx::query_as(
            "SELECT time_zone, COUNT(*) FROM messages WHERE status = 'pending'
             GROUP BY time_zone ORDER BY time_zone NULLS FIRST",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(QueueStats {
            pending: pending as u64,
            sent: sent as u64,
            by_provider,
            by_time_zone: by_time_zone.into_iter().map(|(z, n)| (z, n as u64)).collect(),
        })
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn ClaimTransaction + 'a>> {
        let tx = self.pool.begin().await.map_err(store_err)?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// Rolled back by sqlx when dropped uncommitted.
struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn scan(&mut self, query: &CandidateQuery, for_update: bool) -> Result<Vec<Message>> {
        let rows = sqlx::query(&candidate_sql(for_update))
            .bind(query.provider.as_str())
            .bind(query.now)
            .bind(&query.valid_zones)
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_err)?;
        decode_rows(&rows)
    }
}

#[async_trait]
impl ClaimTransaction for PgTransaction {
    async fn scan_candidates_for_update(&mut self, query: &CandidateQuery) -> Result<Vec<Message>> {
        self.scan(query, true).await
    }

    async fn scan_candidates(&mut self, query: &CandidateQuery) -> Result<Vec<Message>> {
        self.scan(query, false).await
    }

    async fn mark_sent(&mut self, ids: &[i64], sent_at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages
             SET status = 'sent', sent_flag = TRUE, sent_at = $1, updated_at = $1
             WHERE status = 'pending' AND id = ANY($2)",
        )
        .bind(sent_at)
        .bind(ids)
        .execute(&mut *self.tx)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn fetch_by_ids(&mut self, ids: &[i64]) -> Result<Vec<Message>> {
        let rows = sqlx::query(&fetch_sql())
            .bind(ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_err)?;
        decode_rows(&rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(store_err)
    }
}
