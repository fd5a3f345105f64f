//! Message store traits used by the claimer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{CandidateQuery, Message, NewMessage, QueueStats};

/// Persistence backend for the dispatch queue.
///
/// Implementations must be thread-safe; every worker shares one store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Whether `ClaimTransaction::scan_candidates_for_update` can skip rows
    /// held by other transactions. Fixed when the store is constructed.
    fn supports_non_blocking_lock(&self) -> bool;

    /// Insert a new Pending message, assigning its id and timestamps.
    async fn insert(&self, message: NewMessage) -> Result<Message>;

    /// Unlocked, non-mutating candidate scan.
    async fn scan_candidates(&self, query: &CandidateQuery) -> Result<Vec<Message>>;

    /// Point read, ordered by priority descending then id ascending.
    async fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<Message>>;

    /// Advisory counts by status, provider, and zone.
    async fn stats(&self) -> Result<QueueStats>;

    /// Open a transactional scope for one claim.
    async fn begin(&self) -> Result<Box<dyn ClaimTransaction + '_>>;
}

/// One claim's transactional scope.
///
/// Dropping a transaction without calling `commit` rolls back every lock and
/// mutation it made.
#[async_trait]
pub trait ClaimTransaction: Send {
    /// Candidate scan that takes a non-blocking exclusive lock on each
    /// returned row. Rows locked elsewhere are left out, never waited on.
    async fn scan_candidates_for_update(&mut self, query: &CandidateQuery) -> Result<Vec<Message>>;

    /// Candidate scan without row locks.
    async fn scan_candidates(&mut self, query: &CandidateQuery) -> Result<Vec<Message>>;

    /// Pending → Sent for exactly these ids. Rows no longer Pending are left
    /// untouched. Returns the number of rows changed.
    async fn mark_sent(&mut self, ids: &[i64], sent_at: DateTime<Utc>) -> Result<u64>;

    /// Re-read rows as this transaction sees them.
    async fn fetch_by_ids(&mut self, ids: &[i64]) -> Result<Vec<Message>>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
