//! Candidate selection predicate, decoupled from any store's query language.

use chrono::{DateTime, Utc};

use super::{MessageStatus, Provider};

/// Selects messages for one provider that are due at `now` and whose zone is
/// unrestricted or in `valid_zones`, bounded by `limit`.
///
/// Status and order are fixed, not per-query: only [`CandidateQuery::STATUS`]
/// rows match, and results are always in [`dispatch_order`](super::dispatch_order)
/// (priority descending, then id ascending).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub provider: Provider,
    pub now: DateTime<Utc>,
    /// Zones currently inside the send window, computed once per call.
    pub valid_zones: Vec<String>,
    pub limit: usize,
}

impl CandidateQuery {
    pub const STATUS: MessageStatus = MessageStatus::Pending;

    pub fn new(provider: Provider, now: DateTime<Utc>, valid_zones: Vec<String>, limit: usize) -> Self {
        Self { provider, now, valid_zones, limit }
    }
}
