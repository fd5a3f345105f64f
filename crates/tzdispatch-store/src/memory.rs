//! In-process message store.
//!
//! Keeps committed rows in a `BTreeMap` and tracks which transaction owns
//! each row lock. Transactions buffer their writes and apply them on commit,
//! so a dropped transaction leaves no trace.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tzdispatch_core::error::{DispatchError, Result};
use tzdispatch_core::traits::{ClaimTransaction, MessageStore};
use tzdispatch_core::types::{
    dispatch_order, CandidateQuery, Message, MessageStatus, NewMessage, QueueStats,
};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    next_tx: u64,
    rows: BTreeMap<i64, Message>,
    /// row id → owning transaction id
    locks: HashMap<i64, u64>,
}

pub struct MemoryMessageStore {
    state: Mutex<MemoryState>,
    row_locks: bool,
}

impl MemoryMessageStore {
    /// Store with non-blocking row locks.
    pub fn with_row_locks() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            row_locks: true,
        }
    }

    /// Store that, like a backend without `SKIP LOCKED`, cannot lock rows.
    pub fn without_row_locks() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            row_locks: false,
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| DispatchError::store(format!("memory store poisoned: {e}")))
    }

    /// Number of rows currently locked by open transactions.
    pub fn locked_rows(&self) -> usize {
        self.lock_state().map(|s| s.locks.len()).unwrap_or(0)
    }

    /// Committed copy of a row.
    pub fn get(&self, id: i64) -> Option<Message> {
        self.lock_state().ok().and_then(|s| s.rows.get(&id).cloned())
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::with_row_locks()
    }
}

fn select(rows: impl Iterator<Item = Message>, query: &CandidateQuery) -> Vec<Message> {
    let mut matched: Vec<Message> = rows
        .filter(|m| m.is_eligible(query.provider, query.now, &query.valid_zones))
        .collect();
    matched.sort_by(dispatch_order);
    matched.truncate(query.limit);
    matched
}

fn select_by_ids(rows: impl Iterator<Item = Message>, ids: &[i64]) -> Vec<Message> {
    let mut found: Vec<Message> = rows.filter(|m| ids.contains(&m.id)).collect();
    found.sort_by(dispatch_order);
    found
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports_non_blocking_lock(&self) -> bool {
        self.row_locks
    }

    async fn insert(&self, message: NewMessage) -> Result<Message> {
        let mut state = self.lock_state()?;
        state.next_id += 1;
        let msg = message.into_message(state.next_id, Utc::now());
        state.rows.insert(msg.id, msg.clone());
        Ok(msg)
    }

    async fn scan_candidates(&self, query: &CandidateQuery) -> Result<Vec<Message>> {
        let state = self.lock_state()?;
        Ok(select(state.rows.values().cloned(), query))
    }

    async fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<Message>> {
        let state = self.lock_state()?;
        Ok(select_by_ids(state.rows.values().cloned(), ids))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.lock_state()?;
        let mut stats = QueueStats::default();
        let mut by_provider = BTreeMap::new();
        let mut by_zone = BTreeMap::new();
        for msg in state.rows.values() {
            match msg.status {
                MessageStatus::Sent => stats.sent += 1,
                MessageStatus::Pending => {
                    stats.pending += 1;
                    *by_provider.entry(msg.provider).or_insert(0u64) += 1;
                    *by_zone.entry(msg.time_zone.clone()).or_insert(0u64) += 1;
                }
            }
        }
        stats.by_provider = by_provider.into_iter().collect();
        stats.by_time_zone = by_zone.into_iter().collect();
        Ok(stats)
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn ClaimTransaction + 'a>> {
        let tx_id = {
            let mut state = self.lock_state()?;
            state.next_tx += 1;
            state.next_tx
        };
        Ok(Box::new(MemoryTransaction {
            store: self,
            tx_id,
            pending_sent: BTreeMap::new(),
            finished: false,
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryMessageStore,
    tx_id: u64,
    /// Buffered Pending → Sent writes.
    pending_sent: BTreeMap<i64, DateTime<Utc>>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    /// Committed rows with this transaction's own writes applied.
    fn view(&self, state: &MemoryState) -> Vec<Message> {
        state
            .rows
            .values()
            .map(|row| {
                let mut row = row.clone();
                if let Some(at) = self.pending_sent.get(&row.id) {
                    row.mark_sent(*at);
                }
                row
            })
            .collect()
    }

    fn release_locks(&self, state: &mut MemoryState) {
        state.locks.retain(|_, owner| *owner != self.tx_id);
    }
}

#[async_trait]
impl ClaimTransaction for MemoryTransaction<'_> {
    async fn scan_candidates_for_update(&mut self, query: &CandidateQuery) -> Result<Vec<Message>> {
        if !self.store.row_locks {
            return Err(DispatchError::store(
                "non-blocking row locks are not available on this store",
            ));
        }
        let mut state = self.store.lock_state()?;
        let tx_id = self.tx_id;
        let visible = self
            .view(&state)
            .into_iter()
            .filter(|m| state.locks.get(&m.id).is_none_or(|owner| *owner == tx_id));
        let selected = select(visible, query);
        for msg in &selected {
            state.locks.insert(msg.id, tx_id);
        }
        tracing::debug!("🔒 tx {tx_id} locked {} rows", selected.len());
        Ok(selected)
    }

    async fn scan_candidates(&mut self, query: &CandidateQuery) -> Result<Vec<Message>> {
        let state = self.store.lock_state()?;
        Ok(select(self.view(&state).into_iter(), query))
    }

    async fn mark_sent(&mut self, ids: &[i64], sent_at: DateTime<Utc>) -> Result<u64> {
        let state = self.store.lock_state()?;
        let mut changed = 0u64;
        for id in ids {
            let pending = state
                .rows
                .get(id)
                .is_some_and(|row| row.status == MessageStatus::Pending);
            if pending && !self.pending_sent.contains_key(id) {
                self.pending_sent.insert(*id, sent_at);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn fetch_by_ids(&mut self, ids: &[i64]) -> Result<Vec<Message>> {
        let state = self.store.lock_state()?;
        Ok(select_by_ids(self.view(&state).into_iter(), ids))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let mut state = this.store.lock_state()?;
        for (id, at) in std::mem::take(&mut this.pending_sent) {
            if let Some(row) = state.rows.get_mut(&id) {
                row.mark_sent(at);
            }
        }
        this.release_locks(&mut state);
        this.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut state) = self.store.state.lock() {
            self.release_locks(&mut state);
        }
    }
}
