//! Transactional batch claim.
//!
//! One claim = one store transaction: compute open zones, scan and lock
//! eligible rows, mark them sent, re-read them, commit. Anything that fails
//! before commit drops the transaction and the store rolls it back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tzdispatch_core::config::LockingMode;
use tzdispatch_core::error::{DispatchError, Result};
use tzdispatch_core::traits::MessageStore;
use tzdispatch_core::types::{CandidateQuery, Message, Provider};
use tzdispatch_core::window::TimeWindowEvaluator;

pub struct Claimer {
    store: Arc<dyn MessageStore>,
    evaluator: TimeWindowEvaluator,
    locking: LockingMode,
}

impl Claimer {
    /// Fails if `SkipLocked` is requested over a store that cannot skip
    /// locked rows. Degrading to `Unlocked` must be configured explicitly.
    pub fn new(
        store: Arc<dyn MessageStore>,
        evaluator: TimeWindowEvaluator,
        locking: LockingMode,
    ) -> Result<Self> {
        match locking {
            LockingMode::SkipLocked if !store.supports_non_blocking_lock() => {
                return Err(DispatchError::config(format!(
                    "Store '{}' has no non-blocking row locks; set locking = \"unlocked\" to run without the at-most-once guarantee",
                    store.name()
                )));
            }
            LockingMode::Unlocked => {
                tracing::warn!(
                    "⚠️ Claims on '{}' run unlocked: concurrent workers may claim the same message",
                    store.name()
                );
            }
            LockingMode::SkipLocked => {}
        }
        Ok(Self { store, evaluator, locking })
    }

    pub fn locking_mode(&self) -> LockingMode {
        self.locking
    }

    /// Whether concurrent claims are guaranteed disjoint.
    pub fn at_most_once(&self) -> bool {
        self.locking.at_most_once()
    }

    pub fn evaluator(&self) -> &TimeWindowEvaluator {
        &self.evaluator
    }

    /// Claim up to `limit` eligible messages for `provider` as of `now`.
    ///
    /// Returns the post-update rows ordered by priority descending, then id.
    pub async fn claim(&self, provider: Provider, limit: usize, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let valid_zones = self.evaluator.valid_zones(now);
        if valid_zones.is_empty() {
            tracing::debug!("No zone inside the send window; nothing to claim for {provider}");
            return Ok(Vec::new());
        }
        let query = CandidateQuery::new(provider, now, valid_zones, limit);

        let mut tx = self.store.begin().await?;
        let candidates = match self.locking {
            LockingMode::SkipLocked => tx.scan_candidates_for_update(&query).await?,
            LockingMode::Unlocked => tx.scan_candidates(&query).await?,
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = candidates.iter().map(|m| m.id).collect();
        let changed = tx.mark_sent(&ids, now).await?;
        if changed != ids.len() as u64 {
            tracing::warn!(
                "⚠️ Marked {changed} of {} claimed {provider} messages; the rest were already sent",
                ids.len()
            );
        }
        let claimed = tx.fetch_by_ids(&ids).await?;
        tx.commit().await?;

        tracing::info!("📤 Claimed {} {provider} messages", claimed.len());
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use tzdispatch_core::traits::ClaimTransaction;
    use tzdispatch_core::types::{MessageStatus, NewMessage, QueueStats};
    use tzdispatch_core::window::SendWindow;
    use tzdispatch_store::MemoryMessageStore;

    const CHICAGO: &str = "America/Chicago";

    /// 18:00 UTC in January: 12:00 in Chicago.
    fn noon_chicago() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 18, 0, 0).unwrap()
    }

    /// 09:00 UTC in January: 03:00 in Chicago.
    fn night_chicago() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()
    }

    fn evaluator() -> TimeWindowEvaluator {
        TimeWindowEvaluator::new(vec![CHICAGO.to_string()], SendWindow::default())
    }

    async fn seeded(store: MemoryMessageStore, n: usize) -> Arc<MemoryMessageStore> {
        for i in 0..n {
            store
                .insert(NewMessage::new(Provider::Twilio, format!("+1555{i:04}"), "hi").with_priority((i % 4) as u8))
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    fn assert_dispatch_order(msgs: &[Message]) {
        for pair in msgs.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(a.priority > b.priority || (a.priority == b.priority && a.id < b.id));
        }
    }

    #[tokio::test]
    async fn test_claim_marks_and_orders() {
        let store = seeded(MemoryMessageStore::with_row_locks(), 10).await;
        let claimer = Claimer::new(store.clone(), evaluator(), LockingMode::SkipLocked).unwrap();

        let claimed = claimer.claim(Provider::Twilio, 5, noon_chicago()).await.unwrap();
        assert_eq!(claimed.len(), 5);
        assert_dispatch_order(&claimed);
        let keys: Vec<(u8, i64)> = claimed.iter().map(|m| (m.priority, m.id)).collect();
        assert_eq!(keys, vec![(3, 4), (3, 8), (2, 3), (2, 7), (1, 2)]);
        for msg in &claimed {
            assert_eq!(msg.status, MessageStatus::Sent);
            assert!(msg.sent_flag);
            assert_eq!(msg.sent_at, Some(noon_chicago()));
        }
        assert_eq!(store.locked_rows(), 0);

        let rest = claimer.claim(Provider::Twilio, 100, noon_chicago()).await.unwrap();
        assert_eq!(rest.len(), 5);
        assert!(claimer.claim(Provider::Twilio, 100, noon_chicago()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_open_zone_claims_nothing() {
        let store = seeded(MemoryMessageStore::with_row_locks(), 3).await;
        let claimer = Claimer::new(store.clone(), evaluator(), LockingMode::SkipLocked).unwrap();

        // Unrestricted rows exist, but with every zone closed no claim runs.
        assert!(claimer.claim(Provider::Twilio, 10, night_chicago()).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_rows_locked_elsewhere_are_skipped() {
        let store = seeded(MemoryMessageStore::with_row_locks(), 6).await;
        let claimer = Claimer::new(store.clone(), evaluator(), LockingMode::SkipLocked).unwrap();

        let query = CandidateQuery::new(Provider::Twilio, noon_chicago(), vec![CHICAGO.into()], 3);
        let mut other = store.begin().await.unwrap();
        let held: HashSet<i64> = other
            .scan_candidates_for_update(&query)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(held.len(), 3);

        let claimed = claimer.claim(Provider::Twilio, 10, noon_chicago()).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|m| !held.contains(&m.id)));

        drop(other);
        let released = claimer.claim(Provider::Twilio, 10, noon_chicago()).await.unwrap();
        let released: HashSet<i64> = released.iter().map(|m| m.id).collect();
        assert_eq!(released, held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_disjoint() {
        let store = seeded(MemoryMessageStore::with_row_locks(), 200).await;
        let claimer = Arc::new(Claimer::new(store.clone(), evaluator(), LockingMode::SkipLocked).unwrap());

        let mut workers = Vec::new();
        for _ in 0..8 {
            let claimer = claimer.clone();
            workers.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = claimer.claim(Provider::Twilio, 7, noon_chicago()).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    assert_dispatch_order(&batch);
                    mine.extend(batch.into_iter().map(|m| m.id));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.await.unwrap() {
                assert!(seen.insert(id), "message {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(store.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_skip_locked_requires_capability() {
        let store = seeded(MemoryMessageStore::without_row_locks(), 1).await;
        let err = Claimer::new(store, evaluator(), LockingMode::SkipLocked).err().unwrap();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[tokio::test]
    async fn test_unlocked_mode_claims() {
        let store = seeded(MemoryMessageStore::without_row_locks(), 4).await;
        let claimer = Claimer::new(store.clone(), evaluator(), LockingMode::Unlocked).unwrap();
        assert!(!claimer.at_most_once());
        assert_eq!(claimer.locking_mode(), LockingMode::Unlocked);

        let claimed = claimer.claim(Provider::Twilio, 3, noon_chicago()).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert_dispatch_order(&claimed);
        assert!(claimed.iter().all(|m| m.status == MessageStatus::Sent));
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_unlocked_mode_can_double_claim() {
        let store = seeded(MemoryMessageStore::without_row_locks(), 2).await;
        let claimer = Claimer::new(store.clone(), evaluator(), LockingMode::Unlocked).unwrap();

        // A second worker has read and marked the rows but not yet committed.
        let query = CandidateQuery::new(Provider::Twilio, noon_chicago(), vec![CHICAGO.into()], 10);
        let mut other = store.begin().await.unwrap();
        let theirs: Vec<i64> = other.scan_candidates(&query).await.unwrap().iter().map(|m| m.id).collect();
        other.mark_sent(&theirs, noon_chicago()).await.unwrap();

        let ours: Vec<i64> = claimer
            .claim(Provider::Twilio, 10, noon_chicago())
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        other.commit().await.unwrap();

        assert_eq!(ours, theirs);
    }

    /// Store whose transactions fail on the re-read step.
    struct FailingReread(Arc<MemoryMessageStore>);

    struct FailingTx<'a>(Box<dyn ClaimTransaction + 'a>);

    #[async_trait]
    impl MessageStore for FailingReread {
        fn name(&self) -> &str {
            "failing"
        }
        fn supports_non_blocking_lock(&self) -> bool {
            true
        }
        async fn insert(&self, message: NewMessage) -> Result<Message> {
            self.0.insert(message).await
        }
        async fn scan_candidates(&self, query: &CandidateQuery) -> Result<Vec<Message>> {
            self.0.scan_candidates(query).await
        }
        async fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<Message>> {
            self.0.fetch_by_ids(ids).await
        }
        async fn stats(&self) -> Result<QueueStats> {
            self.0.stats().await
        }
        async fn begin<'a>(&'a self) -> Result<Box<dyn ClaimTransaction + 'a>> {
            Ok(Box::new(FailingTx(self.0.begin().await?)))
        }
    }

    #[async_trait]
    impl ClaimTransaction for FailingTx<'_> {
        async fn scan_candidates_for_update(&mut self, query: &CandidateQuery) -> Result<Vec<Message>> {
            self.0.scan_candidates_for_update(query).await
        }
        async fn scan_candidates(&mut self, query: &CandidateQuery) -> Result<Vec<Message>> {
            self.0.scan_candidates(query).await
        }
        async fn mark_sent(&mut self, ids: &[i64], sent_at: DateTime<Utc>) -> Result<u64> {
            self.0.mark_sent(ids, sent_at).await
        }
        async fn fetch_by_ids(&mut self, _ids: &[i64]) -> Result<Vec<Message>> {
            Err(DispatchError::store("connection reset during re-read"))
        }
        async fn commit(self: Box<Self>) -> Result<()> {
            self.0.commit().await
        }
    }

    #[tokio::test]
    async fn test_store_error_rolls_back() {
        let inner = seeded(MemoryMessageStore::with_row_locks(), 4).await;
        let store = Arc::new(FailingReread(inner.clone()));
        let claimer = Claimer::new(store, evaluator(), LockingMode::SkipLocked).unwrap();

        let err = claimer.claim(Provider::Twilio, 10, noon_chicago()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Store(_)));

        let stats = inner.stats().await.unwrap();
        assert_eq!(stats.pending, 4);
        assert_eq!(stats.sent, 0);
        assert_eq!(inner.locked_rows(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_claim_leaves_no_trace() {
        let store = seeded(MemoryMessageStore::with_row_locks(), 4).await;
        let claimer = Claimer::new(store.clone(), evaluator(), LockingMode::SkipLocked).unwrap();

        let fut = claimer.claim(Provider::Twilio, 10, noon_chicago());
        drop(fut);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 4);
        assert_eq!(store.locked_rows(), 0);
    }
}
