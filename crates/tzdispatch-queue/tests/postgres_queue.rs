//! Concurrent claims against PostgreSQL row locks.
//!
//! Needs a reachable database in `DATABASE_URL`. Uses the `sinch` partition,
//! which the store's own Postgres tests leave alone.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tzdispatch_core::config::LockingMode;
use tzdispatch_core::traits::MessageStore;
use tzdispatch_core::types::{MessageStatus, NewMessage, Provider};
use tzdispatch_core::window::{SendWindow, TimeWindowEvaluator};
use tzdispatch_queue::Claimer;
use tzdispatch_store::PgMessageStore;

const PROVIDER: Provider = Provider::Sinch;

async fn store() -> PgMessageStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new().max_connections(16).connect(&url).await.unwrap();
    let store = PgMessageStore::from_pool(pool.clone());
    store.init_schema().await.unwrap();
    sqlx::query("DELETE FROM messages WHERE provider = $1")
        .bind(PROVIDER.as_str())
        .execute(&pool)
        .await
        .unwrap();
    store
}

/// Every hour is open, so only the row locks decide who gets what.
fn always_open() -> TimeWindowEvaluator {
    TimeWindowEvaluator::new(vec!["Etc/UTC".into()], SendWindow::new(0, 23).inclusive(true))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[cfg_attr(not(feature = "postgres-tests"), ignore)]
async fn concurrent_claims_are_disjoint() {
    let store = Arc::new(store().await);
    for i in 0..120u32 {
        store
            .insert(
                NewMessage::new(PROVIDER, format!("+1{i:09}"), "hi")
                    .with_priority((i % 5) as u8)
                    .with_time_zone("Etc/UTC"),
            )
            .await
            .unwrap();
    }
    let claimer = Arc::new(Claimer::new(store.clone(), always_open(), LockingMode::SkipLocked).unwrap());
    assert!(claimer.at_most_once());

    let mut workers = Vec::new();
    for _ in 0..8 {
        let claimer = claimer.clone();
        workers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch = claimer.claim(PROVIDER, 7, Utc::now()).await.unwrap();
                if batch.is_empty() {
                    break ids;
                }
                for pair in batch.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    assert!(a.priority > b.priority || (a.priority == b.priority && a.id < b.id));
                }
                ids.extend(batch.into_iter().map(|m| m.id));
            }
        }));
    }

    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.await.unwrap() {
            assert!(seen.insert(id), "message {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 120);
    let ids: Vec<i64> = seen.into_iter().collect();
    let rows = store.fetch_by_ids(&ids).await.unwrap();
    assert!(rows.iter().all(|m| m.status == MessageStatus::Sent && m.sent_at.is_some()));
}
