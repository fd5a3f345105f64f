//! # tzdispatch Store
//! Message store backends: in-memory, SQLite, and PostgreSQL.

pub mod memory;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use tzdispatch_core::config::StoreConfig;
use tzdispatch_core::error::{DispatchError, Result};
use tzdispatch_core::traits::MessageStore;

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;
pub use sqlite::SqliteMessageStore;

/// Create a message store from configuration. Schemas are bootstrapped.
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn MessageStore>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteMessageStore::open(&config.sqlite_path())?)),
        "postgres" => {
            let url = config.postgres_url.as_deref().ok_or_else(|| {
                DispatchError::config("store.postgres_url is required for the postgres backend")
            })?;
            let store = PgMessageStore::connect(url, config.max_connections).await?;
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MemoryMessageStore::with_row_locks())),
        other => Err(DispatchError::config(format!(
            "Unknown store backend: {other}"
        ))),
    }
}
