//! Queue facade: input validation, claim, preview, enqueue, stats.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tzdispatch_core::config::{DispatchConfig, LimitRange, LockingMode};
use tzdispatch_core::error::{DispatchError, Result};
use tzdispatch_core::traits::MessageStore;
use tzdispatch_core::types::{CandidateQuery, ClaimResponse, Message, NewMessage, Provider, QueueStats};
use tzdispatch_core::window::{parse_zone, TimeWindowEvaluator};

use crate::claimer::Claimer;

pub struct QueueService {
    claimer: Claimer,
    store: Arc<dyn MessageStore>,
    providers: Vec<Provider>,
    limits: LimitRange,
}

impl QueueService {
    pub fn new(config: &DispatchConfig, store: Arc<dyn MessageStore>) -> Result<Self> {
        let evaluator = TimeWindowEvaluator::new(config.zones.clone(), config.window);
        let claimer = Claimer::new(store.clone(), evaluator, config.locking)?;
        tracing::debug!(
            "Queue on '{}': {} zones, locking = {}",
            store.name(),
            config.zones.len(),
            config.locking
        );
        Ok(Self {
            claimer,
            store,
            providers: config.providers.clone(),
            limits: config.limits,
        })
    }

    pub fn locking_mode(&self) -> LockingMode {
        self.claimer.locking_mode()
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Zones whose local hour is inside the send window at `now`.
    pub fn valid_zones_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.claimer.evaluator().valid_zones(now)
    }

    /// Claim up to `limit` messages for `provider`, marking them sent.
    pub async fn claim(&self, limit: usize, provider: &str) -> Result<ClaimResponse> {
        self.claim_at(limit, provider, Utc::now()).await
    }

    pub async fn claim_at(&self, limit: usize, provider: &str, now: DateTime<Utc>) -> Result<ClaimResponse> {
        let provider = self.check_request(limit, provider)?;
        let claimed = self.claimer.claim(provider, limit, now).await?;
        Ok(ClaimResponse::claimed(claimed))
    }

    /// What `claim` would return right now, without locking or marking.
    /// A later claim may return a different set.
    pub async fn preview(&self, limit: usize, provider: &str) -> Result<ClaimResponse> {
        self.preview_at(limit, provider, Utc::now()).await
    }

    pub async fn preview_at(&self, limit: usize, provider: &str, now: DateTime<Utc>) -> Result<ClaimResponse> {
        let provider = self.check_request(limit, provider)?;
        let valid_zones = self.valid_zones_at(now);
        if valid_zones.is_empty() {
            return Ok(ClaimResponse::preview(Vec::new()));
        }
        let query = CandidateQuery::new(provider, now, valid_zones, limit);
        let candidates = self.store.scan_candidates(&query).await?;
        Ok(ClaimResponse::preview(candidates))
    }

    /// Validate and insert a new pending message.
    pub async fn enqueue(&self, message: NewMessage) -> Result<Message> {
        if message.recipient.trim().is_empty() {
            return Err(DispatchError::validation("Recipient must not be empty"));
        }
        self.check_provider(message.provider)?;
        if let Some(zone) = &message.time_zone {
            parse_zone(zone)?;
            if !self.claimer.evaluator().is_configured(zone) {
                return Err(DispatchError::validation(format!(
                    "Time zone {zone} is not in the configured zone list; the message would never be sent"
                )));
            }
        }

        let stored = self.store.insert(message).await?;
        tracing::info!(
            "📥 Enqueued message {} for {} (priority {})",
            stored.id,
            stored.provider,
            stored.priority
        );
        Ok(stored)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats().await
    }

    fn check_request(&self, limit: usize, provider: &str) -> Result<Provider> {
        if !self.limits.contains(limit) {
            return Err(DispatchError::validation(format!(
                "Limit must be between {} and {}, got {limit}",
                self.limits.min, self.limits.max
            )));
        }
        let provider: Provider = provider.parse()?;
        self.check_provider(provider)?;
        Ok(provider)
    }

    fn check_provider(&self, provider: Provider) -> Result<()> {
        if self.providers.contains(&provider) {
            Ok(())
        } else {
            Err(DispatchError::validation(format!("Provider {provider} is not enabled")))
        }
    }
}
