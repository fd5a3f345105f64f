//! Wire shapes returned to callers of claim/preview and stats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Message, Provider};

/// One claimed (or previewed) message as exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedItem {
    pub id: i64,
    pub recipient: String,
    pub body: String,
    pub provider: Provider,
    pub time_zone: Option<String>,
    pub send_after: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl From<Message> for ClaimedItem {
    fn from(msg: Message) -> Self {
        Self {
            id: msg.id,
            recipient: msg.recipient,
            body: msg.body,
            provider: msg.provider,
            time_zone: msg.time_zone,
            send_after: msg.send_after,
            sent_at: msg.sent_at,
        }
    }
}

/// Response envelope for claim and preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub success: bool,
    pub dry_run: bool,
    pub count: usize,
    pub items: Vec<ClaimedItem>,
}

impl ClaimResponse {
    pub fn claimed(messages: Vec<Message>) -> Self {
        Self::build(messages, false)
    }

    pub fn preview(messages: Vec<Message>) -> Self {
        Self::build(messages, true)
    }

    fn build(messages: Vec<Message>, dry_run: bool) -> Self {
        let items: Vec<ClaimedItem> = messages.into_iter().map(ClaimedItem::from).collect();
        Self {
            success: true,
            dry_run,
            count: items.len(),
            items,
        }
    }
}

/// Advisory queue counts. Not consistent with concurrent claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub sent: u64,
    /// Pending rows per provider.
    pub by_provider: Vec<(Provider, u64)>,
    /// Pending rows per zone; `None` is the unrestricted bucket.
    pub by_time_zone: Vec<(Option<String>, u64)>,
}
