//! Queue message types and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CandidateQuery, Provider};

/// Dispatch status. The only transition is Pending → Sent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            other => Err(crate::error::DispatchError::store(format!(
                "Unknown message status: {other}"
            ))),
        }
    }
}

/// Back-reference to the record that produced a message. Informational only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginRef {
    pub table: String,
    pub id: i64,
}

/// A queued outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginRef>,
    pub recipient: String,
    pub body: String,
    pub priority: u8,
    pub provider: Provider,
    pub status: MessageStatus,
    pub sent_flag: bool,
    pub delivered_flag: bool,
    pub send_after: Option<DateTime<Utc>>,
    pub time_zone: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Whether this message passes the eligibility predicate for the given
    /// provider, instant, and precomputed set of open zones.
    ///
    /// Stores that evaluate the predicate in process use this; SQL stores
    /// express the same test in their WHERE clause.
    pub fn is_eligible(&self, provider: Provider, now: DateTime<Utc>, valid_zones: &[String]) -> bool {
        self.status == CandidateQuery::STATUS
            && self.provider == provider
            && self.send_after.is_none_or(|at| at <= now)
            && self
                .time_zone
                .as_ref()
                .is_none_or(|tz| valid_zones.iter().any(|z| z == tz))
    }

    /// Apply the Pending → Sent transition. Returns false if already sent.
    pub fn mark_sent(&mut self, sent_at: DateTime<Utc>) -> bool {
        if self.status != MessageStatus::Pending {
            return false;
        }
        self.status = MessageStatus::Sent;
        self.sent_flag = true;
        self.sent_at = Some(sent_at);
        self.updated_at = sent_at;
        true
    }
}

/// Dispatch order: priority descending, then id ascending.
pub fn dispatch_order(a: &Message, b: &Message) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.id.cmp(&b.id))
}

/// A message as submitted by a producer, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub recipient: String,
    pub body: String,
    #[serde(default)]
    pub priority: u8,
    pub provider: Provider,
    #[serde(default)]
    pub send_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub origin: Option<OriginRef>,
}

impl NewMessage {
    pub fn new(provider: Provider, recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
            priority: 0,
            provider,
            send_after: None,
            time_zone: None,
            origin: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_send_after(mut self, at: DateTime<Utc>) -> Self {
        self.send_after = Some(at);
        self
    }

    pub fn with_time_zone(mut self, zone: impl Into<String>) -> Self {
        self.time_zone = Some(zone.into());
        self
    }

    pub fn with_origin(mut self, table: impl Into<String>, id: i64) -> Self {
        self.origin = Some(OriginRef { table: table.into(), id });
        self
    }

    /// Materialize into a Pending message with the given id and creation time.
    pub fn into_message(self, id: i64, now: DateTime<Utc>) -> Message {
        Message {
            id,
            origin: self.origin,
            recipient: self.recipient,
            body: self.body,
            priority: self.priority,
            provider: self.provider,
            status: MessageStatus::Pending,
            sent_flag: false,
            delivered_flag: false,
            send_after: self.send_after,
            time_zone: self.time_zone,
            sent_at: None,
            delivered_at: None,
            fetched_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
