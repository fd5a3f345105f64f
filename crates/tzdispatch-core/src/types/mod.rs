//! Domain types shared by the store backends and the queue.

pub mod message;
pub mod provider;
pub mod query;
pub mod response;

pub use message::{dispatch_order, Message, MessageStatus, NewMessage, OriginRef};
pub use provider::Provider;
pub use query::CandidateQuery;
pub use response::{ClaimResponse, ClaimedItem, QueueStats};
