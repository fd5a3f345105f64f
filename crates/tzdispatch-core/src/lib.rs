//! # tzdispatch Core
//! Types, the message store seam, configuration, and send-window evaluation.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;
pub mod window;

pub use config::{DispatchConfig, LimitRange, LockingMode, StoreConfig};
pub use error::{DispatchError, Result};
pub use traits::{ClaimTransaction, MessageStore};
pub use types::{CandidateQuery, ClaimResponse, Message, MessageStatus, NewMessage, Provider};
pub use window::{compute_valid_zones, SendWindow, TimeWindowEvaluator};
