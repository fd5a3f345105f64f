pub mod store;

pub use store::{ClaimTransaction, MessageStore};
