//! # tzdispatch Queue
//! Claims outbound messages whose recipients' local hour falls inside the
//! send window, and previews what a claim would return.

pub mod claimer;
pub mod service;

pub use claimer::Claimer;
pub use service::QueueService;
