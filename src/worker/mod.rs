//! # Worker
//!
//! Consumes tasks from the main queue, invokes them and applies the retry
//! policy carried in each delivery.

pub mod consumer;
pub mod retry;

pub use consumer::Consumer;
pub use retry::{system_clock, Clock, Outcome, RetryController, RetryDecision};
