//! Message processing pipeline — classification, per-category resolution,
//! and the exactly-once polling loop that drives it.

pub mod classifier;
pub mod poller;
pub mod processor;
pub mod question;
pub mod refund;
pub mod types;

pub use classifier::Classifier;
pub use poller::spawn_account_poller;
pub use processor::MessageProcessor;
pub use question::QuestionResolver;
pub use refund::{extract_order_id, RefundResolver};
