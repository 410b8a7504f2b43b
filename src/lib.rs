//! Customer support email agent: classifies incoming messages, answers
//! questions against a knowledge base, processes refunds against an order
//! ledger, and escalates the rest for human review.

pub mod config;
pub mod error;
pub mod http;
pub mod knowledge;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod store;
