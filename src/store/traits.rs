//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::types::{Category, Importance, RefundOutcome};

/// A connected mailbox account.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub address: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Refund lifecycle state on an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Requested,
    Processing,
    Completed,
}

impl RefundStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// An order in the ledger. Read-only from the pipeline except the
/// refund-issued check-and-set.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub customer_email: String,
    pub amount: Decimal,
    pub status: String,
    pub refund_status: Option<RefundStatus>,
    pub refund_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    /// A new completed order with no refund activity.
    pub fn new(order_id: &str, customer_email: &str, amount: Decimal) -> Self {
        Self {
            order_id: order_id.to_string(),
            customer_email: customer_email.to_string(),
            amount,
            status: "completed".to_string(),
            refund_status: None,
            refund_requested_at: None,
            created_at: Utc::now(),
        }
    }
}

/// The terminal record of one processed message. Exactly one per message.
#[derive(Debug, Clone)]
pub struct ProcessingRecord {
    pub message_id: String,
    pub account: String,
    pub category: Category,
    pub outcome: String,
    /// Only set for Other-category messages.
    pub importance: Option<Importance>,
    pub created_at: DateTime<Utc>,
}

/// Audit record of a refund-category message. One per REFUND message.
#[derive(Debug, Clone)]
pub struct RefundRequestRecord {
    pub message_id: String,
    pub requested_order_id: Option<String>,
    pub outcome: RefundOutcome,
    pub created_at: DateTime<Utc>,
}

/// A message flagged for human review (unanswerable questions and all
/// OTHER-category messages).
#[derive(Debug, Clone)]
pub struct UnhandledRecord {
    pub message_id: String,
    pub subject: String,
    pub body: String,
    pub importance: Importance,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Counts by category/outcome since inception.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_processed: u64,
    pub questions: u64,
    pub refunds: u64,
    pub escalated: u64,
    pub unhandled: u64,
    pub refunds_issued: u64,
    pub refunds_not_found: u64,
    pub refunds_missing_id: u64,
}

/// Backend-agnostic database trait covering accounts, the order ledger,
/// processing records, and the per-account cursor.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Accounts ────────────────────────────────────────────────────

    /// Register an account if not present. Existing accounts are untouched.
    async fn upsert_account(&self, address: &str) -> Result<(), DatabaseError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError>;

    /// Gate flag for the poller. Unknown accounts are inactive.
    async fn is_active(&self, address: &str) -> Result<bool, DatabaseError>;

    /// Returns false when the account does not exist.
    async fn set_active(&self, address: &str, active: bool) -> Result<bool, DatabaseError>;

    // ── Cursor ──────────────────────────────────────────────────────

    /// Last-processed marker for an account, if any.
    async fn get_cursor(&self, account: &str) -> Result<Option<String>, DatabaseError>;

    /// Persist the marker. Must complete before the next poll relies on it.
    async fn set_cursor(&self, account: &str, marker: &str) -> Result<(), DatabaseError>;

    // ── Processing records ──────────────────────────────────────────

    /// Insert the terminal record for a message.
    ///
    /// Idempotent: returns false (and changes nothing) when a record for
    /// this message_id already exists — a crash-retry replay, not an error.
    async fn insert_processing_record(
        &self,
        record: &ProcessingRecord,
    ) -> Result<bool, DatabaseError>;

    async fn has_processing_record(&self, message_id: &str) -> Result<bool, DatabaseError>;

    // ── Order ledger ────────────────────────────────────────────────

    /// Insert a new order. Duplicate order_id is a constraint violation.
    async fn insert_order(&self, order: &OrderRecord) -> Result<(), DatabaseError>;

    /// Case-insensitive lookup.
    async fn get_order(&self, order_id: &str) -> Result<Option<OrderRecord>, DatabaseError>;

    async fn list_orders(&self) -> Result<Vec<OrderRecord>, DatabaseError>;

    /// Check-and-set the refund-requested status.
    ///
    /// Returns true when this call transitioned the order; false when a
    /// refund was already issued (no-op, not an error). The conditional
    /// UPDATE serializes racing callers per order.
    async fn mark_refunded(&self, order_id: &str) -> Result<bool, DatabaseError>;

    // ── Refund audit ────────────────────────────────────────────────

    async fn insert_refund_request(
        &self,
        record: &RefundRequestRecord,
    ) -> Result<(), DatabaseError>;

    /// Record a not-found order id attempt for a customer. Repeated
    /// attempts with the same invalid id bump a counter. Returns the
    /// attempt count after this call.
    async fn record_not_found_attempt(
        &self,
        customer_email: &str,
        invalid_order_id: &str,
        body: &str,
    ) -> Result<u32, DatabaseError>;

    // ── Human-review queue ──────────────────────────────────────────

    async fn insert_unhandled(&self, record: &UnhandledRecord) -> Result<(), DatabaseError>;

    // ── Stats ───────────────────────────────────────────────────────

    async fn get_stats(&self) -> Result<Stats, DatabaseError>;
}
