//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are stored
//! as RFC 3339 text; order amounts as decimal strings.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Account, Database, OrderRecord, ProcessingRecord, RefundRequestRecord, RefundStatus, Stats,
    UnhandledRecord,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_db(db)?;
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let backend = Self::from_db(db)?;
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn from_db(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const ORDER_COLUMNS: &str =
    "order_id, customer_email, amount, status, refund_status, refund_requested_at, created_at";

/// Map a libsql Row to an OrderRecord (column order = ORDER_COLUMNS).
fn row_to_order(row: &libsql::Row) -> Result<OrderRecord, DatabaseError> {
    let amount_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("order amount: {e}")))?;
    let refund_status_str: Option<String> = row.get(4).ok();
    let refund_requested_str: Option<String> = row.get(5).ok();
    let created_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("order created_at: {e}")))?;

    Ok(OrderRecord {
        order_id: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("order_id: {e}")))?,
        customer_email: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("customer_email: {e}")))?,
        amount: amount_str
            .parse::<Decimal>()
            .map_err(|e| DatabaseError::Query(format!("order amount parse: {e}")))?,
        status: row
            .get(3)
            .map_err(|e| DatabaseError::Query(format!("order status: {e}")))?,
        refund_status: refund_status_str.as_deref().and_then(RefundStatus::parse),
        refund_requested_at: refund_requested_str.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_str),
    })
}

async fn count_where(conn: &Connection, sql: &str) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
        _ => Ok(0),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    // ── Accounts ────────────────────────────────────────────────────

    async fn upsert_account(&self, address: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO accounts (address, active, created_at) VALUES (?1, 1, ?2)",
                params![address, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_account: {e}")))?;
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address, active, created_at FROM accounts ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?;

        let mut accounts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let created_str: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("account created_at: {e}")))?;
            accounts.push(Account {
                address: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("account address: {e}")))?,
                active: row.get::<i64>(1).unwrap_or(0) != 0,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(accounts)
    }

    async fn is_active(&self, address: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT active FROM accounts WHERE address = ?1",
                params![address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_active: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) != 0),
            _ => Ok(false),
        }
    }

    async fn set_active(&self, address: &str, active: bool) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE accounts SET active = ?1 WHERE address = ?2",
                params![active as i64, address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_active: {e}")))?;
        Ok(changed > 0)
    }

    // ── Cursor ──────────────────────────────────────────────────────

    async fn get_cursor(&self, account: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT marker FROM cursors WHERE account = ?1",
                params![account],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cursor: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).ok()),
            _ => Ok(None),
        }
    }

    async fn set_cursor(&self, account: &str, marker: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO cursors (account, marker, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(account) DO UPDATE SET marker = ?2, updated_at = ?3",
                params![account, marker, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_cursor: {e}")))?;
        Ok(())
    }

    // ── Processing records ──────────────────────────────────────────

    async fn insert_processing_record(
        &self,
        record: &ProcessingRecord,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO processing_records
                 (message_id, account, category, outcome, importance, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.message_id.as_str(),
                    record.account.as_str(),
                    record.category.label(),
                    record.outcome.as_str(),
                    opt_text(record.importance.map(|i| i.label())),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_processing_record: {e}")))?;

        if changed == 0 {
            // Crash-retry replay of an already-recorded message.
            warn!(
                message_id = %record.message_id,
                "Duplicate processing record ignored"
            );
            return Ok(false);
        }
        debug!(message_id = %record.message_id, category = record.category.label(), "Processing record inserted");
        Ok(true)
    }

    async fn has_processing_record(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processing_records WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_processing_record: {e}")))?;
        Ok(matches!(rows.next().await, Ok(Some(_))))
    }

    // ── Order ledger ────────────────────────────────────────────────

    async fn insert_order(&self, order: &OrderRecord) -> Result<(), DatabaseError> {
        let result = self
            .conn()
            .execute(
                "INSERT INTO orders (order_id, customer_email, amount, status, refund_status, refund_requested_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    order.order_id.as_str(),
                    order.customer_email.as_str(),
                    order.amount.to_string(),
                    order.status.as_str(),
                    opt_text(order.refund_status.map(|s| s.label())),
                    opt_text(order.refund_requested_at.map(|t| t.to_rfc3339()).as_deref()),
                    order.created_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(DatabaseError::Constraint(format!(
                "order {} already exists",
                order.order_id
            ))),
            Err(e) => Err(DatabaseError::Query(format!("insert_order: {e}"))),
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<OrderRecord>, DatabaseError> {
        // order_id column is COLLATE NOCASE — lookup is case-insensitive.
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = ?1"),
                params![order_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_order: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_order(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_order: {e}"))),
        }
    }

    async fn list_orders(&self) -> Result<Vec<OrderRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_orders: {e}")))?;

        let mut orders = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            orders.push(row_to_order(&row)?);
        }
        Ok(orders)
    }

    async fn mark_refunded(&self, order_id: &str) -> Result<bool, DatabaseError> {
        // Conditional UPDATE: only transitions orders with no refund yet.
        // The affected-rows check serializes racing callers per order.
        let changed = self
            .conn()
            .execute(
                "UPDATE orders SET refund_status = ?1, refund_requested_at = ?2
                 WHERE order_id = ?3 AND refund_status IS NULL",
                params![
                    RefundStatus::Requested.label(),
                    Utc::now().to_rfc3339(),
                    order_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_refunded: {e}")))?;

        Ok(changed > 0)
    }

    // ── Refund audit ────────────────────────────────────────────────

    async fn insert_refund_request(
        &self,
        record: &RefundRequestRecord,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO refund_requests (id, message_id, requested_order_id, outcome, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    record.message_id.as_str(),
                    opt_text(record.requested_order_id.as_deref()),
                    record.outcome.label(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_refund_request: {e}")))?;
        Ok(())
    }

    async fn record_not_found_attempt(
        &self,
        customer_email: &str,
        invalid_order_id: &str,
        body: &str,
    ) -> Result<u32, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO not_found_attempts
                 (id, customer_email, invalid_order_id, last_body, attempt_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
                 ON CONFLICT(customer_email, invalid_order_id)
                 DO UPDATE SET attempt_count = attempt_count + 1, last_body = ?4, updated_at = ?5",
                params![
                    Uuid::new_v4().to_string(),
                    customer_email,
                    invalid_order_id,
                    body,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_not_found_attempt: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "SELECT attempt_count FROM not_found_attempts
                 WHERE customer_email = ?1 AND invalid_order_id = ?2",
                params![customer_email, invalid_order_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_not_found_attempt read: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(1) as u32),
            _ => Ok(1),
        }
    }

    // ── Human-review queue ──────────────────────────────────────────

    async fn insert_unhandled(&self, record: &UnhandledRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO unhandled (id, message_id, subject, body, importance, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    record.message_id.as_str(),
                    record.subject.as_str(),
                    record.body.as_str(),
                    record.importance.label(),
                    record.reason.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_unhandled: {e}")))?;
        Ok(())
    }

    // ── Stats ───────────────────────────────────────────────────────

    async fn get_stats(&self) -> Result<Stats, DatabaseError> {
        let conn = self.conn();
        Ok(Stats {
            total_processed: count_where(conn, "SELECT COUNT(*) FROM processing_records").await?,
            questions: count_where(
                conn,
                "SELECT COUNT(*) FROM processing_records WHERE category = 'question'",
            )
            .await?,
            refunds: count_where(
                conn,
                "SELECT COUNT(*) FROM processing_records WHERE category = 'refund'",
            )
            .await?,
            escalated: count_where(
                conn,
                "SELECT COUNT(*) FROM processing_records WHERE category = 'other'",
            )
            .await?,
            unhandled: count_where(conn, "SELECT COUNT(*) FROM unhandled").await?,
            refunds_issued: count_where(
                conn,
                "SELECT COUNT(*) FROM refund_requests WHERE outcome = 'issued'",
            )
            .await?,
            refunds_not_found: count_where(
                conn,
                "SELECT COUNT(*) FROM refund_requests WHERE outcome = 'order_not_found'",
            )
            .await?,
            refunds_missing_id: count_where(
                conn,
                "SELECT COUNT(*) FROM refund_requests WHERE outcome = 'order_id_missing'",
            )
            .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Category, Importance, RefundOutcome};
    use rust_decimal_macros::dec;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn record(message_id: &str) -> ProcessingRecord {
        ProcessingRecord {
            message_id: message_id.into(),
            account: "support@shop.example".into(),
            category: Category::Question,
            outcome: "answered".into(),
            importance: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn processing_record_insert_is_idempotent() {
        let db = backend().await;
        assert!(db.insert_processing_record(&record("m1")).await.unwrap());
        // Second insert for the same message is a no-op, not an error.
        assert!(!db.insert_processing_record(&record("m1")).await.unwrap());
        assert!(db.has_processing_record("m1").await.unwrap());
        assert!(!db.has_processing_record("m2").await.unwrap());

        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.total_processed, 1);
    }

    #[tokio::test]
    async fn order_lookup_is_case_insensitive() {
        let db = backend().await;
        db.insert_order(&OrderRecord::new("ORD001", "c@example.com", dec!(99.99)))
            .await
            .unwrap();

        let order = db.get_order("ord001").await.unwrap().unwrap();
        assert_eq!(order.order_id, "ORD001");
        assert_eq!(order.amount, dec!(99.99));
        assert!(db.get_order("ORD999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_order_is_constraint_violation() {
        let db = backend().await;
        db.insert_order(&OrderRecord::new("ORD001", "c@example.com", dec!(10)))
            .await
            .unwrap();
        let err = db
            .insert_order(&OrderRecord::new("ORD001", "other@example.com", dec!(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn mark_refunded_is_check_and_set() {
        let db = backend().await;
        db.insert_order(&OrderRecord::new("ORD001", "c@example.com", dec!(50)))
            .await
            .unwrap();

        // First issue transitions; second is a no-op.
        assert!(db.mark_refunded("ORD001").await.unwrap());
        assert!(!db.mark_refunded("ORD001").await.unwrap());
        // Case-insensitive too.
        assert!(!db.mark_refunded("ord001").await.unwrap());

        let order = db.get_order("ORD001").await.unwrap().unwrap();
        assert_eq!(order.refund_status, Some(RefundStatus::Requested));
        assert!(order.refund_requested_at.is_some());
    }

    #[tokio::test]
    async fn mark_refunded_unknown_order_is_false() {
        let db = backend().await;
        assert!(!db.mark_refunded("NOPE123").await.unwrap());
    }

    #[tokio::test]
    async fn cursor_round_trip() {
        let db = backend().await;
        assert!(db.get_cursor("a@x.com").await.unwrap().is_none());

        db.set_cursor("a@x.com", "2025-03-01T10:00:00+00:00/m1").await.unwrap();
        assert_eq!(
            db.get_cursor("a@x.com").await.unwrap().as_deref(),
            Some("2025-03-01T10:00:00+00:00/m1")
        );

        db.set_cursor("a@x.com", "2025-03-01T11:00:00+00:00/m2").await.unwrap();
        assert_eq!(
            db.get_cursor("a@x.com").await.unwrap().as_deref(),
            Some("2025-03-01T11:00:00+00:00/m2")
        );
    }

    #[tokio::test]
    async fn account_activation_gate() {
        let db = backend().await;
        assert!(!db.is_active("s@x.com").await.unwrap());

        db.upsert_account("s@x.com").await.unwrap();
        assert!(db.is_active("s@x.com").await.unwrap());

        assert!(db.set_active("s@x.com", false).await.unwrap());
        assert!(!db.is_active("s@x.com").await.unwrap());

        // Unknown account.
        assert!(!db.set_active("nobody@x.com", true).await.unwrap());
    }

    #[tokio::test]
    async fn not_found_attempts_bump_counter() {
        let db = backend().await;
        let first = db
            .record_not_found_attempt("c@x.com", "BAD123", "where is my refund")
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = db
            .record_not_found_attempt("c@x.com", "BAD123", "still waiting")
            .await
            .unwrap();
        assert_eq!(second, 2);

        // Different id starts a fresh counter.
        let other = db
            .record_not_found_attempt("c@x.com", "BAD999", "another")
            .await
            .unwrap();
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn local_file_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_order(&OrderRecord::new("ORD001", "c@example.com", dec!(42)))
                .await
                .unwrap();
            db.set_cursor("a@x.com", "2025-03-01T10:00:00+00:00/m1")
                .await
                .unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_order("ORD001").await.unwrap().is_some());
        assert!(db.get_cursor("a@x.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_count_by_outcome() {
        let db = backend().await;
        db.insert_processing_record(&record("m1")).await.unwrap();
        db.insert_processing_record(&ProcessingRecord {
            category: Category::Refund,
            outcome: "issued".into(),
            ..record("m2")
        })
        .await
        .unwrap();
        db.insert_refund_request(&RefundRequestRecord {
            message_id: "m2".into(),
            requested_order_id: Some("ORD001".into()),
            outcome: RefundOutcome::Issued,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        db.insert_unhandled(&UnhandledRecord {
            message_id: "m3".into(),
            subject: "???".into(),
            body: "nonsense".into(),
            importance: Importance::High,
            reason: "categorized as other".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.questions, 1);
        assert_eq!(stats.refunds, 1);
        assert_eq!(stats.refunds_issued, 1);
        assert_eq!(stats.unhandled, 1);
    }
}
