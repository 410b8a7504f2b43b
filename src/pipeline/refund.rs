//! Refund resolution — order-ID extraction, ledger verification, and
//! refund issuance.
//!
//! Extraction is conservative: zero or multiple distinct candidates both
//! resolve as "missing" so the pipeline never guesses which order to
//! refund. Issuance goes through the ledger's check-and-set so a retry
//! (or a racing manual trigger) cannot double-refund an order.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::pipeline::types::{InboundEmail, RefundOutcome, Resolution};
use crate::store::{Database, RefundRequestRecord};

// Explicitly-marked ids: "order ORD001", "order id: ABC123", "#789".
static MARKED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)order\s*(?:id|number)?\s*[:#]?\s*([A-Za-z0-9][A-Za-z0-9-]*)")
        .unwrap_or_else(|e| panic!("invalid order-id regex: {e}"))
});
static HASH_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#([A-Za-z0-9]+)").unwrap_or_else(|e| panic!("invalid hash-id regex: {e}"))
});
// Bare ledger-format tokens: letter prefix followed by digits, e.g. ORD001.
static BARE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z]{2,}[0-9]{2,})\b").unwrap_or_else(|e| panic!("invalid bare-id regex: {e}"))
});

/// Extract the order identifier from a message, or None when no candidate
/// (or more than one distinct candidate) is present.
pub fn extract_order_id(subject: &str, body: &str) -> Option<String> {
    let text = format!("{subject}\n{body}");

    // BTreeSet dedupes case-variant mentions of the same id and keeps the
    // distinct-candidate count exact.
    let mut candidates: BTreeSet<String> = BTreeSet::new();

    for caps in MARKED_ID.captures_iter(&text).chain(HASH_ID.captures_iter(&text)) {
        if let Some(m) = caps.get(1) {
            let token = m.as_str().to_uppercase();
            // The marked pattern's optional keyword group can leave the
            // keyword itself in the capture ("order id please"); an id
            // always carries at least one digit.
            if token.chars().any(|c| c.is_ascii_digit()) && token.len() >= 3 {
                candidates.insert(token);
            }
        }
    }

    for caps in BARE_ID.captures_iter(&text) {
        if let Some(m) = caps.get(1) {
            let token = m.as_str().to_uppercase();
            if token.len() >= 5 {
                candidates.insert(token);
            }
        }
    }

    match candidates.len() {
        1 => candidates.into_iter().next(),
        _ => None,
    }
}

pub struct RefundResolver {
    db: Arc<dyn Database>,
}

impl RefundResolver {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Resolve a refund-category message. Every branch writes exactly one
    /// RefundRequestRecord and returns a reply to send.
    pub async fn resolve(&self, email: &InboundEmail) -> Result<Resolution, PipelineError> {
        let Some(order_id) = extract_order_id(&email.subject, &email.body) else {
            let reply = "Thank you for contacting us about your refund. To process \
                         your request we need your order ID, which you can find in \
                         your purchase confirmation email. Please reply with your \
                         order ID and we will take care of the rest."
                .to_string();
            self.audit(email, None, RefundOutcome::OrderIdMissing).await?;
            return Ok(Resolution::Refund {
                outcome: RefundOutcome::OrderIdMissing,
                order_id: None,
                reply,
            });
        };

        let Some(order) = self.db.get_order(&order_id).await? else {
            let attempts = self
                .db
                .record_not_found_attempt(&email.sender, &order_id, &email.body)
                .await?;

            // Wording changes on a repeat attempt with the same invalid id.
            let reply = if attempts > 1 {
                format!(
                    "We still cannot find order {order_id} in our system. Please \
                     double-check your order ID or contact our support team \
                     directly for assistance."
                )
            } else {
                format!(
                    "We cannot find order {order_id} in our system. Please check \
                     your order ID and try again. You can find your order ID in \
                     your purchase confirmation email."
                )
            };

            info!(order_id = %order_id, attempts, "Refund requested for unknown order");
            self.audit(email, Some(&order_id), RefundOutcome::OrderNotFound)
                .await?;
            return Ok(Resolution::Refund {
                outcome: RefundOutcome::OrderNotFound,
                order_id: Some(order_id),
                reply,
            });
        };

        // Check-and-set: false means a refund was already issued for this
        // order (crash retry or racing manual trigger); keep the reply, skip
        // the mutation.
        let transitioned = self.db.mark_refunded(&order.order_id).await?;
        if transitioned {
            info!(order_id = %order.order_id, "Refund issued");
        } else {
            warn!(order_id = %order.order_id, "Refund already issued, not re-issuing");
        }

        let reply = format!(
            "Thank you for contacting us regarding order {}. We have processed \
             your refund request and the refund will be completed within 3 days. \
             You will receive a confirmation email once the refund has been \
             processed.",
            order.order_id
        );

        self.audit(email, Some(&order.order_id), RefundOutcome::Issued)
            .await?;
        Ok(Resolution::Refund {
            outcome: RefundOutcome::Issued,
            order_id: Some(order.order_id),
            reply,
        })
    }

    async fn audit(
        &self,
        email: &InboundEmail,
        order_id: Option<&str>,
        outcome: RefundOutcome,
    ) -> Result<(), PipelineError> {
        self.db
            .insert_refund_request(&RefundRequestRecord {
                message_id: email.id.clone(),
                requested_order_id: order_id.map(String::from),
                outcome,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, OrderRecord};
    use rust_decimal_macros::dec;

    #[test]
    fn extracts_marked_order_id() {
        assert_eq!(
            extract_order_id("Refund request", "Please refund order ORD001, thanks"),
            Some("ORD001".into())
        );
        assert_eq!(
            extract_order_id("", "my order id: abc123 was damaged"),
            Some("ABC123".into())
        );
        assert_eq!(
            extract_order_id("Refund for #789", "see subject"),
            Some("789".into())
        );
    }

    #[test]
    fn extracts_bare_ledger_token() {
        assert_eq!(
            extract_order_id("", "ORD002 arrived broken, I want my money back"),
            Some("ORD002".into())
        );
    }

    #[test]
    fn no_token_is_missing() {
        assert_eq!(extract_order_id("Refund", "I want a refund!"), None);
        assert_eq!(extract_order_id("", "my order never arrived"), None);
    }

    #[test]
    fn multiple_distinct_candidates_are_ambiguous() {
        assert_eq!(
            extract_order_id("", "refund orders ORD001 and ORD002 please"),
            None
        );
    }

    #[test]
    fn case_variants_of_one_id_are_not_ambiguous() {
        assert_eq!(
            extract_order_id("Order ORD001", "please refund ord001"),
            Some("ORD001".into())
        );
    }

    fn email(body: &str) -> InboundEmail {
        InboundEmail {
            id: "m1".into(),
            sender: "customer@example.com".into(),
            subject: "Refund request".into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    async fn resolver_with_order() -> RefundResolver {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_order(&OrderRecord::new("ORD001", "customer@example.com", dec!(99.99)))
            .await
            .unwrap();
        RefundResolver::new(db)
    }

    #[tokio::test]
    async fn known_order_is_issued_with_fixed_turnaround() {
        let r = resolver_with_order().await;
        let resolution = r.resolve(&email("Please refund order ORD001")).await.unwrap();

        let Resolution::Refund { outcome, order_id, reply } = resolution else {
            panic!("expected refund resolution");
        };
        assert_eq!(outcome, RefundOutcome::Issued);
        assert_eq!(order_id.as_deref(), Some("ORD001"));
        assert!(reply.contains("ORD001"));
        assert!(reply.contains("within 3 days"));

        let order = r.db.get_order("ORD001").await.unwrap().unwrap();
        assert!(order.refund_status.is_some());
    }

    #[tokio::test]
    async fn reissue_keeps_reply_but_skips_mutation() {
        let r = resolver_with_order().await;
        r.resolve(&email("refund order ORD001")).await.unwrap();
        let first_at = r
            .db
            .get_order("ORD001")
            .await
            .unwrap()
            .unwrap()
            .refund_requested_at;

        let again = r.resolve(&email("refund order ORD001")).await.unwrap();
        assert_eq!(again.label(), "issued");

        let second_at = r
            .db
            .get_order("ORD001")
            .await
            .unwrap()
            .unwrap()
            .refund_requested_at;
        assert_eq!(first_at, second_at);
    }

    #[tokio::test]
    async fn missing_token_asks_for_order_id() {
        let r = resolver_with_order().await;
        let resolution = r.resolve(&email("I want a refund!")).await.unwrap();

        let Resolution::Refund { outcome, order_id, reply } = resolution else {
            panic!("expected refund resolution");
        };
        assert_eq!(outcome, RefundOutcome::OrderIdMissing);
        assert_eq!(order_id, None);
        assert!(reply.to_lowercase().contains("order id"));
    }

    #[tokio::test]
    async fn unknown_order_wording_changes_on_repeat() {
        let r = resolver_with_order().await;

        let first = r.resolve(&email("refund order INVALID123")).await.unwrap();
        assert_eq!(first.label(), "order_not_found");
        assert!(first.reply().is_some_and(|t| t.starts_with("We cannot find")));

        let second = r.resolve(&email("refund order INVALID123")).await.unwrap();
        assert!(second
            .reply()
            .is_some_and(|t| t.starts_with("We still cannot find")));
    }

    #[tokio::test]
    async fn ledger_lookup_is_case_insensitive() {
        let r = resolver_with_order().await;
        let resolution = r.resolve(&email("refund order ord001 please")).await.unwrap();
        assert_eq!(resolution.label(), "issued");
    }
}
