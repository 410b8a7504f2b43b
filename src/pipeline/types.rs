//! Shared types for the message processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound message ─────────────────────────────────────────────────

/// An incoming support email, as fetched from the mailbox.
///
/// Immutable once fetched; only outcome records outlive the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEmail {
    /// Mailbox-assigned unique message id.
    pub id: String,
    /// Sender address.
    pub sender: String,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

// ── Classification ──────────────────────────────────────────────────

/// Message category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Question,
    Refund,
    Other,
}

impl Category {
    /// Short label for logging and DB storage.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Refund => "refund",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "question" => Some(Self::Question),
            "refund" => Some(Self::Refund),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Importance of an escalated (OTHER) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    Medium,
    High,
}

impl Importance {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Classifier output: a category, plus an importance signal for Other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: Category,
    /// Present only when category is Other.
    pub importance: Option<Importance>,
}

// ── Resolution ──────────────────────────────────────────────────────

/// Outcome of a refund resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundOutcome {
    Issued,
    OrderNotFound,
    OrderIdMissing,
}

impl RefundOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::OrderNotFound => "order_not_found",
            Self::OrderIdMissing => "order_id_missing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issued" => Some(Self::Issued),
            "order_not_found" => Some(Self::OrderNotFound),
            "order_id_missing" => Some(Self::OrderIdMissing),
            _ => None,
        }
    }
}

/// How a message was resolved. Dispatch is a closed tagged variant:
/// one resolver per category, selected explicitly by the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Question answered from the knowledge base; reply to send.
    Answered { reply: String },
    /// Question the knowledge base could not cover; flagged for a human,
    /// no reply sent.
    Unhandled,
    /// Refund branch taken; reply to send plus the audit outcome.
    Refund {
        outcome: RefundOutcome,
        order_id: Option<String>,
        reply: String,
    },
    /// OTHER message escalated for human review; no reply sent.
    Escalated { importance: Importance },
}

impl Resolution {
    /// Short outcome label for the processing record.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Answered { .. } => "answered",
            Self::Unhandled => "unhandled",
            Self::Refund { outcome, .. } => outcome.label(),
            Self::Escalated { .. } => "escalated",
        }
    }

    /// Reply text to deliver, if this resolution produces one.
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Answered { reply } | Self::Refund { reply, .. } => Some(reply),
            Self::Unhandled | Self::Escalated { .. } => None,
        }
    }
}

// ── Cursor ──────────────────────────────────────────────────────────

/// Durable marker of the last successfully processed message.
///
/// Ordered by (received_at, id) — the same total order the fetch uses, so
/// "newer than cursor" is well-defined even for equal timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorMarker {
    pub received_at: DateTime<Utc>,
    pub message_id: String,
}

impl CursorMarker {
    pub fn for_message(msg: &InboundEmail) -> Self {
        Self {
            received_at: msg.received_at,
            message_id: msg.id.clone(),
        }
    }

    /// True when `msg` is strictly newer than this marker.
    pub fn is_before(&self, msg: &InboundEmail) -> bool {
        (msg.received_at, msg.id.as_str()) > (self.received_at, self.message_id.as_str())
    }

    /// Opaque string form persisted in the cursors table.
    pub fn encode(&self) -> String {
        format!("{}/{}", self.received_at.to_rfc3339(), self.message_id)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (ts, id) = s.split_once('/')?;
        let received_at = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
        Some(Self {
            received_at,
            message_id: id.to_string(),
        })
    }
}

// ── Cycle summary ───────────────────────────────────────────────────

/// Summary of one processing cycle, returned by `process_once`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub fetched: usize,
    pub questions: usize,
    pub refunds: usize,
    pub escalated: usize,
    pub resolved: usize,
    /// Messages skipped because a ProcessingRecord already existed.
    pub already_processed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: &str) -> InboundEmail {
        InboundEmail {
            id: id.into(),
            sender: "c@example.com".into(),
            subject: "s".into(),
            body: "b".into(),
            received_at: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
        }
    }

    #[test]
    fn category_round_trip() {
        for c in [Category::Question, Category::Refund, Category::Other] {
            assert_eq!(Category::parse(c.label()), Some(c));
        }
        assert_eq!(Category::parse("garbage"), None);
    }

    #[test]
    fn refund_outcome_round_trip() {
        for o in [
            RefundOutcome::Issued,
            RefundOutcome::OrderNotFound,
            RefundOutcome::OrderIdMissing,
        ] {
            assert_eq!(RefundOutcome::parse(o.label()), Some(o));
        }
    }

    #[test]
    fn resolution_reply_presence() {
        assert!(Resolution::Answered { reply: "hi".into() }.reply().is_some());
        assert!(Resolution::Unhandled.reply().is_none());
        assert!(Resolution::Escalated { importance: Importance::High }.reply().is_none());
    }

    #[test]
    fn cursor_encode_decode_round_trip() {
        let m = msg("msg-9", "2025-03-01T10:00:00Z");
        let marker = CursorMarker::for_message(&m);
        let decoded = CursorMarker::decode(&marker.encode()).unwrap();
        assert_eq!(decoded, marker);
    }

    #[test]
    fn cursor_ordering_by_time_then_id() {
        let a = msg("a", "2025-03-01T10:00:00Z");
        let b = msg("b", "2025-03-01T10:00:00Z");
        let c = msg("c", "2025-03-01T09:00:00Z");
        let marker = CursorMarker::for_message(&a);

        // Same timestamp, larger id → newer.
        assert!(marker.is_before(&b));
        // Earlier timestamp → not newer.
        assert!(!marker.is_before(&c));
        // Itself → not newer.
        assert!(!marker.is_before(&a));
    }

    #[test]
    fn cursor_decode_rejects_garbage() {
        assert!(CursorMarker::decode("not a marker").is_none());
        assert!(CursorMarker::decode("2025-03-01T10:00:00Z").is_none());
    }
}
