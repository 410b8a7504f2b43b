//! The per-message pipeline: CLASSIFY → RESOLVE → RECORD, and the
//! per-cycle loop that drives it with exactly-once accounting.
//!
//! Cursor discipline: the cursor advances only after a message's
//! ProcessingRecord has persisted. Any error mid-cycle aborts the cycle
//! with the cursor still pointing at the last fully-recorded message, so
//! the next cycle retries from there. Replays are absorbed by the
//! idempotent ProcessingRecord insert and the refund check-and-set.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::knowledge::KnowledgeIndex;
use crate::llm::LlmProvider;
use crate::mailbox::MailboxGateway;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::question::QuestionResolver;
use crate::pipeline::refund::RefundResolver;
use crate::pipeline::types::{
    Category, CursorMarker, CycleSummary, Importance, InboundEmail, Resolution,
};
use crate::store::{Database, ProcessingRecord, UnhandledRecord};

pub struct MessageProcessor {
    db: Arc<dyn Database>,
    mailbox: Arc<dyn MailboxGateway>,
    classifier: Classifier,
    questions: QuestionResolver,
    refunds: RefundResolver,
}

impl MessageProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        provider: Arc<dyn LlmProvider>,
        index: Arc<KnowledgeIndex>,
        mailbox: Arc<dyn MailboxGateway>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            classifier: Classifier::new(Arc::clone(&provider)),
            questions: QuestionResolver::new(provider, index, config),
            refunds: RefundResolver::new(Arc::clone(&db)),
            db,
            mailbox,
        }
    }

    /// Run one full processing cycle for an account: fetch everything newer
    /// than the cursor, process oldest-first, advance the cursor per message.
    ///
    /// A deactivated account skips the cycle entirely.
    pub async fn process_once(&self, account: &str) -> Result<CycleSummary, PipelineError> {
        if !self.db.is_active(account).await? {
            debug!(account = %account, "Account inactive, skipping cycle");
            return Ok(CycleSummary::default());
        }

        let cursor = match self.db.get_cursor(account).await? {
            Some(marker) => {
                let decoded = CursorMarker::decode(&marker);
                if decoded.is_none() {
                    warn!(account = %account, marker = %marker, "Unreadable cursor, refetching from start");
                }
                decoded
            }
            None => None,
        };

        let mut messages = self.mailbox.fetch_unseen(cursor.as_ref()).await?;
        // FIFO by receipt time, ties broken by message id. The gateway
        // already sorts; enforcing here keeps the order a local invariant.
        messages.sort_by(|a, b| {
            (a.received_at, a.id.as_str()).cmp(&(b.received_at, b.id.as_str()))
        });

        let mut summary = CycleSummary {
            fetched: messages.len(),
            ..CycleSummary::default()
        };

        for message in &messages {
            match self.process_message(account, message).await? {
                Some(resolution) => {
                    summary.resolved += 1;
                    match resolution {
                        Resolution::Answered { .. } | Resolution::Unhandled => {
                            summary.questions += 1
                        }
                        Resolution::Refund { .. } => summary.refunds += 1,
                        Resolution::Escalated { .. } => summary.escalated += 1,
                    }
                }
                None => summary.already_processed += 1,
            }

            // RECORD succeeded (or was already recorded): safe to advance.
            let marker = CursorMarker::for_message(message).encode();
            self.db.set_cursor(account, &marker).await?;
        }

        if summary.fetched > 0 {
            info!(
                account = %account,
                fetched = summary.fetched,
                resolved = summary.resolved,
                already_processed = summary.already_processed,
                "Cycle complete"
            );
        }
        Ok(summary)
    }

    /// Process a single message end to end. Returns None when a
    /// ProcessingRecord already exists (crash-retry replay, nothing done).
    pub async fn process_message(
        &self,
        account: &str,
        email: &InboundEmail,
    ) -> Result<Option<Resolution>, PipelineError> {
        if self.db.has_processing_record(&email.id).await? {
            debug!(id = %email.id, "Already processed, skipping");
            return Ok(None);
        }

        let classification = self.classifier.classify(&email.subject, &email.body).await;
        debug!(
            id = %email.id,
            category = classification.category.label(),
            "Message classified"
        );

        let resolution = match classification.category {
            Category::Question => {
                let resolution = self.questions.resolve(&email.subject, &email.body).await?;
                if resolution == Resolution::Unhandled {
                    // Unanswerable questions go to the review queue at HIGH.
                    self.db
                        .insert_unhandled(&UnhandledRecord {
                            message_id: email.id.clone(),
                            subject: email.subject.clone(),
                            body: email.body.clone(),
                            importance: Importance::High,
                            reason: "No relevant information found in knowledge base".into(),
                            created_at: Utc::now(),
                        })
                        .await?;
                }
                resolution
            }
            Category::Refund => self.refunds.resolve(email).await?,
            Category::Other => {
                let importance = classification.importance.unwrap_or(Importance::Medium);
                self.db
                    .insert_unhandled(&UnhandledRecord {
                        message_id: email.id.clone(),
                        subject: email.subject.clone(),
                        body: email.body.clone(),
                        importance,
                        reason: "Categorized as other/nonsense email".into(),
                        created_at: Utc::now(),
                    })
                    .await?;
                Resolution::Escalated { importance }
            }
        };

        if let Some(reply) = resolution.reply() {
            self.mailbox
                .send_reply(
                    &email.sender,
                    &format!("Re: {}", email.subject),
                    reply,
                    Some(&email.id),
                )
                .await?;
        }

        let inserted = self
            .db
            .insert_processing_record(&ProcessingRecord {
                message_id: email.id.clone(),
                account: account.to_string(),
                category: classification.category,
                outcome: resolution.label().to_string(),
                importance: classification.importance,
                created_at: Utc::now(),
            })
            .await?;
        if !inserted {
            // Lost a race with a concurrent trigger for the same message.
            warn!(id = %email.id, "Record already present after resolution");
        }

        // Mailbox hygiene is best-effort; the record above is the source
        // of truth for exactly-once.
        if let Err(e) = self.mailbox.mark_processed(&email.id).await {
            warn!(id = %email.id, error = %e, "Could not mark message seen");
        }

        Ok(Some(resolution))
    }
}
