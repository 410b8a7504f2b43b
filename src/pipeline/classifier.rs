//! Classification — routes each message to a resolution path.
//!
//! The language-understanding decision is delegated to the LLM; parsing is
//! a forgiving word match on the response. Any failure classifies the
//! message OTHER with HIGH importance so it lands in front of a human
//! instead of being dropped or triggering an automated financial action.

use std::sync::Arc;

use tracing::warn;

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Category, Classification, Importance};

pub struct Classifier {
    provider: Arc<dyn LlmProvider>,
}

impl Classifier {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Classify a message into a category, with an importance level for
    /// OTHER-category messages. Never fails: errors and unparseable
    /// responses fall back to OTHER / HIGH.
    pub async fn classify(&self, subject: &str, body: &str) -> Classification {
        let category = match self.categorize(subject, body).await {
            Some(category) => category,
            None => {
                warn!(subject = %subject, "Classification failed, escalating");
                return Classification {
                    category: Category::Other,
                    importance: Some(Importance::High),
                };
            }
        };

        let importance = match category {
            Category::Other => Some(self.importance(body).await),
            _ => None,
        };

        Classification {
            category,
            importance,
        }
    }

    async fn categorize(&self, subject: &str, body: &str) -> Option<Category> {
        let prompt = format!(
            "Analyze this email and categorize it into one of these categories:\n\
             1. \"question\" - if it's asking for help, information, or support\n\
             2. \"refund\" - if it's requesting a refund or return\n\
             3. \"other\" - if it's anything else (spam, nonsense, complaints not asking for refund)\n\n\
             Email Subject: {subject}\n\
             Email Body: {body}\n\n\
             Respond with only one word: question, refund, or other"
        );

        let request =
            CompletionRequest::new(vec![ChatMessage::user(prompt)]).with_temperature(0.0);

        let response = match self.provider.complete(request).await {
            Ok(r) => r.content.trim().to_lowercase(),
            Err(e) => {
                warn!(error = %e, "Categorization request failed");
                return None;
            }
        };

        // Word match, not exact match: models pad answers.
        if response.contains("question") {
            Some(Category::Question)
        } else if response.contains("refund") {
            Some(Category::Refund)
        } else if response.contains("other") {
            Some(Category::Other)
        } else {
            warn!(response = %response, "Unparseable category response");
            None
        }
    }

    /// Importance of an OTHER-category message. Errors fall back to MEDIUM,
    /// the level the original triage queue treats as its default.
    async fn importance(&self, body: &str) -> Importance {
        let prompt = format!(
            "Analyze this email and determine its importance level:\n\
             - HIGH: Urgent complaints, legal issues, escalations, angry customers\n\
             - MEDIUM: General inquiries, feedback, non-urgent issues\n\
             - LOW: Spam, nonsense, promotional emails, obvious junk\n\n\
             Email: {body}\n\n\
             Respond with only: HIGH, MEDIUM, or LOW"
        );

        let request =
            CompletionRequest::new(vec![ChatMessage::user(prompt)]).with_temperature(0.0);

        let response = match self.provider.complete(request).await {
            Ok(r) => r.content.trim().to_uppercase(),
            Err(e) => {
                warn!(error = %e, "Importance request failed, defaulting to medium");
                return Importance::Medium;
            }
        };

        if response.contains("HIGH") {
            Importance::High
        } else if response.contains("MEDIUM") {
            Importance::Medium
        } else {
            Importance::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedProvider;

    #[tokio::test]
    async fn classifies_question() {
        let provider = Arc::new(ScriptedProvider::replies(vec!["question"]));
        let classifier = Classifier::new(provider);

        let c = classifier
            .classify("Shipping", "How long does shipping take?")
            .await;
        assert_eq!(c.category, Category::Question);
        assert_eq!(c.importance, None);
    }

    #[tokio::test]
    async fn classifies_refund_from_padded_response() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            "The category is: refund.",
        ]));
        let classifier = Classifier::new(provider);

        let c = classifier.classify("Refund", "Give me my money back").await;
        assert_eq!(c.category, Category::Refund);
    }

    #[tokio::test]
    async fn other_gets_an_importance_level() {
        let provider = Arc::new(ScriptedProvider::replies(vec!["other", "HIGH"]));
        let classifier = Classifier::new(provider);

        let c = classifier.classify("!!!!", "You guys suck!!!").await;
        assert_eq!(c.category, Category::Other);
        assert_eq!(c.importance, Some(Importance::High));
    }

    #[tokio::test]
    async fn unparseable_response_escalates() {
        let provider = Arc::new(ScriptedProvider::replies(vec!["banana"]));
        let classifier = Classifier::new(provider);

        let c = classifier.classify("hm", "hm").await;
        assert_eq!(c.category, Category::Other);
        assert_eq!(c.importance, Some(Importance::High));
    }

    #[tokio::test]
    async fn provider_error_escalates() {
        let provider = Arc::new(ScriptedProvider::failing());
        let classifier = Classifier::new(provider);

        let c = classifier.classify("hm", "hm").await;
        assert_eq!(c.category, Category::Other);
        assert_eq!(c.importance, Some(Importance::High));
    }

    #[tokio::test]
    async fn importance_error_defaults_to_medium() {
        // Category succeeds, importance call fails.
        let provider = Arc::new(ScriptedProvider::replies(vec!["other"]));
        let classifier = Classifier::new(provider);

        let c = classifier.classify("meh", "meh").await;
        assert_eq!(c.category, Category::Other);
        assert_eq!(c.importance, Some(Importance::Medium));
    }
}
