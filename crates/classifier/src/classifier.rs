//! Response classifier / auto-labeler. A pure function over inbound text
//! and the compiled rule table: the same text always produces the same
//! label set, and labels are canonical.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cartridge_core::types::CanonicalLabel;

use crate::rules::RuleSet;

/// Output of classifying one message body.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Ordered, deduplicated label set.
    pub labels: Vec<CanonicalLabel>,
    pub confidence: f32,
    pub extracted_email: Option<String>,
    pub extracted_phone: Option<String>,
}

impl Classification {
    pub fn has_hard_stop(&self) -> bool {
        self.labels.iter().any(|l| l.is_hard_stop())
    }

    pub fn terminal_positive(&self) -> bool {
        self.labels.iter().any(|l| l.is_terminal_positive())
    }

    /// Attach lead/message identity to produce the durable record.
    pub fn into_result(self, lead_id: &str, message_id: Uuid) -> ClassificationResult {
        ClassificationResult {
            lead_id: lead_id.to_string(),
            message_id,
            labels: self.labels,
            confidence: self.confidence,
            extracted_email: self.extracted_email,
            extracted_phone: self.extracted_phone,
            classified_at: Utc::now(),
        }
    }
}

/// Append-only classification record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub lead_id: String,
    pub message_id: Uuid,
    pub labels: Vec<CanonicalLabel>,
    pub confidence: f32,
    pub extracted_email: Option<String>,
    pub extracted_phone: Option<String>,
    pub classified_at: DateTime<Utc>,
}

pub struct Classifier {
    rules: RuleSet,
}

impl Classifier {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Classify a raw message body. `sender_phone` is the number the reply
    /// came from; an extracted phone matching it is not tagged as captured
    /// data (the lead texting from their own number is not new
    /// information).
    ///
    /// Hard stops short-circuit: an opt-out carries no other labels, so
    /// downstream consumers see exactly one signal to act on.
    pub fn classify(&self, text: &str, sender_phone: Option<&str>) -> Classification {
        let body = text.trim();

        if body.is_empty() {
            return Classification {
                labels: vec![CanonicalLabel::Noise],
                confidence: 1.0,
                extracted_email: None,
                extracted_phone: None,
            };
        }

        if self.rules.opt_out.matches(body) {
            // Label only; the message body never reaches the logs.
            tracing::debug!(label = %CanonicalLabel::OptedOut, "hard stop detected");
            return Classification {
                labels: vec![CanonicalLabel::OptedOut],
                confidence: 1.0,
                extracted_email: None,
                extracted_phone: None,
            };
        }

        if self.rules.do_not_contact.matches(body) {
            tracing::debug!(label = %CanonicalLabel::DoNotContact, "hard stop detected");
            return Classification {
                labels: vec![CanonicalLabel::DoNotContact],
                confidence: 1.0,
                extracted_email: None,
                extracted_phone: None,
            };
        }

        if self.rules.noise.matches(body) {
            return Classification {
                labels: vec![CanonicalLabel::Noise],
                confidence: 0.7,
                extracted_email: None,
                extracted_phone: None,
            };
        }

        let mut labels = Vec::new();

        let extracted_email = self.rules.extract_email(body);
        if extracted_email.is_some() {
            labels.push(CanonicalLabel::EmailCaptured);
        }

        let extracted_phone = self.rules.extract_phone(body).filter(|p| {
            let sender_digits: Option<String> = sender_phone.map(|s| {
                let d: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
                if d.len() > 10 {
                    d[d.len() - 10..].to_string()
                } else {
                    d
                }
            });
            sender_digits.as_deref() != Some(p.as_str())
        });
        if extracted_phone.is_some() {
            labels.push(CanonicalLabel::MobileCaptured);
        }

        if self.rules.meeting_booked.matches(body) {
            labels.push(CanonicalLabel::MeetingBooked);
            labels.push(CanonicalLabel::Responded);
        }
        if self.rules.wants_call.matches(body) {
            labels.push(CanonicalLabel::WantsCall);
        }
        if self.rules.needs_help.matches(body) {
            labels.push(CanonicalLabel::NeedsHelp);
        }
        if body.contains('?') {
            labels.push(CanonicalLabel::QuestionAsked);
        }
        if self.rules.high_intent.matches(body) {
            labels.push(CanonicalLabel::HighIntent);
            labels.push(CanonicalLabel::Responded);
        }

        if labels.is_empty() {
            labels.push(CanonicalLabel::Responded);
        }

        // Dedupe, preserving first-seen order.
        let mut seen = Vec::with_capacity(labels.len());
        for l in labels {
            if !seen.contains(&l) {
                seen.push(l);
            }
        }

        let confidence = if seen.len() > 1 { 0.9 } else { 0.8 };
        Classification {
            labels: seen,
            confidence,
            extracted_email,
            extracted_phone,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(RuleSet::default_rules())
    }
}
