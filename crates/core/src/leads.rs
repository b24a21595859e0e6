//! Lead store interface — the engine's narrow view of the external CRUD
//! layer. Reads leads, appends labels, mutates nothing else.

use dashmap::DashMap;

use crate::types::{CanonicalLabel, Lead};

pub trait LeadStore: Send + Sync {
    fn get_lead(&self, id: &str) -> Option<Lead>;

    /// Append labels to the lead's tag set, deduplicating against tags that
    /// are already present. Unknown lead ids are a silent no-op.
    fn apply_labels(&self, lead_id: &str, labels: &[CanonicalLabel]);
}

/// In-memory lead store backing tests and local runs.
#[derive(Default)]
pub struct InMemoryLeadStore {
    leads: DashMap<String, Lead>,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, lead: Lead) {
        self.leads.insert(lead.id.clone(), lead);
    }

    pub fn len(&self) -> usize {
        self.leads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leads.is_empty()
    }
}

impl LeadStore for InMemoryLeadStore {
    fn get_lead(&self, id: &str) -> Option<Lead> {
        self.leads.get(id).map(|l| l.clone())
    }

    fn apply_labels(&self, lead_id: &str, labels: &[CanonicalLabel]) {
        if labels.is_empty() {
            return;
        }
        if let Some(mut lead) = self.leads.get_mut(lead_id) {
            for label in labels {
                let tag = label.as_str();
                if !lead.tags.iter().any(|t| t == tag) {
                    lead.tags.push(tag.to_string());
                }
            }
            tracing::debug!(lead_id, count = labels.len(), "labels applied to lead");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_lead(id: &str) -> Lead {
        Lead {
            id: id.to_string(),
            tenant_id: "acme".to_string(),
            phone: "+15559876543".to_string(),
            email: None,
            first_name: Some("Pat".to_string()),
            last_name: None,
            company_name: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_labels_dedupes() {
        let store = InMemoryLeadStore::new();
        store.insert(sample_lead("lead-1"));

        store.apply_labels(
            "lead-1",
            &[CanonicalLabel::HighIntent, CanonicalLabel::Responded],
        );
        store.apply_labels(
            "lead-1",
            &[CanonicalLabel::HighIntent, CanonicalLabel::QuestionAsked],
        );

        let lead = store.get_lead("lead-1").unwrap();
        assert_eq!(lead.tags.len(), 3);
        assert_eq!(
            lead.tags,
            vec!["high_intent", "responded", "question_asked"]
        );
    }

    #[test]
    fn test_unknown_lead_noop() {
        let store = InMemoryLeadStore::new();
        store.apply_labels("missing", &[CanonicalLabel::Noise]);
        assert!(store.get_lead("missing").is_none());
    }
}
