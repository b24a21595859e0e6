//! Verdict store — append-only compliance decision log with terminal
//! suppression enforced at the data layer. Once a suppress verdict exists
//! for an instance, the store refuses every later approval; callers cannot
//! talk their way past it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Suppress,
}

/// What prompted the verdict request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictTrigger {
    ScheduledSend,
    InboundReply,
    Operator,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub instance_id: Uuid,
    pub triggered_by: VerdictTrigger,
    pub risk_flags: Vec<String>,
    pub verdict: Verdict,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Thread-safe verdict log keyed by instance id.
#[derive(Default)]
pub struct VerdictStore {
    verdicts: DashMap<Uuid, Vec<ComplianceVerdict>>,
}

impl VerdictStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a verdict. Rules:
    /// * Suppress over suppress is an idempotent no-op (the original
    ///   verdict is returned) so enrollment retries stay harmless.
    /// * Approve after suppress is refused; the standing suppress verdict
    ///   is returned instead.
    pub fn record(
        &self,
        instance_id: Uuid,
        triggered_by: VerdictTrigger,
        risk_flags: Vec<String>,
        verdict: Verdict,
        reason: &str,
    ) -> ComplianceVerdict {
        let mut entry = self.verdicts.entry(instance_id).or_default();

        if let Some(standing) = entry.iter().find(|v| v.verdict == Verdict::Suppress) {
            if verdict == Verdict::Approve {
                tracing::warn!(
                    instance_id = %instance_id,
                    "approval refused: instance already suppressed"
                );
            }
            return standing.clone();
        }

        let record = ComplianceVerdict {
            instance_id,
            triggered_by,
            risk_flags,
            verdict,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };

        if verdict == Verdict::Suppress {
            tracing::info!(
                instance_id = %instance_id,
                triggered_by = ?triggered_by,
                reason,
                "suppress verdict recorded"
            );
            metrics::counter!("compliance.suppressions").increment(1);
        }

        entry.push(record.clone());
        record
    }

    /// True once any suppress verdict exists for the instance.
    pub fn is_suppressed(&self, instance_id: Uuid) -> bool {
        self.verdicts
            .get(&instance_id)
            .map(|v| v.iter().any(|r| r.verdict == Verdict::Suppress))
            .unwrap_or(false)
    }

    pub fn standing_suppress(&self, instance_id: Uuid) -> Option<ComplianceVerdict> {
        self.verdicts
            .get(&instance_id)
            .and_then(|v| v.iter().find(|r| r.verdict == Verdict::Suppress).cloned())
    }

    pub fn history(&self, instance_id: Uuid) -> Vec<ComplianceVerdict> {
        self.verdicts
            .get(&instance_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.verdicts.iter().map(|e| e.value().len()).sum()
    }
}
