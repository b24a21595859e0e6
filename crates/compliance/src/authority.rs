//! Compliance authority — the synchronous gate in front of every send
//! attempt. Wraps a pluggable recheck service with a hard deadline; a
//! non-answer always resolves to suppress, never to approval.

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use cartridge_core::error::EngineResult;

use crate::verdicts::{ComplianceVerdict, Verdict, VerdictStore, VerdictTrigger};

/// External recheck service, the single source of truth for suppression.
#[async_trait]
pub trait ComplianceService: Send + Sync {
    async fn recheck(
        &self,
        lead_id: &str,
        risk_flags: &[String],
        context: &str,
    ) -> EngineResult<Verdict>;
}

/// In-process policy that approves everything. Wiring default for
/// deployments where the recheck service is not yet configured, and the
/// baseline for tests.
pub struct ApproveAll;

#[async_trait]
impl ComplianceService for ApproveAll {
    async fn recheck(
        &self,
        _lead_id: &str,
        _risk_flags: &[String],
        _context: &str,
    ) -> EngineResult<Verdict> {
        Ok(Verdict::Approve)
    }
}

/// In-process policy driven by a risk-flag denylist plus an explicit
/// per-lead suppression set.
#[derive(Default)]
pub struct StaticPolicy {
    denied_flags: DashSet<String>,
    suppressed_leads: DashSet<String>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_flag(&self, flag: &str) {
        self.denied_flags.insert(flag.to_string());
    }

    pub fn suppress_lead(&self, lead_id: &str) {
        self.suppressed_leads.insert(lead_id.to_string());
    }
}

#[async_trait]
impl ComplianceService for StaticPolicy {
    async fn recheck(
        &self,
        lead_id: &str,
        risk_flags: &[String],
        _context: &str,
    ) -> EngineResult<Verdict> {
        if self.suppressed_leads.contains(lead_id) {
            return Ok(Verdict::Suppress);
        }
        if risk_flags.iter().any(|f| self.denied_flags.contains(f)) {
            return Ok(Verdict::Suppress);
        }
        Ok(Verdict::Approve)
    }
}

/// The gate itself: recheck service + verdict store + deadline.
pub struct ComplianceAuthority {
    service: Arc<dyn ComplianceService>,
    store: Arc<VerdictStore>,
    timeout: Duration,
}

impl ComplianceAuthority {
    pub fn new(service: Arc<dyn ComplianceService>, store: Arc<VerdictStore>, timeout_ms: u64) -> Self {
        Self {
            service,
            store,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn store(&self) -> Arc<VerdictStore> {
        self.store.clone()
    }

    /// Evaluate go/no-go for an instance. A standing suppress verdict
    /// short-circuits without calling the service; a timeout or service
    /// error resolves to suppress (fail-closed) and is logged as a
    /// security-relevant event.
    pub async fn evaluate(
        &self,
        instance_id: Uuid,
        lead_id: &str,
        triggered_by: VerdictTrigger,
        risk_flags: Vec<String>,
        context: &str,
    ) -> ComplianceVerdict {
        if let Some(standing) = self.store.standing_suppress(instance_id) {
            return standing;
        }

        let call = self.service.recheck(lead_id, &risk_flags, context);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Verdict::Approve)) => self.store.record(
                instance_id,
                triggered_by,
                risk_flags,
                Verdict::Approve,
                "approved by recheck",
            ),
            Ok(Ok(Verdict::Suppress)) => self.store.record(
                instance_id,
                triggered_by,
                risk_flags,
                Verdict::Suppress,
                "suppressed by recheck",
            ),
            Ok(Err(e)) => {
                warn!(
                    instance_id = %instance_id,
                    error = %e,
                    "compliance recheck failed, resolving to suppress"
                );
                metrics::counter!("compliance.recheck_failures").increment(1);
                self.store.record(
                    instance_id,
                    VerdictTrigger::Timeout,
                    risk_flags,
                    Verdict::Suppress,
                    "recheck error (fail-closed)",
                )
            }
            Err(_) => {
                warn!(
                    instance_id = %instance_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "compliance recheck timed out, resolving to suppress"
                );
                metrics::counter!("compliance.recheck_timeouts").increment(1);
                self.store.record(
                    instance_id,
                    VerdictTrigger::Timeout,
                    risk_flags,
                    Verdict::Suppress,
                    "recheck timeout (fail-closed)",
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A recheck service that never answers within any useful deadline.
    struct StalledService;

    #[async_trait]
    impl ComplianceService for StalledService {
        async fn recheck(
            &self,
            _lead_id: &str,
            _risk_flags: &[String],
            _context: &str,
        ) -> EngineResult<Verdict> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Verdict::Approve)
        }
    }

    #[tokio::test]
    async fn test_approve_all() {
        let authority = ComplianceAuthority::new(
            Arc::new(ApproveAll),
            Arc::new(VerdictStore::new()),
            1_000,
        );
        let verdict = authority
            .evaluate(
                Uuid::new_v4(),
                "lead-1",
                VerdictTrigger::ScheduledSend,
                vec![],
                "stage:0",
            )
            .await;
        assert_eq!(verdict.verdict, Verdict::Approve);
    }

    #[tokio::test]
    async fn test_timeout_fails_closed() {
        let authority = ComplianceAuthority::new(
            Arc::new(StalledService),
            Arc::new(VerdictStore::new()),
            20,
        );
        let instance_id = Uuid::new_v4();
        let verdict = authority
            .evaluate(
                instance_id,
                "lead-1",
                VerdictTrigger::ScheduledSend,
                vec![],
                "stage:0",
            )
            .await;

        assert_eq!(verdict.verdict, Verdict::Suppress);
        assert_eq!(verdict.triggered_by, VerdictTrigger::Timeout);
        assert!(authority.store().is_suppressed(instance_id));
    }

    #[tokio::test]
    async fn test_standing_suppress_short_circuits() {
        let store = Arc::new(VerdictStore::new());
        let instance_id = Uuid::new_v4();
        store.record(
            instance_id,
            VerdictTrigger::InboundReply,
            vec![],
            Verdict::Suppress,
            "STOP received",
        );

        // ApproveAll would approve, but the standing verdict wins without
        // the service even being consulted.
        let authority = ComplianceAuthority::new(Arc::new(ApproveAll), store, 1_000);
        let verdict = authority
            .evaluate(
                instance_id,
                "lead-1",
                VerdictTrigger::ScheduledSend,
                vec![],
                "stage:0",
            )
            .await;
        assert_eq!(verdict.verdict, Verdict::Suppress);
        assert_eq!(verdict.reason, "STOP received");
    }

    #[tokio::test]
    async fn test_static_policy() {
        let policy = StaticPolicy::new();
        policy.deny_flag("litigator");
        policy.suppress_lead("lead-9");

        assert_eq!(
            policy.recheck("lead-1", &[], "ctx").await.unwrap(),
            Verdict::Approve
        );
        assert_eq!(
            policy
                .recheck("lead-1", &["litigator".into()], "ctx")
                .await
                .unwrap(),
            Verdict::Suppress
        );
        assert_eq!(
            policy.recheck("lead-9", &[], "ctx").await.unwrap(),
            Verdict::Suppress
        );
    }
}
