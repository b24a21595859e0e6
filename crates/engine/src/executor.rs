//! Cartridge executor — one tick of the state machine for one instance.
//!
//! All work for a single instance is serialized through a per-instance
//! async lock: a reply can never race a send that read the same snapshot,
//! and a second scheduler tick for the same instance observes the updated
//! record and no-ops. The compliance call and the transport call are the
//! only suspension points; everything else is in-memory bookkeeping.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use cartridge_classifier::{ClassificationResult, Classifier};
use cartridge_compliance::{ComplianceAuthority, Verdict, VerdictTrigger};
use cartridge_core::error::{EngineError, EngineResult};
use cartridge_core::event_bus::{make_event, EngineEventType, EventSink};
use cartridge_core::leads::LeadStore;
use cartridge_core::transport::Transport;
use cartridge_core::types::{CanonicalLabel, Lead};
use cartridge_identity::{IdentityPool, RotationStrategy};

use crate::state_machine::InstanceStateMachine;
use crate::store::InstanceStore;
use crate::types::{AttemptResult, CartridgeInstance, InstanceStatus, SendAttempt};

/// What one tick did. Transient failures come back as outcomes, not
/// errors; only tenant isolation and persistence problems escape as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Not yet eligible, or a forced no-op.
    NotDue,
    /// Instance is paused or already finished.
    NotActive(InstanceStatus),
    Suppressed { reason: String },
    StageAdvanced { stage: usize },
    Halted,
    Sent { attempt_number: u32, template_id: String },
    TransportFailed { reason: String },
    /// Retryable scheduling failure; no attempt consumed.
    NoIdentityAvailable,
    /// A concurrent writer advanced the instance first.
    Conflict,
}

/// Result of ingesting one inbound reply.
#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub classification: ClassificationResult,
    /// Instances touched by this reply and their resulting status.
    pub affected: Vec<(Uuid, InstanceStatus)>,
}

pub struct CartridgeExecutor {
    store: Arc<InstanceStore>,
    pool: Arc<IdentityPool>,
    authority: Arc<ComplianceAuthority>,
    transport: Arc<dyn Transport>,
    leads: Arc<dyn LeadStore>,
    classifier: Arc<Classifier>,
    state_machine: InstanceStateMachine,
    event_sink: Arc<dyn EventSink>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    strategy: RotationStrategy,
    transport_timeout: StdDuration,
    retry_backoff: Duration,
}

impl CartridgeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<InstanceStore>,
        pool: Arc<IdentityPool>,
        authority: Arc<ComplianceAuthority>,
        transport: Arc<dyn Transport>,
        leads: Arc<dyn LeadStore>,
        classifier: Arc<Classifier>,
        transport_timeout_ms: u64,
        retry_backoff_secs: u64,
    ) -> Self {
        Self {
            store,
            pool,
            authority,
            transport,
            leads,
            classifier,
            state_machine: InstanceStateMachine::new(),
            event_sink: cartridge_core::event_bus::noop_sink(),
            locks: DashMap::new(),
            strategy: RotationStrategy::RoundRobin,
            transport_timeout: StdDuration::from_millis(transport_timeout_ms),
            retry_backoff: Duration::seconds(retry_backoff_secs as i64),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_strategy(mut self, strategy: RotationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn store(&self) -> Arc<InstanceStore> {
        self.store.clone()
    }

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── enrollment ─────────────────────────────────────────────────────

    /// Enroll a lead into a cartridge. Idempotent: an existing live (or
    /// suppressed) instance for the same enrollment key is returned as-is.
    pub fn enroll(
        &self,
        tenant_id: &str,
        lead_id: &str,
        definition_id: Uuid,
    ) -> EngineResult<Uuid> {
        if let Some(standing) = self.store.standing_instance(tenant_id, lead_id, definition_id) {
            return Ok(standing.id);
        }

        let definition = self
            .store
            .definition(definition_id)
            .ok_or(EngineError::NotFound {
                entity: "definition",
                id: definition_id.to_string(),
            })?;
        self.leads.get_lead(lead_id).ok_or(EngineError::NotFound {
            entity: "lead",
            id: lead_id.to_string(),
        })?;

        let instance = CartridgeInstance::new(tenant_id, lead_id, &definition);
        let id = instance.id;
        self.store.insert_instance(instance);

        info!(
            tenant_id,
            lead_id,
            instance_id = %id,
            definition = %definition.name,
            version = definition.version,
            "lead enrolled in cartridge"
        );
        self.event_sink.emit(make_event(
            EngineEventType::InstanceEnrolled,
            tenant_id,
            Some(id),
            None,
        ));
        Ok(id)
    }

    // ── tick ───────────────────────────────────────────────────────────

    /// Evaluate one instance: exhaustion check, compliance gate, identity
    /// draw, send, record. Transient failures never consume an attempt
    /// when nothing went out on the wire.
    pub async fn tick(&self, instance_id: Uuid, forced: bool) -> EngineResult<TickOutcome> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let instance = self.store.instance(instance_id).ok_or(EngineError::NotFound {
            entity: "instance",
            id: instance_id.to_string(),
        })?;

        if instance.status != InstanceStatus::Active {
            return Ok(TickOutcome::NotActive(instance.status));
        }

        // A verdict recorded while this instance was still marked active
        // (e.g. written by another process) wins before anything else.
        if self.store.verdicts().is_suppressed(instance_id) {
            self.mark_suppressed(&instance, "standing compliance verdict")?;
            return Ok(TickOutcome::Suppressed {
                reason: "standing compliance verdict".into(),
            });
        }

        if !forced && instance.next_eligible_at > Utc::now() {
            return Ok(TickOutcome::NotDue);
        }

        let definition =
            self.store
                .definition(instance.definition_id)
                .ok_or(EngineError::NotFound {
                    entity: "definition",
                    id: instance.definition_id.to_string(),
                })?;

        let stage = match definition.stages.get(instance.current_stage) {
            Some(s) => s,
            None => return self.halt(&instance, "stage index out of range"),
        };

        // Stage exhaustion fires before any new attempt is considered, so
        // attempts_in_stage can never pass max_attempts.
        if instance.attempts_in_stage >= stage.max_attempts {
            let is_last = instance.current_stage + 1 >= definition.stages.len();
            if is_last || stage.halt_on_exhaust {
                return self.halt(&instance, "exhausted");
            }
            let next_stage = instance.current_stage + 1;
            self.store.update_guarded(instance_id, instance.revision, |i| {
                i.current_stage = next_stage;
                i.attempts_in_stage = 0;
                i.next_eligible_at = Utc::now();
                i.last_outcome = Some("advanced to next stage".into());
            })?;
            self.event_sink.emit(make_event(
                EngineEventType::StageAdvanced,
                &instance.tenant_id,
                Some(instance_id),
                Some(format!("stage {next_stage}")),
            ));
            return Ok(TickOutcome::StageAdvanced { stage: next_stage });
        }

        // Compliance gate. Fail-closed: a timeout inside evaluate() comes
        // back as a suppress verdict like any other.
        let verdict = self
            .authority
            .evaluate(
                instance_id,
                &instance.lead_id,
                VerdictTrigger::ScheduledSend,
                Vec::new(),
                &format!("stage:{}", instance.current_stage),
            )
            .await;
        if verdict.verdict == Verdict::Suppress {
            self.mark_suppressed(&instance, &verdict.reason)?;
            return Ok(TickOutcome::Suppressed {
                reason: verdict.reason,
            });
        }

        let lead = match self.leads.get_lead(&instance.lead_id) {
            Some(l) => l,
            None => return self.halt(&instance, "lead record missing"),
        };

        let identity = match self.pool.next_identity(&instance.tenant_id, self.strategy) {
            Ok(i) => i,
            Err(EngineError::NoIdentityAvailable { .. }) => {
                let backoff = self.retry_backoff;
                self.store.update_guarded(instance_id, instance.revision, |i| {
                    i.next_eligible_at = Utc::now() + backoff;
                    i.last_outcome = Some("no sending identity available".into());
                })?;
                metrics::counter!("engine.no_identity_deferrals").increment(1);
                return Ok(TickOutcome::NoIdentityAvailable);
            }
            Err(e) => return Err(e),
        };

        // Deterministic round-robin over the stage's approved templates:
        // re-runs are reproducible and auditable, never random.
        let template_index = (instance.attempts_in_stage as usize) % stage.templates.len();
        let template = &stage.templates[template_index];
        let body = render_template(&template.body, &lead);
        let attempt_number = instance.attempts_in_stage + 1;

        let send = self.transport.send(&identity.phone_number, &lead.phone, &body);
        let receipt = match tokio::time::timeout(self.transport_timeout, send).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                let reason = format!("transport error: {e}");
                return self.commit_failed_attempt(&instance, template, None, attempt_number, &reason);
            }
            Err(_) => {
                let reason = "transport timeout".to_string();
                return self.commit_failed_attempt(&instance, template, None, attempt_number, &reason);
            }
        };

        if receipt.accepted {
            self.pool.record_success(&instance.tenant_id, identity.id);
            let delay = stage.min_delay();
            let attempt = SendAttempt {
                id: Uuid::new_v4(),
                instance_id,
                tenant_id: instance.tenant_id.clone(),
                stage_index: instance.current_stage,
                attempt_number,
                template_id: template.id.clone(),
                identity_id: Some(identity.id),
                result: AttemptResult::Sent,
                correlation_id: Uuid::new_v4(),
                provider_message_id: receipt.provider_message_id,
                timestamp: Utc::now(),
            };
            match self.store.commit_attempt(instance_id, instance.revision, attempt, |i| {
                i.attempts_in_stage += 1;
                i.last_attempt_at = Some(Utc::now());
                i.last_outcome = Some("sent".into());
                i.next_eligible_at = Utc::now() + delay;
            }) {
                Ok(_) => {}
                Err(EngineError::Persistence { reason }) => {
                    warn!(instance_id = %instance_id, reason, "attempt commit lost to concurrent writer");
                    return Ok(TickOutcome::Conflict);
                }
                Err(e) => return Err(e),
            }

            info!(
                tenant_id = %instance.tenant_id,
                instance_id = %instance_id,
                stage = instance.current_stage,
                attempt = attempt_number,
                template = %template.id,
                "attempt sent"
            );
            self.event_sink.emit(make_event(
                EngineEventType::AttemptRecorded,
                &instance.tenant_id,
                Some(instance_id),
                Some(format!("attempt {attempt_number}")),
            ));
            Ok(TickOutcome::Sent {
                attempt_number,
                template_id: template.id.clone(),
            })
        } else {
            // Identity-attributable rejection counts against the number's
            // health.
            let reason = receipt.reason.unwrap_or_else(|| "rejected".into());
            self.pool
                .record_failure(&instance.tenant_id, identity.id, &reason);
            self.commit_failed_attempt(&instance, template, Some(identity.id), attempt_number, &reason)
        }
    }

    fn commit_failed_attempt(
        &self,
        instance: &CartridgeInstance,
        template: &crate::types::MessageTemplate,
        identity_id: Option<Uuid>,
        attempt_number: u32,
        reason: &str,
    ) -> EngineResult<TickOutcome> {
        let backoff = self.retry_backoff;
        let attempt = SendAttempt {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            tenant_id: instance.tenant_id.clone(),
            stage_index: instance.current_stage,
            attempt_number,
            template_id: template.id.clone(),
            identity_id,
            result: AttemptResult::Failed,
            correlation_id: Uuid::new_v4(),
            provider_message_id: None,
            timestamp: Utc::now(),
        };
        let outcome_reason = reason.to_string();
        match self.store.commit_attempt(instance.id, instance.revision, attempt, |i| {
            i.attempts_in_stage += 1;
            i.last_attempt_at = Some(Utc::now());
            i.last_outcome = Some(outcome_reason);
            i.next_eligible_at = Utc::now() + backoff;
        }) {
            Ok(_) => {}
            Err(EngineError::Persistence { reason }) => {
                warn!(instance_id = %instance.id, reason, "failed-attempt commit lost to concurrent writer");
                return Ok(TickOutcome::Conflict);
            }
            Err(e) => return Err(e),
        }

        warn!(
            tenant_id = %instance.tenant_id,
            instance_id = %instance.id,
            attempt = attempt_number,
            reason,
            "send attempt failed"
        );
        metrics::counter!("engine.attempts_failed").increment(1);
        Ok(TickOutcome::TransportFailed {
            reason: reason.to_string(),
        })
    }

    // ── replies ────────────────────────────────────────────────────────

    /// Ingest one inbound reply: classify, label the lead, and apply the
    /// outcome to every live instance for that lead. Hard stops record the
    /// suppress verdict on this same call chain; there is no window for
    /// another send to escape after an opt-out.
    pub async fn handle_reply(
        &self,
        tenant_id: &str,
        lead_id: &str,
        message_id: Uuid,
        from_number: &str,
        body: &str,
    ) -> EngineResult<ReplyOutcome> {
        let classification = self.classifier.classify(body, Some(from_number));
        let result = classification.clone().into_result(lead_id, message_id);
        self.store.record_classification(result.clone());
        self.leads.apply_labels(lead_id, &classification.labels);

        self.event_sink.emit(make_event(
            EngineEventType::ReplyClassified,
            tenant_id,
            None,
            Some(
                classification
                    .labels
                    .iter()
                    .map(|l| l.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        ));
        metrics::counter!("engine.replies_classified").increment(1);

        let mut affected = Vec::new();
        let live: Vec<CartridgeInstance> = self
            .store
            .instances_for_lead(tenant_id, lead_id)
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .collect();

        for snapshot in live {
            let lock = self.lock_for(snapshot.id);
            let _guard = lock.lock().await;

            // Re-read under the lock; a send may have finished in between.
            let instance = match self.store.instance(snapshot.id) {
                Some(i) if !i.status.is_terminal() => i,
                _ => continue,
            };

            if classification.has_hard_stop() {
                let flags: Vec<String> = classification
                    .labels
                    .iter()
                    .map(|l| l.as_str().to_string())
                    .collect();
                self.store.verdicts().record(
                    instance.id,
                    VerdictTrigger::InboundReply,
                    flags,
                    Verdict::Suppress,
                    "opt-out reply",
                );
                self.mark_suppressed(&instance, "opt-out reply")?;
                affected.push((instance.id, InstanceStatus::Suppressed));
            } else if classification.terminal_positive()
                && instance.status == InstanceStatus::Active
            {
                self.state_machine
                    .transition(instance.status, InstanceStatus::Completed)?;
                self.store.update_guarded(instance.id, instance.revision, |i| {
                    i.status = InstanceStatus::Completed;
                    i.last_outcome = Some("meeting booked".into());
                })?;
                info!(instance_id = %instance.id, "instance completed on terminal-positive reply");
                self.event_sink.emit(make_event(
                    EngineEventType::InstanceCompleted,
                    tenant_id,
                    Some(instance.id),
                    None,
                ));
                affected.push((instance.id, InstanceStatus::Completed));
            } else if instance.status == InstanceStatus::Active
                && classification.labels.iter().any(|l| {
                    matches!(
                        l,
                        CanonicalLabel::HighIntent
                            | CanonicalLabel::WantsCall
                            | CanonicalLabel::NeedsHelp
                            | CanonicalLabel::QuestionAsked
                    )
                })
            {
                // A reply supersedes the attempt schedule: the instance
                // becomes immediately eligible instead of waiting out the
                // stage delay.
                self.store.update_guarded(instance.id, instance.revision, |i| {
                    i.next_eligible_at = Utc::now();
                    i.last_outcome = Some("reply received".into());
                })?;
                affected.push((instance.id, InstanceStatus::Active));
            }
        }

        Ok(ReplyOutcome {
            classification: result,
            affected,
        })
    }

    // ── operator transitions ───────────────────────────────────────────

    /// Pause takes effect at the next safe checkpoint: the per-instance
    /// lock means it waits out any in-flight attempt rather than
    /// cancelling it mid-send.
    pub async fn pause(&self, instance_id: Uuid) -> EngineResult<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let instance = self.store.instance(instance_id).ok_or(EngineError::NotFound {
            entity: "instance",
            id: instance_id.to_string(),
        })?;
        self.state_machine
            .transition(instance.status, InstanceStatus::Paused)?;
        self.store.update_guarded(instance_id, instance.revision, |i| {
            i.status = InstanceStatus::Paused;
            i.last_outcome = Some("paused by operator".into());
        })?;
        self.event_sink.emit(make_event(
            EngineEventType::InstancePaused,
            &instance.tenant_id,
            Some(instance_id),
            None,
        ));
        Ok(())
    }

    pub async fn resume(&self, instance_id: Uuid) -> EngineResult<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let instance = self.store.instance(instance_id).ok_or(EngineError::NotFound {
            entity: "instance",
            id: instance_id.to_string(),
        })?;
        self.state_machine
            .transition(instance.status, InstanceStatus::Active)?;
        self.store.update_guarded(instance_id, instance.revision, |i| {
            i.status = InstanceStatus::Active;
            i.last_outcome = Some("resumed by operator".into());
        })?;
        self.event_sink.emit(make_event(
            EngineEventType::InstanceResumed,
            &instance.tenant_id,
            Some(instance_id),
            None,
        ));
        Ok(())
    }

    // ── helpers ────────────────────────────────────────────────────────

    fn mark_suppressed(&self, instance: &CartridgeInstance, reason: &str) -> EngineResult<()> {
        self.state_machine
            .transition(instance.status, InstanceStatus::Suppressed)?;
        let outcome = reason.to_string();
        self.store.update_guarded(instance.id, instance.revision, |i| {
            i.status = InstanceStatus::Suppressed;
            i.last_outcome = Some(outcome);
        })?;
        info!(
            tenant_id = %instance.tenant_id,
            instance_id = %instance.id,
            reason,
            "instance suppressed"
        );
        self.event_sink.emit(make_event(
            EngineEventType::InstanceSuppressed,
            &instance.tenant_id,
            Some(instance.id),
            Some(reason.to_string()),
        ));
        Ok(())
    }

    fn halt(&self, instance: &CartridgeInstance, reason: &str) -> EngineResult<TickOutcome> {
        self.state_machine
            .transition(instance.status, InstanceStatus::Halted)?;
        let outcome = reason.to_string();
        self.store.update_guarded(instance.id, instance.revision, |i| {
            i.status = InstanceStatus::Halted;
            i.last_outcome = Some(outcome);
        })?;
        info!(
            tenant_id = %instance.tenant_id,
            instance_id = %instance.id,
            reason,
            "instance halted"
        );
        self.event_sink.emit(make_event(
            EngineEventType::InstanceHalted,
            &instance.tenant_id,
            Some(instance.id),
            Some(reason.to_string()),
        ));
        Ok(TickOutcome::Halted)
    }
}

/// Substitute `{{field}}` placeholders with lead fields. Unknown
/// placeholders render empty.
pub fn render_template(body: &str, lead: &Lead) -> String {
    let first_name = lead.first_name.as_deref().unwrap_or("there");
    let pairs = [
        ("{{first_name}}", first_name),
        ("{{last_name}}", lead.last_name.as_deref().unwrap_or("")),
        ("{{company_name}}", lead.company_name.as_deref().unwrap_or("")),
        ("{{email}}", lead.email.as_deref().unwrap_or("")),
    ];

    let mut rendered = body.to_string();
    for (placeholder, value) in pairs {
        rendered = rendered.replace(placeholder, value);
    }

    // Strip any placeholder that has no binding.
    while let Some(start) = rendered.find("{{") {
        match rendered[start..].find("}}") {
            Some(rel_end) => rendered.replace_range(start..start + rel_end + 2, ""),
            None => break,
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartridge_compliance::{ApproveAll, VerdictStore};
    use cartridge_core::leads::InMemoryLeadStore;
    use cartridge_core::transport::SimTransport;
    use crate::types::{CartridgeDefinition, MessageTemplate, Stage};

    struct Fixture {
        executor: CartridgeExecutor,
        transport: Arc<SimTransport>,
        leads: Arc<InMemoryLeadStore>,
        pool: Arc<IdentityPool>,
        definition_id: Uuid,
    }

    fn definition(stage_specs: &[(u32, &[&str])]) -> CartridgeDefinition {
        CartridgeDefinition {
            id: Uuid::new_v4(),
            name: "test-cartridge".into(),
            version: 1,
            stages: stage_specs
                .iter()
                .enumerate()
                .map(|(n, (max_attempts, templates))| Stage {
                    name: format!("stage-{n}"),
                    templates: templates
                        .iter()
                        .map(|id| MessageTemplate {
                            id: id.to_string(),
                            body: format!("{id} for {{{{first_name}}}}"),
                        })
                        .collect(),
                    max_attempts: *max_attempts,
                    min_delay_secs: 0,
                    halt_on_exhaust: false,
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    fn lead(id: &str) -> Lead {
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

    fn fixture(def: CartridgeDefinition, identities: usize) -> Fixture {
        let verdicts = Arc::new(VerdictStore::new());
        let store = Arc::new(InstanceStore::new(verdicts.clone()));
        let definition_id = def.id;
        store.register_definition(def).unwrap();

        let pool = Arc::new(IdentityPool::new(5, 3_600));
        for i in 0..identities {
            pool.add_identity("acme", &format!("+1555000000{i}"));
        }

        let transport = Arc::new(SimTransport::new());
        let leads = Arc::new(InMemoryLeadStore::new());
        leads.insert(lead("lead-1"));

        let authority = Arc::new(ComplianceAuthority::new(
            Arc::new(ApproveAll),
            verdicts,
            1_000,
        ));

        let executor = CartridgeExecutor::new(
            store,
            pool.clone(),
            authority,
            transport.clone(),
            leads.clone(),
            Arc::new(Classifier::default()),
            1_000,
            300,
        );

        Fixture {
            executor,
            transport,
            leads,
            pool,
            definition_id,
        }
    }

    #[tokio::test]
    async fn test_template_round_robin_then_advance() {
        let fx = fixture(definition(&[(3, &["a", "b", "c"]), (2, &["d"])]), 1);
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        for expected in ["a", "b", "c"] {
            let outcome = fx.executor.tick(id, false).await.unwrap();
            match outcome {
                TickOutcome::Sent { template_id, .. } => assert_eq!(template_id, expected),
                other => panic!("expected Sent, got {other:?}"),
            }
        }

        // Fourth tick advances the stage instead of sending.
        let outcome = fx.executor.tick(id, false).await.unwrap();
        assert_eq!(outcome, TickOutcome::StageAdvanced { stage: 1 });

        let inst = fx.executor.store().instance(id).unwrap();
        assert_eq!(inst.current_stage, 1);
        assert_eq!(inst.attempts_in_stage, 0);

        // Fifth tick sends from the new stage.
        let outcome = fx.executor.tick(id, false).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Sent { ref template_id, .. } if template_id == "d"));
    }

    #[tokio::test]
    async fn test_halt_on_final_stage_exhaustion() {
        let fx = fixture(definition(&[(1, &["a"])]), 1);
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        assert!(matches!(
            fx.executor.tick(id, false).await.unwrap(),
            TickOutcome::Sent { .. }
        ));
        assert_eq!(fx.executor.tick(id, false).await.unwrap(), TickOutcome::Halted);

        let inst = fx.executor.store().instance(id).unwrap();
        assert_eq!(inst.status, InstanceStatus::Halted);
        assert_eq!(inst.last_outcome.as_deref(), Some("exhausted"));

        // A halted instance never ticks again.
        assert_eq!(
            fx.executor.tick(id, false).await.unwrap(),
            TickOutcome::NotActive(InstanceStatus::Halted)
        );
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_cap() {
        let fx = fixture(definition(&[(2, &["a"]), (2, &["b"])]), 1);
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        for _ in 0..12 {
            let _ = fx.executor.tick(id, false).await.unwrap();
            let inst = fx.executor.store().instance(id).unwrap();
            let def = fx.executor.store().definition(fx.definition_id).unwrap();
            if inst.status == InstanceStatus::Active {
                assert!(
                    inst.attempts_in_stage <= def.stages[inst.current_stage].max_attempts,
                    "attempt cap violated"
                );
            }
        }

        let inst = fx.executor.store().instance(id).unwrap();
        assert_eq!(inst.status, InstanceStatus::Halted);
        assert_eq!(fx.executor.store().attempts_for(id).len(), 4);
    }

    #[tokio::test]
    async fn test_opt_out_reply_suppresses() {
        let fx = fixture(definition(&[(3, &["a", "b", "c"])]), 1);
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        fx.executor.tick(id, false).await.unwrap();
        fx.executor.tick(id, false).await.unwrap();

        let outcome = fx
            .executor
            .handle_reply("acme", "lead-1", Uuid::new_v4(), "+15559876543", "STOP")
            .await
            .unwrap();
        assert_eq!(outcome.affected, vec![(id, InstanceStatus::Suppressed)]);

        let inst = fx.executor.store().instance(id).unwrap();
        assert_eq!(inst.status, InstanceStatus::Suppressed);
        assert!(fx.executor.store().verdicts().is_suppressed(id));

        // The opt-out label reached the lead record.
        let lead = fx.leads.get_lead("lead-1").unwrap();
        assert!(lead.tags.contains(&"opted_out".to_string()));

        // Subsequent ticks produce zero new attempts.
        let before = fx.executor.store().attempts_for(id).len();
        assert!(matches!(
            fx.executor.tick(id, false).await.unwrap(),
            TickOutcome::NotActive(InstanceStatus::Suppressed)
        ));
        assert_eq!(fx.executor.store().attempts_for(id).len(), before);
    }

    #[tokio::test]
    async fn test_meeting_booked_completes() {
        let fx = fixture(definition(&[(3, &["a"])]), 1);
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();
        fx.executor.tick(id, false).await.unwrap();

        let outcome = fx
            .executor
            .handle_reply(
                "acme",
                "lead-1",
                Uuid::new_v4(),
                "+15559876543",
                "Booked, see you then!",
            )
            .await
            .unwrap();
        assert_eq!(outcome.affected, vec![(id, InstanceStatus::Completed)]);
        assert_eq!(
            fx.executor.store().instance(id).unwrap().status,
            InstanceStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_rejection_rotates_and_counts_attempt() {
        let fx = fixture(definition(&[(3, &["a"])]), 2);
        // First identity rejects, second accepts.
        fx.transport.reject_identity("+15550000000", "carrier block");
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        let outcome = fx.executor.tick(id, false).await.unwrap();
        assert!(matches!(outcome, TickOutcome::TransportFailed { .. }));
        let inst = fx.executor.store().instance(id).unwrap();
        assert_eq!(inst.attempts_in_stage, 1);

        // Next tick draws the rotated identity and succeeds.
        let outcome = fx.executor.tick(id, true).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Sent { .. }));
        let sent = fx.transport.sent_to("+15559876543");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].identity, "+15550000001");
    }

    #[tokio::test]
    async fn test_no_identity_consumes_nothing() {
        let fx = fixture(definition(&[(3, &["a"])]), 0);
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        let outcome = fx.executor.tick(id, false).await.unwrap();
        assert_eq!(outcome, TickOutcome::NoIdentityAvailable);

        let inst = fx.executor.store().instance(id).unwrap();
        assert_eq!(inst.attempts_in_stage, 0);
        assert!(fx.executor.store().attempts_for(id).is_empty());
        // Deferred, not due right now.
        assert!(inst.next_eligible_at > Utc::now());

        // An identity shows up; the forced tick sends without any attempt lost.
        fx.pool.add_identity("acme", "+15550000009");
        assert!(matches!(
            fx.executor.tick(id, true).await.unwrap(),
            TickOutcome::Sent { .. }
        ));
    }

    #[tokio::test]
    async fn test_enroll_idempotent() {
        let fx = fixture(definition(&[(3, &["a"])]), 1);
        let first = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();
        let second = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.executor.store().instance_count(), 1);

        // Still idempotent once suppressed.
        fx.executor
            .handle_reply("acme", "lead-1", Uuid::new_v4(), "+15559876543", "STOP")
            .await
            .unwrap();
        let third = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let fx = fixture(definition(&[(3, &["a"])]), 1);
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        fx.executor.pause(id).await.unwrap();
        assert_eq!(
            fx.executor.tick(id, false).await.unwrap(),
            TickOutcome::NotActive(InstanceStatus::Paused)
        );

        fx.executor.resume(id).await.unwrap();
        assert!(matches!(
            fx.executor.tick(id, false).await.unwrap(),
            TickOutcome::Sent { .. }
        ));

        // Resuming an active instance is an invalid transition.
        assert!(fx.executor.resume(id).await.is_err());
    }

    #[tokio::test]
    async fn test_question_reply_makes_instance_eligible() {
        let fx = fixture(definition(&[(3, &["a"])]), 1);
        let id = fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        // Push eligibility out with a send (delay 0 in fixture), then set a
        // future eligibility manually to observe the reset.
        fx.executor.tick(id, false).await.unwrap();
        let inst = fx.executor.store().instance(id).unwrap();
        fx.executor
            .store()
            .update_guarded(id, inst.revision, |i| {
                i.next_eligible_at = Utc::now() + Duration::hours(12);
            })
            .unwrap();

        fx.executor
            .handle_reply(
                "acme",
                "lead-1",
                Uuid::new_v4(),
                "+15559876543",
                "what is this about?",
            )
            .await
            .unwrap();

        let inst = fx.executor.store().instance(id).unwrap();
        assert!(inst.next_eligible_at <= Utc::now());
        assert_eq!(inst.status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn test_classification_recorded() {
        let fx = fixture(definition(&[(3, &["a"])]), 1);
        fx.executor.enroll("acme", "lead-1", fx.definition_id).unwrap();

        fx.executor
            .handle_reply(
                "acme",
                "lead-1",
                Uuid::new_v4(),
                "+15559876543",
                "interested, email me at pat@example.com",
            )
            .await
            .unwrap();

        let records = fx.executor.store().classifications_for("lead-1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].extracted_email.as_deref(), Some("pat@example.com"));
    }

    #[test]
    fn test_render_template() {
        let l = lead("lead-1");
        assert_eq!(render_template("Hi {{first_name}}!", &l), "Hi Pat!");
        assert_eq!(
            render_template("{{first_name}} at {{company_name}}", &l),
            "Pat at "
        );
        // Unknown placeholders render empty.
        assert_eq!(render_template("Hi {{nickname}}!", &l), "Hi !");
    }
}
