//! End-to-end flows across the whole engine: scheduler scan -> guard ->
//! executor -> identity pool -> transport, with compliance and replies in
//! the loop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use cartridge_classifier::Classifier;
use cartridge_compliance::{
    ApproveAll, ComplianceAuthority, ComplianceService, Verdict, VerdictStore, VerdictTrigger,
};
use cartridge_core::config::SchedulerConfig;
use cartridge_core::error::EngineResult;
use cartridge_core::leads::InMemoryLeadStore;
use cartridge_core::transport::SimTransport;
use cartridge_core::types::{EngineJob, Lead};
use cartridge_engine::executor::{CartridgeExecutor, TickOutcome};
use cartridge_engine::store::InstanceStore;
use cartridge_engine::types::{
    AttemptResult, CartridgeDefinition, InstanceStatus, MessageTemplate, Stage,
};
use cartridge_identity::{IdentityHealth, IdentityPool};
use cartridge_platform::TenantManager;
use cartridge_scheduler::{JobOutcome, LoopDriver};

struct World {
    driver: LoopDriver,
    executor: Arc<CartridgeExecutor>,
    transport: Arc<SimTransport>,
    pool: Arc<IdentityPool>,
    verdicts: Arc<VerdictStore>,
    definition_id: Uuid,
}

fn definition(stages: Vec<Stage>) -> CartridgeDefinition {
    CartridgeDefinition {
        id: Uuid::new_v4(),
        name: "flow-test".into(),
        version: 1,
        stages,
        created_at: Utc::now(),
    }
}

fn stage(name: &str, max_attempts: u32, template_ids: &[&str], min_delay_secs: i64) -> Stage {
    Stage {
        name: name.into(),
        templates: template_ids
            .iter()
            .map(|id| MessageTemplate {
                id: id.to_string(),
                body: format!("{id}: hi {{{{first_name}}}}"),
            })
            .collect(),
        max_attempts,
        min_delay_secs,
        halt_on_exhaust: false,
    }
}

fn world_with(
    def: CartridgeDefinition,
    identities: &[&str],
    compliance: Arc<dyn ComplianceService>,
    compliance_timeout_ms: u64,
) -> World {
    let verdicts = Arc::new(VerdictStore::new());
    let store = Arc::new(InstanceStore::new(verdicts.clone()));
    let definition_id = def.id;
    store.register_definition(def).unwrap();

    let pool = Arc::new(IdentityPool::new(5, 3_600));
    for number in identities {
        pool.add_identity("acme", number);
    }

    let leads = Arc::new(InMemoryLeadStore::new());
    leads.insert(Lead {
        id: "lead-1".into(),
        tenant_id: "acme".into(),
        phone: "+15559876543".into(),
        email: None,
        first_name: Some("Pat".into()),
        last_name: None,
        company_name: Some("Summit Deli".into()),
        tags: Vec::new(),
        created_at: Utc::now(),
    });

    let transport = Arc::new(SimTransport::new());
    let authority = Arc::new(ComplianceAuthority::new(
        compliance,
        verdicts.clone(),
        compliance_timeout_ms,
    ));

    let executor = Arc::new(CartridgeExecutor::new(
        store,
        pool.clone(),
        authority,
        transport.clone(),
        leads,
        Arc::new(Classifier::default()),
        1_000,
        0,
    ));

    let tenants = Arc::new(TenantManager::new(10_000));
    tenants.create_tenant("acme", "Acme Corp");

    let driver = LoopDriver::new(
        executor.clone(),
        tenants,
        pool.clone(),
        SchedulerConfig {
            interval_ms: 50,
            batch_size: 100,
            worker_count: 4,
            retry_backoff_secs: 0,
        },
        90,
    );

    World {
        driver,
        executor,
        transport,
        pool,
        verdicts,
        definition_id,
    }
}

fn world(def: CartridgeDefinition, identities: &[&str]) -> World {
    world_with(def, identities, Arc::new(ApproveAll), 1_000)
}

// Scenario 1: three sends select templates A, B, C in order; the fourth
// tick advances to the next stage (or halts when none remain).
#[tokio::test]
async fn template_rotation_then_stage_advance() {
    let w = world(
        definition(vec![
            stage("opener", 3, &["tpl-a", "tpl-b", "tpl-c"], 0),
            stage("nudge", 1, &["tpl-d"], 0),
        ]),
        &["+15550000001"],
    );
    let id = w.executor.enroll("acme", "lead-1", w.definition_id).unwrap();

    // Each scan sends exactly one attempt (delay 0 keeps the instance due).
    for _ in 0..3 {
        w.driver.run_scan().await;
    }

    let attempts = w.executor.store().attempts_for(id);
    let templates: Vec<&str> = attempts.iter().map(|a| a.template_id.as_str()).collect();
    assert_eq!(templates, vec!["tpl-a", "tpl-b", "tpl-c"]);
    assert!(attempts.iter().all(|a| a.result == AttemptResult::Sent));

    // Fourth pass advances the stage, fifth sends from the new stage.
    w.driver.run_scan().await;
    let inst = w.executor.store().instance(id).unwrap();
    assert_eq!(inst.current_stage, 1);
    assert_eq!(inst.attempts_in_stage, 0);

    w.driver.run_scan().await;
    let attempts = w.executor.store().attempts_for(id);
    assert_eq!(attempts.last().unwrap().template_id, "tpl-d");

    // Final stage exhausts -> halted.
    w.driver.run_scan().await;
    assert_eq!(
        w.executor.store().instance(id).unwrap().status,
        InstanceStatus::Halted
    );
}

// Scenario 2: "STOP" after attempt 2 suppresses the instance; later
// scheduler passes produce zero new attempts, and every recorded attempt
// predates the suppress verdict.
#[tokio::test]
async fn stop_reply_suppresses_and_blocks_future_sends() {
    let w = world(
        definition(vec![stage("opener", 5, &["tpl-a"], 0)]),
        &["+15550000001"],
    );
    let id = w.executor.enroll("acme", "lead-1", w.definition_id).unwrap();

    w.driver.run_scan().await;
    w.driver.run_scan().await;
    assert_eq!(w.executor.store().attempts_for(id).len(), 2);

    let outcome = w
        .driver
        .handle_job(EngineJob::InboundReply {
            tenant_id: "acme".into(),
            lead_id: "lead-1".into(),
            message_id: Uuid::new_v4(),
            from_number: "+15559876543".into(),
            body: "STOP".into(),
        })
        .await
        .unwrap();
    match outcome {
        JobOutcome::Reply(reply) => {
            assert_eq!(reply.affected, vec![(id, InstanceStatus::Suppressed)]);
            assert_eq!(reply.classification.labels.len(), 1);
        }
        other => panic!("expected Reply, got {other:?}"),
    }

    // Further scans change nothing.
    w.driver.run_scan().await;
    w.driver.run_scan().await;
    let attempts = w.executor.store().attempts_for(id);
    assert_eq!(attempts.len(), 2);

    // Suppression is retroactively blocking: all attempts predate the verdict.
    let verdict = w.verdicts.standing_suppress(id).unwrap();
    assert_eq!(verdict.triggered_by, VerdictTrigger::InboundReply);
    assert!(attempts.iter().all(|a| a.timestamp <= verdict.timestamp));
}

// Scenario 3: a number that keeps failing gets auto-disabled; the pool
// serves the survivor; with everything disabled the tick defers without
// consuming a stage attempt.
#[tokio::test]
async fn failing_identity_disabled_then_pool_exhausted() {
    let w = world(
        definition(vec![stage("opener", 30, &["tpl-a"], 0)]),
        &["+15550000001", "+15550000002"],
    );
    w.transport.reject_identity("+15550000001", "carrier reject");
    let id = w.executor.enroll("acme", "lead-1", w.definition_id).unwrap();

    // Round-robin alternates; after enough passes the bad number crosses
    // the 5-failure threshold and drops out.
    for _ in 0..10 {
        w.executor.tick(id, true).await.unwrap();
    }
    let identities = w.pool.list_identities("acme");
    let bad = identities
        .iter()
        .find(|i| i.phone_number == "+15550000001")
        .unwrap();
    assert_eq!(bad.health, IdentityHealth::Disabled);

    // Every accepted send came from the healthy number.
    let sent = w.transport.sent_to("+15559876543");
    assert!(!sent.is_empty());
    assert!(sent.iter().all(|m| m.identity == "+15550000002"));

    // Now the survivor goes bad too.
    w.transport.reject_identity("+15550000002", "carrier reject");
    for _ in 0..5 {
        w.executor.tick(id, true).await.unwrap();
    }
    assert_eq!(w.pool.active_count("acme"), 0);

    let attempts_before = w.executor.store().attempts_for(id).len();
    let outcome = w.executor.tick(id, true).await.unwrap();
    assert_eq!(outcome, TickOutcome::NoIdentityAvailable);
    // Retryable scheduling failure: no attempt consumed.
    assert_eq!(w.executor.store().attempts_for(id).len(), attempts_before);

    // Operator re-enable restores sending.
    let good = identities
        .iter()
        .find(|i| i.phone_number == "+15550000002")
        .unwrap();
    w.transport.clear_rejections();
    assert!(w.pool.reenable("acme", good.id));
    assert!(matches!(
        w.executor.tick(id, true).await.unwrap(),
        TickOutcome::Sent { .. }
    ));
}

// Scenario 4: two concurrent ticks for the same instance produce exactly
// one attempt; the loser observes the updated state and no-ops.
#[tokio::test]
async fn concurrent_ticks_single_attempt() {
    let w = world(
        definition(vec![stage("opener", 5, &["tpl-a"], 3_600)]),
        &["+15550000001"],
    );
    let id = w.executor.enroll("acme", "lead-1", w.definition_id).unwrap();

    let (a, b) = tokio::join!(w.executor.tick(id, false), w.executor.tick(id, false));
    let outcomes = [a.unwrap(), b.unwrap()];

    let sent = outcomes
        .iter()
        .filter(|o| matches!(o, TickOutcome::Sent { .. }))
        .count();
    let noop = outcomes
        .iter()
        .filter(|o| matches!(o, TickOutcome::NotDue))
        .count();
    assert_eq!(sent, 1);
    assert_eq!(noop, 1);
    assert_eq!(w.executor.store().attempts_for(id).len(), 1);
    assert_eq!(
        w.executor.store().instance(id).unwrap().attempts_in_stage,
        1
    );
}

/// A recheck service that never answers inside any sane deadline.
struct StalledRecheck;

#[async_trait]
impl ComplianceService for StalledRecheck {
    async fn recheck(
        &self,
        _lead_id: &str,
        _risk_flags: &[String],
        _context: &str,
    ) -> EngineResult<Verdict> {
        tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
        Ok(Verdict::Approve)
    }
}

// Scenario 5: a compliance timeout resolves to suppress even with no risk
// flag raised - fail-closed, never fail-open.
#[tokio::test]
async fn compliance_timeout_fails_closed() {
    let w = world_with(
        definition(vec![stage("opener", 5, &["tpl-a"], 0)]),
        &["+15550000001"],
        Arc::new(StalledRecheck),
        20,
    );
    let id = w.executor.enroll("acme", "lead-1", w.definition_id).unwrap();

    let outcome = w.executor.tick(id, false).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Suppressed { .. }));

    let inst = w.executor.store().instance(id).unwrap();
    assert_eq!(inst.status, InstanceStatus::Suppressed);
    let verdict = w.verdicts.standing_suppress(id).unwrap();
    assert_eq!(verdict.triggered_by, VerdictTrigger::Timeout);

    // Nothing reached the wire.
    assert_eq!(w.transport.total_sent(), 0);
    assert!(w.executor.store().attempts_for(id).is_empty());
}
