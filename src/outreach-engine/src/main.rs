//! Outreach Engine — multi-tenant campaign cartridge execution engine.
//!
//! Main entry point that wires the subsystems together and runs the
//! scheduler loop.

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing::info;
use uuid::Uuid;

use cartridge_classifier::{Classifier, RuleSet};
use cartridge_compliance::{ApproveAll, ComplianceAuthority, VerdictStore};
use cartridge_core::config::AppConfig;
use cartridge_core::leads::InMemoryLeadStore;
use cartridge_core::transport::SimTransport;
use cartridge_core::types::Lead;
use cartridge_engine::executor::CartridgeExecutor;
use cartridge_engine::store::InstanceStore;
use cartridge_engine::types::{CartridgeDefinition, MessageTemplate, Stage};
use cartridge_identity::IdentityPool;
use cartridge_platform::TenantManager;
use cartridge_scheduler::{spawn_command_loop, LoopDriver, OperatorCommand};

#[derive(Parser, Debug)]
#[command(name = "outreach-engine")]
#[command(about = "Multi-tenant campaign cartridge execution engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// Scheduler interval in milliseconds (overrides config)
    #[arg(long, env = "OUTREACH_ENGINE__SCHEDULER__INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Scan batch size (overrides config)
    #[arg(long, env = "OUTREACH_ENGINE__SCHEDULER__BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Seed a demo tenant, identities, leads, and one cartridge
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outreach_engine=info,cartridge_scheduler=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Outreach Engine starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.interval_ms {
        config.scheduler.interval_ms = interval;
    }
    if let Some(batch) = cli.batch_size {
        config.scheduler.batch_size = batch;
    }

    info!(
        node_id = %config.node_id,
        interval_ms = config.scheduler.interval_ms,
        batch_size = config.scheduler.batch_size,
        workers = config.scheduler.worker_count,
        "Configuration loaded"
    );

    // Shared stores.
    let verdicts = Arc::new(VerdictStore::new());
    let store = Arc::new(InstanceStore::new(verdicts.clone()));
    let leads = Arc::new(InMemoryLeadStore::new());

    // Sending identity pool.
    let pool = Arc::new(IdentityPool::new(
        config.identity.failure_threshold,
        config.identity.failure_window_secs,
    ));

    // Compliance gate. The in-process approve-all policy stands in until a
    // remote recheck service is wired behind the same trait.
    let authority = Arc::new(ComplianceAuthority::new(
        Arc::new(ApproveAll),
        verdicts,
        config.compliance.timeout_ms,
    ));

    let classifier = Arc::new(Classifier::new(RuleSet::from_config(&config.classifier)?));
    let transport = Arc::new(SimTransport::new());

    let executor = Arc::new(CartridgeExecutor::new(
        store,
        pool.clone(),
        authority,
        transport,
        leads.clone(),
        classifier,
        config.transport.timeout_ms,
        config.scheduler.retry_backoff_secs,
    ));

    let tenants = Arc::new(TenantManager::new(config.tenancy.default_daily_send_cap));

    let driver = LoopDriver::new(
        executor.clone(),
        tenants.clone(),
        pool.clone(),
        config.scheduler.clone(),
        config.engine.retention_days,
    );

    if cli.seed_demo {
        seed_demo(&executor, &tenants, &pool, leads.as_ref());
    }

    let (command_handle, command_task) = spawn_command_loop(driver.clone());

    driver.start();
    let scheduler_task = driver.spawn();

    info!("Outreach Engine is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let ack = command_handle.submit(OperatorCommand::Stop).await;
    info!(accepted = ack.accepted, "scheduler stop acknowledged");

    scheduler_task.abort();
    command_task.abort();

    Ok(())
}

/// Seed one demo tenant with two numbers, three leads, and a two-stage
/// cartridge so a fresh checkout has something to execute.
fn seed_demo(
    executor: &CartridgeExecutor,
    tenants: &TenantManager,
    pool: &IdentityPool,
    leads: &InMemoryLeadStore,
) {
    info!("Seeding demo data");

    tenants.create_tenant("acme-demo", "Acme Demo");
    pool.add_identity("acme-demo", "+15550000001");
    pool.add_identity("acme-demo", "+15550000002");

    let definition = CartridgeDefinition {
        id: Uuid::new_v4(),
        name: "initial-outreach".to_string(),
        version: 1,
        stages: vec![
            Stage {
                name: "opener".to_string(),
                templates: vec![
                    MessageTemplate {
                        id: "opener-direct".to_string(),
                        body: "Hi {{first_name}}, quick question about {{company_name}}."
                            .to_string(),
                    },
                    MessageTemplate {
                        id: "opener-curious".to_string(),
                        body: "{{first_name}}, still the right person at {{company_name}}?"
                            .to_string(),
                    },
                ],
                max_attempts: 3,
                min_delay_secs: 86_400,
                halt_on_exhaust: false,
            },
            Stage {
                name: "final-nudge".to_string(),
                templates: vec![MessageTemplate {
                    id: "nudge-final".to_string(),
                    body: "Last note from me, {{first_name}} - happy to close the file."
                        .to_string(),
                }],
                max_attempts: 2,
                min_delay_secs: 172_800,
                halt_on_exhaust: false,
            },
        ],
        created_at: Utc::now(),
    };
    let definition_id = definition.id;
    executor
        .store()
        .register_definition(definition)
        .expect("demo definition registers");

    for (i, (first, company)) in [
        ("Dana", "Summit Deli"),
        ("Morgan", "Beacon Property Group"),
        ("Riley", "Harbor Marine Supply"),
    ]
    .iter()
    .enumerate()
    {
        let lead_id = format!("demo-lead-{i}");
        leads.insert(Lead {
            id: lead_id.clone(),
            tenant_id: "acme-demo".to_string(),
            phone: format!("+1555444000{i}"),
            email: None,
            first_name: Some((*first).to_string()),
            last_name: None,
            company_name: Some((*company).to_string()),
            tags: Vec::new(),
            created_at: Utc::now(),
        });
        executor
            .enroll("acme-demo", &lead_id, definition_id)
            .expect("demo enrollment succeeds");
    }

    info!("Demo data seeded: 1 tenant, 2 identities, 3 enrolled leads");
}
