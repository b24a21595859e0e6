//! Loop driver — the recurring scan that finds due cartridge instances,
//! enforces per-tenant daily caps, and dispatches each unit of work
//! through the tenant job guard to the executor on a bounded worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cartridge_core::config::SchedulerConfig;
use cartridge_core::error::{EngineError, EngineResult};
use cartridge_core::event_bus::{make_event, EngineEventType, EventSink};
use cartridge_core::types::{EngineJob, OperatorAction};
use cartridge_engine::executor::{CartridgeExecutor, ReplyOutcome, TickOutcome};
use cartridge_identity::IdentityPool;
use cartridge_platform::{TenantJobGuard, TenantManager};

/// What a guarded job produced.
#[derive(Debug)]
pub enum JobOutcome {
    Tick(TickOutcome),
    Reply(ReplyOutcome),
    Command(String),
}

#[derive(Clone)]
pub struct LoopDriver {
    executor: Arc<CartridgeExecutor>,
    tenants: Arc<TenantManager>,
    pool: Arc<IdentityPool>,
    guard: TenantJobGuard,
    config: Arc<RwLock<SchedulerConfig>>,
    /// Config updates land here and are swapped in at the next tick
    /// boundary, never pre-empting a scan in progress.
    pending_config: Arc<Mutex<Option<SchedulerConfig>>>,
    running: Arc<AtomicBool>,
    retention_days: u32,
    event_sink: Arc<dyn EventSink>,
}

impl LoopDriver {
    pub fn new(
        executor: Arc<CartridgeExecutor>,
        tenants: Arc<TenantManager>,
        pool: Arc<IdentityPool>,
        config: SchedulerConfig,
        retention_days: u32,
    ) -> Self {
        Self {
            executor,
            tenants,
            pool,
            guard: TenantJobGuard::new(),
            config: Arc::new(RwLock::new(config)),
            pending_config: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            retention_days,
            event_sink: cartridge_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn executor(&self) -> Arc<CartridgeExecutor> {
        self.executor.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("scheduler started");
    }

    /// Stop scanning. The loop task stays alive; in-flight work finishes.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    /// Queue a config change for the next tick boundary.
    pub fn update_config(&self, config: SchedulerConfig) {
        info!(
            interval_ms = config.interval_ms,
            batch_size = config.batch_size,
            workers = config.worker_count,
            "scheduler config update queued"
        );
        *self.pending_config.lock() = Some(config);
    }

    pub fn current_config(&self) -> SchedulerConfig {
        self.config.read().clone()
    }

    /// Spawn the recurring loop. Returns the task handle; the loop runs
    /// until the handle is aborted.
    pub fn spawn(&self) -> JoinHandle<()> {
        let driver = self.clone();
        tokio::spawn(async move {
            driver.run().await;
        })
    }

    async fn run(&self) {
        let mut interval_ms = self.config.read().interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            ticker.tick().await;

            // Config changes apply here, between scans.
            if let Some(updated) = self.pending_config.lock().take() {
                if updated.interval_ms != interval_ms {
                    interval_ms = updated.interval_ms;
                    ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
                    ticker.reset();
                }
                *self.config.write() = updated;
            }

            if !self.is_running() {
                continue;
            }

            self.run_scan().await;
        }
    }

    /// One scheduler pass: collect due instances, cap-check, guard,
    /// dispatch. Public so operators (and tests) can force a pass.
    pub async fn run_scan(&self) {
        let config = self.current_config();
        let due = self.executor.store().list_due(config.batch_size);
        if due.is_empty() {
            self.executor.store().sweep_retention(self.retention_days);
            return;
        }

        info!(count = due.len(), "dispatching due instances");
        let semaphore = Arc::new(Semaphore::new(config.worker_count.max(1)));
        let mut handles = Vec::with_capacity(due.len());

        for instance in due {
            if !self.tenants.try_consume_send(&instance.tenant_id) {
                self.event_sink.emit(make_event(
                    EngineEventType::DailyCapReached,
                    &instance.tenant_id,
                    Some(instance.id),
                    None,
                ));
                continue;
            }

            let job = EngineJob::ScheduleTick {
                tenant_id: instance.tenant_id.clone(),
                instance_id: instance.id,
                forced: false,
            };
            let valid = match self.guard.guard(job) {
                Ok(v) => v,
                Err(e) => {
                    // Fatal for this job only; the scan carries on.
                    error!(error = %e, "job discarded at guard");
                    continue;
                }
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let executor = self.executor.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let EngineJob::ScheduleTick {
                    instance_id, forced, ..
                } = valid.job()
                {
                    if let Err(e) = executor.tick(*instance_id, *forced).await {
                        error!(instance_id = %instance_id, error = %e, "tick failed");
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "tick task panicked");
            }
        }

        self.executor.store().sweep_retention(self.retention_days);
        metrics::counter!("scheduler.scans").increment(1);
        self.event_sink
            .emit(make_event(EngineEventType::TickCompleted, "system", None, None));
    }

    /// Route a single job (inbound reply, operator action, manual tick)
    /// through the guard to the right subsystem.
    pub async fn handle_job(&self, job: EngineJob) -> EngineResult<JobOutcome> {
        let valid = self.guard.guard(job)?;
        let tenant_id = valid.tenant_id().to_string();

        match valid.into_job() {
            EngineJob::ScheduleTick {
                instance_id, forced, ..
            } => {
                let outcome = self.executor.tick(instance_id, forced).await?;
                Ok(JobOutcome::Tick(outcome))
            }
            EngineJob::InboundReply {
                lead_id,
                message_id,
                from_number,
                body,
                ..
            } => {
                self.tenants.record_reply(&tenant_id);
                let outcome = self
                    .executor
                    .handle_reply(&tenant_id, &lead_id, message_id, &from_number, &body)
                    .await?;
                Ok(JobOutcome::Reply(outcome))
            }
            EngineJob::OperatorCommand { action, issued_by, .. } => {
                info!(tenant_id = %tenant_id, issued_by = %issued_by, ?action, "operator command");
                let detail = self.apply_operator_action(&tenant_id, action).await?;
                Ok(JobOutcome::Command(detail))
            }
        }
    }

    async fn apply_operator_action(
        &self,
        tenant_id: &str,
        action: OperatorAction,
    ) -> EngineResult<String> {
        match action {
            OperatorAction::PauseInstance { instance_id } => {
                self.executor.pause(instance_id).await?;
                Ok(format!("instance {instance_id} paused"))
            }
            OperatorAction::ResumeInstance { instance_id } => {
                self.executor.resume(instance_id).await?;
                Ok(format!("instance {instance_id} resumed"))
            }
            OperatorAction::ForceRunNow { instance_id } => {
                // Operator override: bypasses eligibility, not compliance.
                let outcome = self.executor.tick(instance_id, true).await?;
                Ok(format!("forced tick: {outcome:?}"))
            }
            OperatorAction::ResetDailyCounters => {
                self.tenants
                    .reset_daily_counters(tenant_id)
                    .ok_or(EngineError::NotFound {
                        entity: "tenant",
                        id: tenant_id.to_string(),
                    })?;
                Ok("daily counters reset".to_string())
            }
            OperatorAction::ReenableIdentity { identity_id } => {
                if self.pool.reenable(tenant_id, identity_id) {
                    Ok(format!("identity {identity_id} re-enabled"))
                } else {
                    warn!(tenant_id, identity_id = %identity_id, "re-enable target not found");
                    Err(EngineError::NotFound {
                        entity: "identity",
                        id: identity_id.to_string(),
                    })
                }
            }
        }
    }
}
