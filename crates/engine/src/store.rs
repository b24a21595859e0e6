//! Instance store — durable per-instance state records plus the
//! append-only attempt and classification logs. The scheduler queries this
//! store for due work; there is no separate in-memory status map to drift
//! out of sync.
//!
//! Every instance mutation goes through a revision-guarded update so a
//! stale writer (a concurrent tick that read the same snapshot) loses
//! cleanly instead of double-sending.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use cartridge_classifier::ClassificationResult;
use cartridge_compliance::VerdictStore;
use cartridge_core::error::{EngineError, EngineResult};

use crate::types::{CartridgeDefinition, CartridgeInstance, InstanceStatus, SendAttempt};

pub struct InstanceStore {
    definitions: DashMap<Uuid, Arc<CartridgeDefinition>>,
    instances: DashMap<Uuid, CartridgeInstance>,
    attempts: DashMap<Uuid, Vec<SendAttempt>>,
    /// (tenant_id, lead_id) -> instance ids, for reply routing.
    by_lead: DashMap<(String, String), Vec<Uuid>>,
    classifications: DashMap<String, Vec<ClassificationResult>>,
    verdicts: Arc<VerdictStore>,
}

impl InstanceStore {
    pub fn new(verdicts: Arc<VerdictStore>) -> Self {
        Self {
            definitions: DashMap::new(),
            instances: DashMap::new(),
            attempts: DashMap::new(),
            by_lead: DashMap::new(),
            classifications: DashMap::new(),
            verdicts,
        }
    }

    pub fn verdicts(&self) -> Arc<VerdictStore> {
        self.verdicts.clone()
    }

    // ── definitions ────────────────────────────────────────────────────

    /// Register an immutable definition version. Re-registering an id is
    /// refused: a changed cartridge is a new definition.
    pub fn register_definition(
        &self,
        definition: CartridgeDefinition,
    ) -> EngineResult<Arc<CartridgeDefinition>> {
        if definition.stages.is_empty() {
            return Err(EngineError::Config(format!(
                "definition {} has no stages",
                definition.name
            )));
        }
        if definition.stages.iter().any(|s| s.templates.is_empty()) {
            return Err(EngineError::Config(format!(
                "definition {} has a stage with no templates",
                definition.name
            )));
        }
        if self.definitions.contains_key(&definition.id) {
            return Err(EngineError::Config(format!(
                "definition {} already registered; publish a new version instead",
                definition.id
            )));
        }

        let arc = Arc::new(definition);
        self.definitions.insert(arc.id, arc.clone());
        tracing::info!(
            definition_id = %arc.id,
            name = %arc.name,
            version = arc.version,
            stages = arc.stages.len(),
            "cartridge definition registered"
        );
        Ok(arc)
    }

    pub fn definition(&self, id: Uuid) -> Option<Arc<CartridgeDefinition>> {
        self.definitions.get(&id).map(|d| d.clone())
    }

    // ── instances ──────────────────────────────────────────────────────

    pub fn insert_instance(&self, instance: CartridgeInstance) {
        self.by_lead
            .entry((instance.tenant_id.clone(), instance.lead_id.clone()))
            .or_default()
            .push(instance.id);
        self.instances.insert(instance.id, instance);
    }

    pub fn instance(&self, id: Uuid) -> Option<CartridgeInstance> {
        self.instances.get(&id).map(|i| i.clone())
    }

    pub fn instances_for_lead(&self, tenant_id: &str, lead_id: &str) -> Vec<CartridgeInstance> {
        let ids = self
            .by_lead
            .get(&(tenant_id.to_string(), lead_id.to_string()))
            .map(|v| v.clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.instance(*id))
            .collect()
    }

    /// The standing instance for an enrollment key, if one exists that is
    /// not finished by exhaustion/completion. Suppressed instances count:
    /// re-enrolling a suppressed lead must be a no-op, not a fresh start.
    pub fn standing_instance(
        &self,
        tenant_id: &str,
        lead_id: &str,
        definition_id: Uuid,
    ) -> Option<CartridgeInstance> {
        self.instances_for_lead(tenant_id, lead_id)
            .into_iter()
            .find(|i| {
                i.definition_id == definition_id
                    && matches!(
                        i.status,
                        InstanceStatus::Active | InstanceStatus::Paused | InstanceStatus::Suppressed
                    )
            })
    }

    /// Instances due for evaluation, ordered by eligibility time.
    pub fn list_due(&self, limit: usize) -> Vec<CartridgeInstance> {
        let now = Utc::now();
        let mut due: Vec<CartridgeInstance> = self
            .instances
            .iter()
            .filter(|e| e.value().is_due(now))
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|i| i.next_eligible_at);
        due.truncate(limit);
        due
    }

    /// Apply a mutation under the instance's entry lock, guarded by the
    /// optimistic revision check. The closure sees the live record; the
    /// revision bump and `updated_at` stamp are handled here.
    pub fn update_guarded(
        &self,
        id: Uuid,
        expected_revision: u64,
        f: impl FnOnce(&mut CartridgeInstance),
    ) -> EngineResult<CartridgeInstance> {
        let mut entry = self.instances.get_mut(&id).ok_or(EngineError::NotFound {
            entity: "instance",
            id: id.to_string(),
        })?;

        if entry.revision != expected_revision {
            return Err(EngineError::Persistence {
                reason: format!(
                    "revision conflict on instance {id}: expected {expected_revision}, found {}",
                    entry.revision
                ),
            });
        }

        f(&mut entry);
        entry.revision += 1;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Record a send attempt and its instance mutation as one guarded
    /// write. Refused outright for suppressed instances: suppression is
    /// enforced here at the data layer, not only in the executor.
    pub fn commit_attempt(
        &self,
        id: Uuid,
        expected_revision: u64,
        attempt: SendAttempt,
        f: impl FnOnce(&mut CartridgeInstance),
    ) -> EngineResult<SendAttempt> {
        let mut entry = self.instances.get_mut(&id).ok_or(EngineError::NotFound {
            entity: "instance",
            id: id.to_string(),
        })?;

        if entry.status == InstanceStatus::Suppressed || self.verdicts.is_suppressed(id) {
            return Err(EngineError::Persistence {
                reason: format!("instance {id} is suppressed; attempt refused"),
            });
        }

        if entry.revision != expected_revision {
            return Err(EngineError::Persistence {
                reason: format!(
                    "revision conflict on instance {id}: expected {expected_revision}, found {}",
                    entry.revision
                ),
            });
        }

        f(&mut entry);
        entry.revision += 1;
        entry.updated_at = Utc::now();
        drop(entry);

        self.attempts.entry(id).or_default().push(attempt.clone());
        metrics::counter!("engine.attempts_recorded").increment(1);
        Ok(attempt)
    }

    pub fn attempts_for(&self, instance_id: Uuid) -> Vec<SendAttempt> {
        self.attempts
            .get(&instance_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    // ── classifications ────────────────────────────────────────────────

    pub fn record_classification(&self, result: ClassificationResult) {
        self.classifications
            .entry(result.lead_id.clone())
            .or_default()
            .push(result);
    }

    pub fn classifications_for(&self, lead_id: &str) -> Vec<ClassificationResult> {
        self.classifications
            .get(lead_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    // ── retention ──────────────────────────────────────────────────────

    /// Archive finished instances past the retention window. Returns the
    /// number of instances removed.
    pub fn sweep_retention(&self, retention_days: u32) -> usize {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let expired: Vec<CartridgeInstance> = self
            .instances
            .iter()
            .filter(|e| e.value().status.is_terminal() && e.value().updated_at < cutoff)
            .map(|e| e.value().clone())
            .collect();

        for inst in &expired {
            self.instances.remove(&inst.id);
            self.attempts.remove(&inst.id);
            if let Some(mut ids) = self
                .by_lead
                .get_mut(&(inst.tenant_id.clone(), inst.lead_id.clone()))
            {
                ids.retain(|id| *id != inst.id);
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "finished instances archived");
        }
        expired.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}
