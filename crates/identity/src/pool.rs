//! Sending-identity pool — per-tenant phone number rotation with health
//! tracking. Cursor advance and health read happen under one map-entry
//! lock, so two concurrent sends can never draw the same identity out of
//! order or resurrect a disabled one.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use cartridge_core::error::{redact_phone, EngineError, EngineResult};
use cartridge_core::event_bus::{make_event, EngineEventType, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityHealth {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    LeastRecentlyUsed,
}

/// A tenant-scoped sending identity (phone number resource).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingIdentity {
    pub id: Uuid,
    pub tenant_id: String,
    pub phone_number: String,
    pub health: IdentityHealth,
    pub failures_in_window: u32,
    pub window_started_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub sends_total: u64,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disabled_reason: Option<String>,
}

struct TenantPool {
    identities: Vec<SendingIdentity>,
    cursor: usize,
}

/// Pool allocator. Auto-disables identities that cross the failure
/// threshold inside the window; re-enabling is operator-only.
pub struct IdentityPool {
    pools: DashMap<String, TenantPool>,
    failure_threshold: u32,
    failure_window: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl IdentityPool {
    pub fn new(failure_threshold: u32, failure_window_secs: u64) -> Self {
        Self {
            pools: DashMap::new(),
            failure_threshold,
            failure_window: Duration::seconds(failure_window_secs as i64),
            event_sink: cartridge_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for identity health alerts.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Register a new identity for a tenant. Returns the created record.
    pub fn add_identity(&self, tenant_id: &str, phone_number: &str) -> SendingIdentity {
        let identity = SendingIdentity {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            phone_number: phone_number.to_string(),
            health: IdentityHealth::Active,
            failures_in_window: 0,
            window_started_at: Utc::now(),
            last_used_at: None,
            sends_total: 0,
            disabled_at: None,
            disabled_reason: None,
        };

        info!(
            tenant_id,
            identity_id = %identity.id,
            number = %redact_phone(phone_number),
            "sending identity registered"
        );

        self.pools
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantPool {
                identities: Vec::new(),
                cursor: 0,
            })
            .identities
            .push(identity.clone());

        identity
    }

    /// Draw the next usable identity under the given strategy. Never
    /// returns a disabled identity. The whole selection (health filter,
    /// cursor advance, usage stamp) is one entry mutation.
    pub fn next_identity(
        &self,
        tenant_id: &str,
        strategy: RotationStrategy,
    ) -> EngineResult<SendingIdentity> {
        let mut pool = self
            .pools
            .get_mut(tenant_id)
            .ok_or_else(|| EngineError::NoIdentityAvailable {
                tenant_id: tenant_id.to_string(),
            })?;

        let active_count = pool
            .identities
            .iter()
            .filter(|i| i.health == IdentityHealth::Active)
            .count();
        if active_count == 0 {
            return Err(EngineError::NoIdentityAvailable {
                tenant_id: tenant_id.to_string(),
            });
        }

        let now = Utc::now();
        let idx = match strategy {
            RotationStrategy::RoundRobin => {
                // Walk from the cursor to the next active slot.
                let len = pool.identities.len();
                let start = pool.cursor;
                let mut found = None;
                for offset in 0..len {
                    let i = (start + offset) % len;
                    if pool.identities[i].health == IdentityHealth::Active {
                        found = Some(i);
                        break;
                    }
                }
                let i = found.expect("active identity exists");
                pool.cursor = (i + 1) % len;
                i
            }
            RotationStrategy::LeastRecentlyUsed => pool
                .identities
                .iter()
                .enumerate()
                .filter(|(_, ident)| ident.health == IdentityHealth::Active)
                .min_by_key(|(_, ident)| ident.last_used_at.unwrap_or(DateTime::<Utc>::MIN_UTC))
                .map(|(i, _)| i)
                .expect("active identity exists"),
        };

        let identity = &mut pool.identities[idx];
        identity.last_used_at = Some(now);
        identity.sends_total += 1;
        Ok(identity.clone())
    }

    /// Record an identity-attributable send failure (carrier rejection, not
    /// a business decline). Crossing the threshold within the window
    /// disables the identity and raises an alert.
    pub fn record_failure(&self, tenant_id: &str, identity_id: Uuid, reason: &str) {
        let mut pool = match self.pools.get_mut(tenant_id) {
            Some(p) => p,
            None => return,
        };

        let threshold = self.failure_threshold;
        let window = self.failure_window;
        let identity = match pool.identities.iter_mut().find(|i| i.id == identity_id) {
            Some(i) => i,
            None => return,
        };

        let now = Utc::now();
        if now.signed_duration_since(identity.window_started_at) > window {
            identity.failures_in_window = 0;
            identity.window_started_at = now;
        }
        identity.failures_in_window += 1;

        if identity.health == IdentityHealth::Active && identity.failures_in_window >= threshold {
            identity.health = IdentityHealth::Disabled;
            identity.disabled_at = Some(now);
            identity.disabled_reason = Some(reason.to_string());

            warn!(
                tenant_id,
                identity_id = %identity_id,
                number = %redact_phone(&identity.phone_number),
                failures = identity.failures_in_window,
                reason,
                "sending identity auto-disabled"
            );
            metrics::counter!("identity.auto_disabled").increment(1);
            self.event_sink.emit(make_event(
                EngineEventType::IdentityDisabled,
                tenant_id,
                None,
                Some(reason.to_string()),
            ));
        }
    }

    /// A successful send closes the failure window for the identity.
    pub fn record_success(&self, tenant_id: &str, identity_id: Uuid) {
        if let Some(mut pool) = self.pools.get_mut(tenant_id) {
            if let Some(identity) = pool.identities.iter_mut().find(|i| i.id == identity_id) {
                identity.failures_in_window = 0;
                identity.window_started_at = Utc::now();
            }
        }
    }

    /// Re-enable a disabled identity. Operator action only; the engine
    /// never calls this on its own.
    pub fn reenable(&self, tenant_id: &str, identity_id: Uuid) -> bool {
        let mut pool = match self.pools.get_mut(tenant_id) {
            Some(p) => p,
            None => return false,
        };
        let identity = match pool.identities.iter_mut().find(|i| i.id == identity_id) {
            Some(i) => i,
            None => return false,
        };

        identity.health = IdentityHealth::Active;
        identity.failures_in_window = 0;
        identity.window_started_at = Utc::now();
        identity.disabled_at = None;
        identity.disabled_reason = None;

        info!(tenant_id, identity_id = %identity_id, "sending identity re-enabled");
        self.event_sink.emit(make_event(
            EngineEventType::IdentityReenabled,
            tenant_id,
            None,
            None,
        ));
        true
    }

    pub fn list_identities(&self, tenant_id: &str) -> Vec<SendingIdentity> {
        self.pools
            .get(tenant_id)
            .map(|p| p.identities.clone())
            .unwrap_or_default()
    }

    pub fn active_count(&self, tenant_id: &str) -> usize {
        self.pools
            .get(tenant_id)
            .map(|p| {
                p.identities
                    .iter()
                    .filter(|i| i.health == IdentityHealth::Active)
                    .count()
            })
            .unwrap_or(0)
    }
}
