//! Multi-tenancy: tenant registry, per-tenant daily send caps, and usage
//! tracking for the scheduler's throughput enforcement.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Tenant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Per-tenant send limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Outbound dispatches allowed per UTC day.
    pub daily_send_cap: u64,
}

/// Real-time usage counters for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantUsage {
    pub sends_today: u64,
    pub replies_today: u64,
    pub last_reset: DateTime<Utc>,
}

/// A single tenant known to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub status: TenantStatus,
    pub settings: TenantSettings,
    pub usage: TenantUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Multi-tenant registry backed by DashMap.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    default_daily_send_cap: u64,
}

impl TenantManager {
    pub fn new(default_daily_send_cap: u64) -> Self {
        Self {
            tenants: DashMap::new(),
            default_daily_send_cap,
        }
    }

    /// Register a tenant with the default daily cap.
    pub fn create_tenant(&self, id: &str, name: &str) -> Tenant {
        let now = Utc::now();
        let tenant = Tenant {
            id: id.to_string(),
            name: name.to_string(),
            status: TenantStatus::Active,
            settings: TenantSettings {
                daily_send_cap: self.default_daily_send_cap,
            },
            usage: TenantUsage {
                sends_today: 0,
                replies_today: 0,
                last_reset: now,
            },
            created_at: now,
            updated_at: now,
        };

        info!(tenant_id = %tenant.id, tenant_name = %tenant.name, "Tenant created");
        self.tenants.insert(tenant.id.clone(), tenant.clone());
        tenant
    }

    pub fn get_tenant(&self, id: &str) -> Option<Tenant> {
        self.tenants.get(id).map(|e| e.value().clone())
    }

    pub fn list_tenants(&self) -> Vec<Tenant> {
        self.tenants.iter().map(|e| e.value().clone()).collect()
    }

    pub fn set_daily_cap(&self, id: &str, cap: u64) -> Option<Tenant> {
        if let Some(mut entry) = self.tenants.get_mut(id) {
            entry.settings.daily_send_cap = cap;
            entry.updated_at = Utc::now();
            info!(tenant_id = %id, cap, "Daily send cap updated");
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn suspend_tenant(&self, id: &str) -> Option<Tenant> {
        if let Some(mut entry) = self.tenants.get_mut(id) {
            entry.status = TenantStatus::Suspended;
            entry.updated_at = Utc::now();
            info!(tenant_id = %id, "Tenant suspended");
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn reactivate_tenant(&self, id: &str) -> Option<Tenant> {
        if let Some(mut entry) = self.tenants.get_mut(id) {
            entry.status = TenantStatus::Active;
            entry.updated_at = Utc::now();
            info!(tenant_id = %id, "Tenant reactivated");
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Consume one unit of the tenant's daily send budget. Check and
    /// increment happen under a single map-entry lock so two concurrent
    /// dispatches cannot both squeeze through the last slot. Rolls the
    /// window when the UTC day has changed since the last reset.
    ///
    /// Returns false when the tenant is unknown, suspended, or capped.
    pub fn try_consume_send(&self, tenant_id: &str) -> bool {
        let mut entry = match self.tenants.get_mut(tenant_id) {
            Some(e) => e,
            None => return false,
        };

        if entry.status != TenantStatus::Active {
            return false;
        }

        let now = Utc::now();
        if now.date_naive() != entry.usage.last_reset.date_naive() {
            entry.usage.sends_today = 0;
            entry.usage.replies_today = 0;
            entry.usage.last_reset = now;
        }

        if entry.usage.sends_today >= entry.settings.daily_send_cap {
            metrics::counter!("tenancy.daily_cap_hits").increment(1);
            return false;
        }

        entry.usage.sends_today += 1;
        entry.updated_at = now;
        true
    }

    pub fn record_reply(&self, tenant_id: &str) {
        if let Some(mut entry) = self.tenants.get_mut(tenant_id) {
            entry.usage.replies_today += 1;
            entry.updated_at = Utc::now();
        }
    }

    /// Reset daily usage counters for a tenant (operator action).
    pub fn reset_daily_counters(&self, id: &str) -> Option<()> {
        if let Some(mut entry) = self.tenants.get_mut(id) {
            entry.usage.sends_today = 0;
            entry.usage.replies_today = 0;
            entry.usage.last_reset = Utc::now();
            entry.updated_at = Utc::now();
            info!(tenant_id = %id, "Daily usage counters reset");
            Some(())
        } else {
            None
        }
    }
}
