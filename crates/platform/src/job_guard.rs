//! Tenant job guard — mandatory tenant validation in front of every entry
//! point. The underlying job substrate is a shared, cross-tenant queue, so
//! nothing reaches business logic without passing through here.

use cartridge_core::error::EngineError;
use cartridge_core::types::EngineJob;
use tracing::warn;

/// A job that has passed tenant validation. Constructed only by the guard.
#[derive(Debug, Clone)]
pub struct ValidJob {
    job: EngineJob,
}

impl ValidJob {
    pub fn tenant_id(&self) -> &str {
        self.job.tenant_id()
    }

    pub fn job(&self) -> &EngineJob {
        &self.job
    }

    pub fn into_job(self) -> EngineJob {
        self.job
    }
}

/// Stateless validator. Performs no mutation, so it composes in front of
/// scheduler dispatch, inbound webhook processing, and manual force-runs
/// alike.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantJobGuard;

const MAX_TENANT_ID_LEN: usize = 64;

impl TenantJobGuard {
    pub fn new() -> Self {
        Self
    }

    /// Validate the job's tenant id. Rejections log job kind and id, never
    /// payload content.
    pub fn guard(&self, job: EngineJob) -> Result<ValidJob, EngineError> {
        let tenant_id = job.tenant_id();

        let detail = if tenant_id.is_empty() {
            Some("missing tenant id")
        } else if tenant_id.len() > MAX_TENANT_ID_LEN {
            Some("tenant id too long")
        } else if !tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            Some("tenant id contains invalid characters")
        } else {
            None
        };

        if let Some(detail) = detail {
            warn!(
                job_kind = job.kind(),
                job_id = %job.log_id(),
                detail,
                "job rejected by tenant guard"
            );
            metrics::counter!("guard.rejected").increment(1);
            return Err(EngineError::TenantIsolation {
                job_kind: job.kind().to_string(),
                detail: detail.to_string(),
            });
        }

        Ok(ValidJob { job })
    }
}
