use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy for the cartridge execution engine.
///
/// Errors raised below the executor (identity pool, transport) are converted
/// into state transitions or retries and never reach the scheduler; only
/// `TenantIsolation` and `Persistence` are fatal to a tick.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Job arrived without a usable tenant id. The job is discarded; the
    /// payload is never included in the message.
    #[error("tenant isolation violation in {job_kind} job: {detail}")]
    TenantIsolation { job_kind: String, detail: String },

    /// Every identity in the tenant's pool is disabled or the pool is empty.
    /// Transient: the tick is retried on the next cycle.
    #[error("no sending identity available for tenant {tenant_id}")]
    NoIdentityAvailable { tenant_id: String },

    /// The compliance service did not answer within its deadline. Always
    /// resolved to a suppress verdict, never to approval.
    #[error("compliance recheck timed out for instance {instance_id}")]
    ComplianceTimeout { instance_id: uuid::Uuid },

    /// Carrier-level send failure with a normalized reason. Retryable up to
    /// the stage's attempt cap.
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("persistence failure: {reason}")]
    Persistence { reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid instance transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Transient errors resolve on a later tick without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::NoIdentityAvailable { .. } | EngineError::Transport { .. }
        )
    }
}

/// Redact a phone number down to its last four digits for logging.
/// Full numbers never appear in logs or error messages.
pub fn redact_phone(number: &str) -> String {
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        "****".to_string()
    } else {
        format!("***{}", &digits[digits.len() - 4..])
    }
}
