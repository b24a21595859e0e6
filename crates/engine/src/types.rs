use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One approved message template within a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: String,
    /// Body with `{{field}}` placeholders resolved against the lead at
    /// send time. Unknown placeholders render empty.
    pub body: String,
}

/// One step of a cartridge: its own template set, attempt cap, and
/// inter-attempt delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub templates: Vec<MessageTemplate>,
    pub max_attempts: u32,
    pub min_delay_secs: i64,
    /// When true, exhausting this stage halts the instance even if later
    /// stages exist. The final stage always halts on exhaustion.
    #[serde(default)]
    pub halt_on_exhaust: bool,
}

impl Stage {
    pub fn min_delay(&self) -> Duration {
        Duration::seconds(self.min_delay_secs)
    }
}

/// Immutable, versioned cartridge template. A new version is a new
/// definition record; running instances keep executing the version they
/// were enrolled against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartridgeDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub stages: Vec<Stage>,
    pub created_at: DateTime<Utc>,
}

/// Runtime status of a cartridge instance. Transitions are monotonic
/// except `Paused -> Active`; `Suppressed` is terminal from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Paused,
    Halted,
    Completed,
    Suppressed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Halted | InstanceStatus::Completed | InstanceStatus::Suppressed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Halted => "halted",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Suppressed => "suppressed",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running execution of a cartridge for a single lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartridgeInstance {
    pub id: Uuid,
    pub tenant_id: String,
    pub lead_id: String,
    pub definition_id: Uuid,
    pub version: u32,
    pub current_stage: usize,
    pub attempts_in_stage: u32,
    pub status: InstanceStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Normalized human-readable reason for the last outcome. Raw provider
    /// payloads never land here.
    pub last_outcome: Option<String>,
    pub next_eligible_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every guarded mutation.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CartridgeInstance {
    pub fn new(tenant_id: &str, lead_id: &str, definition: &CartridgeDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            lead_id: lead_id.to_string(),
            definition_id: definition.id,
            version: definition.version,
            current_stage: 0,
            attempts_in_stage: 0,
            status: InstanceStatus::Active,
            last_attempt_at: None,
            last_outcome: None,
            next_eligible_at: now,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == InstanceStatus::Active && self.next_eligible_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    /// Accepted by the transport, delivery confirmation pending. Written
    /// only by transports that confirm asynchronously.
    Queued,
    Sent,
    Failed,
    /// The attempt was blocked before reaching the transport.
    Suppressed,
}

/// Immutable record of one outbound action. Append-only; never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAttempt {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub tenant_id: String,
    pub stage_index: usize,
    /// 1-based ordinal within the stage.
    pub attempt_number: u32,
    pub template_id: String,
    pub identity_id: Option<Uuid>,
    pub result: AttemptResult,
    pub correlation_id: Uuid,
    pub provider_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}
