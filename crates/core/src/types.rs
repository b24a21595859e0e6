use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical labels applied to leads from inbound message classification.
/// The set is closed; classification of identical text always yields the
/// same labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalLabel {
    OptedOut,
    DoNotContact,
    WantsCall,
    NeedsHelp,
    HighIntent,
    MeetingBooked,
    QuestionAsked,
    EmailCaptured,
    MobileCaptured,
    Responded,
    Noise,
}

impl CanonicalLabel {
    /// Hard stops end all outreach for the lead and must reach the
    /// compliance authority on the reply-ingestion transaction itself.
    pub fn is_hard_stop(&self) -> bool {
        matches!(self, CanonicalLabel::OptedOut | CanonicalLabel::DoNotContact)
    }

    /// Terminal-positive outcomes complete the instance, bypassing the
    /// remaining stages.
    pub fn is_terminal_positive(&self) -> bool {
        matches!(self, CanonicalLabel::MeetingBooked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalLabel::OptedOut => "opted_out",
            CanonicalLabel::DoNotContact => "do_not_contact",
            CanonicalLabel::WantsCall => "wants_call",
            CanonicalLabel::NeedsHelp => "needs_help",
            CanonicalLabel::HighIntent => "high_intent",
            CanonicalLabel::MeetingBooked => "meeting_booked",
            CanonicalLabel::QuestionAsked => "question_asked",
            CanonicalLabel::EmailCaptured => "email_captured",
            CanonicalLabel::MobileCaptured => "mobile_captured",
            CanonicalLabel::Responded => "responded",
            CanonicalLabel::Noise => "noise",
        }
    }
}

impl std::fmt::Display for CanonicalLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read view of a lead held by the external CRUD layer. The engine reads
/// leads and appends labels; it never mutates anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub tenant_id: String,
    pub phone: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Tenant-scoped operator actions routed through the shared job queue.
/// Engine-wide controls (start/stop/update-config) are direct methods on
/// the loop driver and never travel as jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum OperatorAction {
    PauseInstance { instance_id: Uuid },
    ResumeInstance { instance_id: Uuid },
    ForceRunNow { instance_id: Uuid },
    ResetDailyCounters,
    ReenableIdentity { identity_id: Uuid },
}

/// A unit of work on the shared, cross-tenant queue. Every variant carries
/// a mandatory tenant id validated by the job guard before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EngineJob {
    ScheduleTick {
        tenant_id: String,
        instance_id: Uuid,
        /// Set by force-run; bypasses `next_eligible_at`, nothing else.
        #[serde(default)]
        forced: bool,
    },
    InboundReply {
        tenant_id: String,
        lead_id: String,
        message_id: Uuid,
        from_number: String,
        body: String,
    },
    OperatorCommand {
        tenant_id: String,
        issued_by: String,
        action: OperatorAction,
    },
}

impl EngineJob {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineJob::ScheduleTick { .. } => "schedule_tick",
            EngineJob::InboundReply { .. } => "inbound_reply",
            EngineJob::OperatorCommand { .. } => "operator_command",
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            EngineJob::ScheduleTick { tenant_id, .. }
            | EngineJob::InboundReply { tenant_id, .. }
            | EngineJob::OperatorCommand { tenant_id, .. } => tenant_id,
        }
    }

    /// Identifier safe to log alongside a rejection. Never message content.
    pub fn log_id(&self) -> String {
        match self {
            EngineJob::ScheduleTick { instance_id, .. } => instance_id.to_string(),
            EngineJob::InboundReply { message_id, .. } => message_id.to_string(),
            EngineJob::OperatorCommand { issued_by, .. } => issued_by.clone(),
        }
    }
}
