use serde::Deserialize;

/// Root engine configuration. Loaded from environment variables with the
/// prefix `OUTREACH_ENGINE__` (double-underscore section separator).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Backoff applied to `next_eligible_at` when a tick fails transiently
    /// (no identity available, transport timeout).
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenancyConfig {
    /// Outbound messages a tenant may dispatch per UTC day unless overridden.
    #[serde(default = "default_daily_send_cap")]
    pub default_daily_send_cap: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Identity-attributable failures within the window before auto-disable.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComplianceConfig {
    /// Hard deadline on the recheck call. A miss resolves to suppress.
    #[serde(default = "default_compliance_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Finished instances older than this are swept by the retention pass.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Pattern lists for the response classifier. All detection is driven by
/// this table; an empty list disables that label entirely.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_opt_out_patterns")]
    pub opt_out_patterns: Vec<String>,
    #[serde(default = "default_do_not_contact_patterns")]
    pub do_not_contact_patterns: Vec<String>,
    #[serde(default = "default_wants_call_patterns")]
    pub wants_call_patterns: Vec<String>,
    #[serde(default = "default_needs_help_patterns")]
    pub needs_help_patterns: Vec<String>,
    #[serde(default = "default_high_intent_patterns")]
    pub high_intent_patterns: Vec<String>,
    #[serde(default = "default_meeting_booked_patterns")]
    pub meeting_booked_patterns: Vec<String>,
    #[serde(default = "default_noise_patterns")]
    pub noise_patterns: Vec<String>,
}

// Default functions
fn default_node_id() -> String {
    "engine-01".to_string()
}
fn default_interval_ms() -> u64 {
    5_000
}
fn default_batch_size() -> usize {
    50
}
fn default_worker_count() -> usize {
    8
}
fn default_retry_backoff_secs() -> u64 {
    300
}
fn default_daily_send_cap() -> u64 {
    1_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_secs() -> u64 {
    3_600
}
fn default_compliance_timeout_ms() -> u64 {
    2_000
}
fn default_transport_timeout_ms() -> u64 {
    10_000
}
fn default_retention_days() -> u32 {
    90
}

fn default_opt_out_patterns() -> Vec<String> {
    vec![
        r"\bSTOP\b".into(),
        r"\bUNSUBSCRIBE\b".into(),
        r"\bCANCEL\b".into(),
        r"\bEND\b".into(),
        r"\bQUIT\b".into(),
        r"\bOPT[\s-]?OUT\b".into(),
        r"\bREMOVE\s+ME\b".into(),
    ]
}
fn default_do_not_contact_patterns() -> Vec<String> {
    vec![
        r"\bWRONG\s+(NUMBER|PERSON)\b".into(),
        r"\bDON'?T\s+TEXT\b".into(),
        r"\bSTOP\s+TEXTING\b".into(),
        r"\bNOT\s+INTERESTED\b".into(),
        r"\bLEAVE\s+ME\s+ALONE\b".into(),
        r"\bWHO\s+IS\s+THIS\b".into(),
    ]
}
fn default_wants_call_patterns() -> Vec<String> {
    vec![
        r"\bCALL\s+ME\b".into(),
        r"\bGIVE\s+ME\s+A\s+CALL\b".into(),
        r"\bRING\s+ME\b".into(),
        r"\bPLEASE\s+CALL\b".into(),
        r"\bCAN\s+YOU\s+CALL\b".into(),
    ]
}
fn default_needs_help_patterns() -> Vec<String> {
    vec![
        r"\bCAN\s+YOU\s+HELP\b".into(),
        r"\bNEED\s+(SOME\s+)?HELP\b".into(),
        r"\bASSISTANCE\b".into(),
    ]
}
fn default_high_intent_patterns() -> Vec<String> {
    vec![
        r"\bINTERESTED\b".into(),
        r"\bTELL\s+ME\s+MORE\b".into(),
        r"\bSEND\s+INFO\b".into(),
        r"\bSIGN\s+ME\s+UP\b".into(),
        r"\bI'?M\s+IN\b".into(),
    ]
}
fn default_meeting_booked_patterns() -> Vec<String> {
    vec![
        r"\bBOOKED\b".into(),
        r"\bSEE\s+YOU\s+(THEN|THERE)\b".into(),
        r"\bCONFIRMED?\s+(THE\s+)?(MEETING|APPOINTMENT|CALL)\b".into(),
    ]
}
fn default_noise_patterns() -> Vec<String> {
    vec![
        r"^[^a-zA-Z0-9]+$".into(),
        r"^.{1,2}$".into(),
        r"^(?i)(LOL|LMAO|OK|K|HMM|UH|UM)$".into(),
    ]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            worker_count: default_worker_count(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            default_daily_send_cap: default_daily_send_cap(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
        }
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_compliance_timeout_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_transport_timeout_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            opt_out_patterns: default_opt_out_patterns(),
            do_not_contact_patterns: default_do_not_contact_patterns(),
            wants_call_patterns: default_wants_call_patterns(),
            needs_help_patterns: default_needs_help_patterns(),
            high_intent_patterns: default_high_intent_patterns(),
            meeting_booked_patterns: default_meeting_booked_patterns(),
            noise_patterns: default_noise_patterns(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            tenancy: TenancyConfig::default(),
            identity: IdentityConfig::default(),
            compliance: ComplianceConfig::default(),
            transport: TransportConfig::default(),
            engine: EngineConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("OUTREACH_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
