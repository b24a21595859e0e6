//! Transport service interface — the engine never talks to carrier APIs
//! directly. A send goes out through a `Transport` implementation and comes
//! back as an accept/reject receipt with a provider message id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{redact_phone, EngineError, EngineResult};

/// Outcome of a transport send. A rejection is a normal receipt (counted
/// against the sending identity), not an error; errors are reserved for
/// transport-level failures like timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportReceipt {
    pub accepted: bool,
    pub provider_message_id: Option<String>,
    /// Normalized reason on rejection. Raw provider payloads stay inside
    /// the transport implementation.
    pub reason: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, identity: &str, to: &str, body: &str) -> EngineResult<TransportReceipt>;
}

/// Record of one simulated outbound message, kept for assertions.
#[derive(Debug, Clone)]
pub struct SimSentMessage {
    pub identity: String,
    pub to: String,
    pub body: String,
    pub provider_message_id: String,
    pub sent_at: DateTime<Utc>,
}

/// In-memory transport with scriptable failure injection. Used by tests
/// and local runs; production deployments plug a real provider behind the
/// same trait.
#[derive(Default)]
pub struct SimTransport {
    sent: DashMap<String, Vec<SimSentMessage>>,
    /// Destination numbers that the simulated carrier rejects.
    rejected_numbers: DashMap<String, String>,
    /// Sending identities that the simulated carrier rejects outright.
    rejected_identities: DashMap<String, String>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `number` come back rejected with `reason`.
    pub fn reject_number(&self, number: &str, reason: &str) {
        self.rejected_numbers
            .insert(number.to_string(), reason.to_string());
    }

    /// Make every send from `identity` come back rejected with `reason`.
    pub fn reject_identity(&self, identity: &str, reason: &str) {
        self.rejected_identities
            .insert(identity.to_string(), reason.to_string());
    }

    pub fn clear_rejections(&self) {
        self.rejected_numbers.clear();
        self.rejected_identities.clear();
    }

    /// All messages accepted for a destination number.
    pub fn sent_to(&self, number: &str) -> Vec<SimSentMessage> {
        self.sent.get(number).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn total_sent(&self) -> usize {
        self.sent.iter().map(|e| e.value().len()).sum()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn send(&self, identity: &str, to: &str, body: &str) -> EngineResult<TransportReceipt> {
        if identity.is_empty() || to.is_empty() {
            return Err(EngineError::Transport {
                reason: "missing identity or destination".into(),
            });
        }

        if let Some(reason) = self.rejected_identities.get(identity) {
            tracing::debug!(identity = %redact_phone(identity), "simulated carrier rejected identity");
            metrics::counter!("transport.rejected").increment(1);
            return Ok(TransportReceipt {
                accepted: false,
                provider_message_id: None,
                reason: Some(reason.clone()),
            });
        }

        if let Some(reason) = self.rejected_numbers.get(to) {
            tracing::debug!(to = %redact_phone(to), "simulated carrier rejected destination");
            metrics::counter!("transport.rejected").increment(1);
            return Ok(TransportReceipt {
                accepted: false,
                provider_message_id: None,
                reason: Some(reason.clone()),
            });
        }

        let provider_message_id = format!("SM{}", Uuid::new_v4().to_string().replace('-', ""));
        self.sent.entry(to.to_string()).or_default().push(SimSentMessage {
            identity: identity.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            provider_message_id: provider_message_id.clone(),
            sent_at: Utc::now(),
        });

        metrics::counter!("transport.accepted").increment(1);

        Ok(TransportReceipt {
            accepted: true,
            provider_message_id: Some(provider_message_id),
            reason: None,
        })
    }
}
