//! Inbound command and outbound event message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::record::{DomainRecord, DomainReport, Status};

/// Action tag for the certificate-request command.
pub const ACTION_ADD_DOMAIN: &str = "add_domain";

/// A raw inbound command from the controller.
///
/// The action tag is kept as a string and matched explicitly by the
/// dispatcher; unrecognized tags fall through to a log-and-ignore case
/// instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Command tag, e.g. `"add_domain"`.
    pub action: String,
    /// Action-specific payload, decoded lazily by the handler.
    #[serde(default)]
    pub content: Value,
}

impl InboundMessage {
    /// Decode one inbound text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }
}

/// Payload of the `add_domain` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddDomainPayload {
    /// Domain to obtain a certificate for. Trimmed before use.
    pub domain: String,
    /// Cache expiry override in seconds for the workflow record.
    #[serde(default)]
    pub cache_ttl: Option<u64>,
}

impl AddDomainPayload {
    /// Decode the payload from a raw inbound message's content.
    pub fn from_content(content: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(content).map_err(|e| ProtocolError::InvalidPayload {
            action: ACTION_ADD_DOMAIN.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Status-report kind carried in the `ftype` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    AcmePending,
    AcmeSuccess,
    AcmeFailed,
}

impl From<Status> for ReportKind {
    fn from(status: Status) -> Self {
        match status {
            Status::Pending => ReportKind::AcmePending,
            Status::Success => ReportKind::AcmeSuccess,
            Status::Failed => ReportKind::AcmeFailed,
        }
    }
}

/// Heartbeat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub is_online: bool,
}

/// An event queued for delivery to the controller.
///
/// Status reports from independent per-domain workflows and heartbeats
/// interleave in non-deterministic order; the controller keys reports by the
/// embedded domain name, not by arrival sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    /// Progress or terminal report for one domain workflow.
    #[serde(rename = "client.forward.message")]
    StatusReport {
        ftype: ReportKind,
        content: DomainReport,
        #[serde(default)]
        error: Vec<String>,
    },
    /// Periodic liveness signal.
    #[serde(rename = "heartbeat")]
    Heartbeat { content: HeartbeatPayload },
}

impl OutboundEvent {
    /// Build a status report whose kind follows the record's current status.
    pub fn status_report(record: &DomainRecord) -> Self {
        OutboundEvent::StatusReport {
            ftype: record.status.into(),
            content: record.report(),
            error: Vec::new(),
        }
    }

    /// Build the per-iteration progress report.
    ///
    /// Always labeled `acme_pending`: the terminal outcome gets its own,
    /// separately labeled report when the workflow exits.
    pub fn pending_report(record: &DomainRecord) -> Self {
        OutboundEvent::StatusReport {
            ftype: ReportKind::AcmePending,
            content: record.report(),
            error: Vec::new(),
        }
    }

    /// Build a liveness heartbeat.
    pub fn heartbeat() -> Self {
        OutboundEvent::Heartbeat {
            content: HeartbeatPayload { is_online: true },
        }
    }

    /// Encode this event as one wire text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}
