//! Control-channel protocol for the certrelay agent.
//!
//! This crate defines the wire types exchanged between the agent and its
//! remote controller, plus the per-domain certificate lifecycle record that
//! both the challenge poller and the issuance supervisor mutate through the
//! shared cache store.
//!
//! # Wire format
//!
//! One self-describing JSON text message per logical event:
//!
//! - Inbound commands: `{"action":"add_domain","content":{"domain":"example.com","cache_ttl":660}}`
//! - Outbound status reports: `{"type":"client.forward.message","ftype":"acme_pending","content":{...},"error":[]}`
//! - Outbound heartbeats: `{"type":"heartbeat","content":{"is_online":true}}`

mod errors;
mod messages;
mod record;

pub use errors::ProtocolError;
pub use messages::{
    AddDomainPayload, HeartbeatPayload, InboundMessage, OutboundEvent, ReportKind,
    ACTION_ADD_DOMAIN,
};
pub use record::{DomainRecord, DomainReport, Status};
