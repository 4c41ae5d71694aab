//! Certrelay agent core.
//!
//! A remote-controlled host agent that automates TLS certificate issuance
//! via DNS-01 challenges and reports progress over a persistent control
//! channel.
//!
//! # Architecture
//!
//! - [`store`] — TTL-keyed cache store shared by all concurrent tasks; the
//!   single source of truth for in-flight domain workflows.
//! - [`gateway`] — maintains one logical websocket connection to the
//!   controller, with an inbound delivery queue and an outbound send queue.
//! - [`dispatcher`] — consumes the inbound queue and creates per-domain
//!   workflows.
//! - [`poller`] — per-domain DNS propagation polling.
//! - [`issuer`] — per-domain issuance subprocess supervision.
//! - [`heartbeat`] — periodic liveness signal.
//!
//! Data flow: controller → gateway inbound queue → dispatcher → spawns
//! {poller, issuer} per new domain → both mutate the shared record through
//! the cache store and push status events to the outbound queue → gateway
//! delivers them to the controller.

pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod gateway;
pub mod heartbeat;
pub mod issuer;
pub mod poller;
pub mod store;
pub mod tasks;

pub use context::AgentContext;
pub use dispatcher::Dispatcher;
pub use errors::GatewayError;
pub use gateway::Gateway;
pub use heartbeat::HeartbeatEmitter;
pub use issuer::IssuanceSupervisor;
pub use poller::ChallengePoller;
pub use store::{CacheStore, MemoryStore, RedisStore, StoreError};
pub use tasks::WorkflowRegistry;
