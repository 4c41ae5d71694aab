//! Shared agent context.
//!
//! One explicit context object is constructed at startup and passed to every
//! component; there is no ambient global state. It bundles the
//! configuration, the shared cache store, the sending halves of the two
//! in-process queues, the process-wide shutdown token, and the per-domain
//! workflow registry.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use certrelay_config::AgentConfig;
use certrelay_protocol::{DomainRecord, InboundMessage, OutboundEvent};

use crate::store::{CacheStore, StoreError};
use crate::tasks::WorkflowRegistry;

/// Receiving halves of the two in-process queues.
///
/// Handed to their single consumers at wiring time: the dispatcher owns the
/// inbound receiver, the gateway send loop owns the outbound receiver.
pub struct QueueReceivers {
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
    pub outbound: mpsc::UnboundedReceiver<OutboundEvent>,
}

/// Shared state for all agent tasks.
pub struct AgentContext {
    /// Agent configuration.
    pub config: Arc<AgentConfig>,
    /// Shared TTL-keyed cache store.
    pub cache: Arc<dyn CacheStore>,
    /// Process-wide shutdown signal.
    pub shutdown: CancellationToken,
    /// Per-domain workflow handles, joined on shutdown.
    pub workflows: WorkflowRegistry,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl AgentContext {
    /// Build the context and the receiving halves of its queues.
    pub fn new(config: AgentConfig, cache: Arc<dyn CacheStore>) -> (Arc<Self>, QueueReceivers) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let context = Arc::new(Self {
            config: Arc::new(config),
            cache,
            shutdown: CancellationToken::new(),
            workflows: WorkflowRegistry::new(),
            inbound_tx,
            outbound_tx,
        });

        (
            context,
            QueueReceivers {
                inbound: inbound_rx,
                outbound: outbound_rx,
            },
        )
    }

    /// Enqueue a decoded inbound command for the dispatcher.
    pub fn deliver(&self, message: InboundMessage) {
        if self.inbound_tx.send(message).is_err() {
            warn!("Inbound queue closed, dropping command");
        }
    }

    /// Queue an event for delivery to the controller.
    ///
    /// Enqueue failure means the process is shutting down; it is logged and
    /// never treated as fatal by the caller.
    pub fn publish(&self, event: OutboundEvent) {
        if self.outbound_tx.send(event).is_err() {
            warn!("Outbound queue closed, dropping event");
        }
    }

    /// Fetch the authoritative record for `domain` from the cache store.
    pub async fn fetch_record(&self, domain: &str) -> Result<DomainRecord, StoreError> {
        let bytes = self.cache.get(domain).await?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Write a record back under its domain key with its own cache expiry.
    pub async fn persist_record(&self, record: &DomainRecord) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.cache
            .set(&record.domain, bytes, record.cache_time_out)
            .await
    }

    /// Remove a domain's record once its terminal status has been reported.
    pub async fn delete_record(&self, domain: &str) -> Result<(), StoreError> {
        self.cache.delete(domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use certrelay_protocol::Status;

    fn context() -> (Arc<AgentContext>, QueueReceivers) {
        AgentContext::new(AgentConfig::default(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_record_persist_fetch_round_trip() {
        let (ctx, _rx) = context();

        let mut record = DomainRecord::new("example.com");
        record.set_token("abc");
        ctx.persist_record(&record).await.unwrap();

        let fetched = ctx.fetch_record("example.com").await.unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_fetch_missing_record_is_not_found() {
        let (ctx, _rx) = context();
        assert!(matches!(
            ctx.fetch_record("absent.com").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_record() {
        let (ctx, _rx) = context();
        let record = DomainRecord::new("example.com");
        ctx.persist_record(&record).await.unwrap();
        ctx.delete_record("example.com").await.unwrap();
        assert!(ctx.fetch_record("example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_outbound_queue() {
        let (ctx, mut rx) = context();
        let mut record = DomainRecord::new("example.com");
        record.transition(Status::Success);
        ctx.publish(OutboundEvent::status_report(&record));

        let event = rx.outbound.recv().await.unwrap();
        assert!(matches!(event, OutboundEvent::StatusReport { .. }));
    }

    #[tokio::test]
    async fn test_publish_after_receiver_drop_is_not_fatal() {
        let (ctx, rx) = context();
        drop(rx);
        ctx.publish(OutboundEvent::heartbeat());
    }
}
