//! Periodic liveness signal.

use std::sync::Arc;

use tracing::{debug, info};

use certrelay_protocol::OutboundEvent;

use crate::context::AgentContext;

/// Pushes a heartbeat event onto the outbound queue at a fixed cadence
/// until cancelled. Enqueue failures are logged by the queue and never
/// fatal.
pub struct HeartbeatEmitter {
    ctx: Arc<AgentContext>,
}

impl HeartbeatEmitter {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        let interval = self.ctx.config.heartbeat.interval();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            debug!("Emitting heartbeat");
            self.ctx.publish(OutboundEvent::heartbeat());
        }

        info!("Heartbeat emitter shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use certrelay_config::AgentConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_heartbeats_emitted_on_cadence() {
        let mut config = AgentConfig::default();
        config.heartbeat.interval_secs = 1;
        let (ctx, mut rx) = AgentContext::new(config, Arc::new(MemoryStore::new()));

        let emitter = HeartbeatEmitter::new(ctx.clone());
        let handle = tokio::spawn(emitter.run());

        // Three intervals and a bit of jitter headroom: expect exactly 3.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        ctx.shutdown.cancel();
        handle.await.unwrap();

        let mut count = 0;
        while let Ok(event) = rx.outbound.try_recv() {
            assert!(matches!(event, OutboundEvent::Heartbeat { .. }));
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_emitter() {
        let (ctx, _rx) = AgentContext::new(AgentConfig::default(), Arc::new(MemoryStore::new()));
        let emitter = HeartbeatEmitter::new(ctx.clone());
        let handle = tokio::spawn(emitter.run());

        ctx.shutdown.cancel();
        handle.await.unwrap();
    }
}
