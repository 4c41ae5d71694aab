//! Inbound command dispatcher.
//!
//! Single consumer of the inbound queue, processing commands strictly in
//! arrival order. Command tags map to handlers through one explicit match;
//! unrecognized tags fall through to a log-and-ignore case and malformed
//! payloads never stop the loop.

use std::sync::Arc;

use tracing::{debug, info, warn};

use certrelay_protocol::{
    AddDomainPayload, DomainRecord, InboundMessage, ACTION_ADD_DOMAIN,
};
use tokio::sync::mpsc;

use crate::context::AgentContext;
use crate::issuer::IssuanceSupervisor;
use crate::poller::ChallengePoller;
use crate::store::StoreError;

/// Consumes inbound commands and creates per-domain workflows.
pub struct Dispatcher {
    ctx: Arc<AgentContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Run until the shutdown token is set or the queue closes.
    pub async fn run(self, mut inbound_rx: mpsc::UnboundedReceiver<InboundMessage>) {
        let shutdown = self.ctx.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = inbound_rx.recv() => match message {
                    Some(message) => self.dispatch(message).await,
                    None => break,
                },
            }
        }
        info!("Dispatcher shutting down");
    }

    /// Handle one command. Failures are logged and isolated: a bad message
    /// never takes the loop down, and a workflow fault never reaches its
    /// neighbors.
    async fn dispatch(&self, message: InboundMessage) {
        match message.action.as_str() {
            ACTION_ADD_DOMAIN => {
                let payload = match AddDomainPayload::from_content(message.content) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed add_domain payload");
                        return;
                    }
                };
                if let Err(e) = self.add_domain(payload).await {
                    warn!(error = %e, "Failed to start domain workflow");
                }
            }
            other => {
                debug!(action = %other, "Ignoring unrecognized action");
            }
        }
    }

    /// Get-or-create the domain record; spawn the workflow pair only for a
    /// newly created record, so duplicate commands are idempotent.
    async fn add_domain(&self, payload: AddDomainPayload) -> Result<(), StoreError> {
        let domain = payload.domain.trim().to_string();
        if domain.is_empty() {
            warn!("Ignoring add_domain with empty domain");
            return Ok(());
        }

        let (record, created) = self.get_or_create(&domain, payload.cache_ttl).await?;
        if !created {
            debug!(domain = %domain, status = ?record.status, "Domain workflow already in flight");
            return Ok(());
        }

        info!(domain = %domain, cache_ttl = record.cache_time_out, "Starting domain workflow");

        let poller = ChallengePoller::new(self.ctx.clone(), domain.clone());
        let issuer = IssuanceSupervisor::new(self.ctx.clone(), domain.clone());
        let handles = vec![
            tokio::spawn(issuer.run()),
            tokio::spawn(poller.run()),
        ];
        self.ctx.workflows.register(&domain, handles);
        Ok(())
    }

    async fn get_or_create(
        &self,
        domain: &str,
        cache_ttl: Option<u64>,
    ) -> Result<(DomainRecord, bool), StoreError> {
        match self.ctx.fetch_record(domain).await {
            Ok(record) => Ok((record, false)),
            Err(StoreError::NotFound { .. }) => {
                let mut record = DomainRecord::new(domain);
                record.continue_time_out = self.ctx.config.acme.continue_timeout_secs;
                record.cache_time_out =
                    cache_ttl.unwrap_or(self.ctx.config.acme.cache_timeout_secs);
                self.ctx.persist_record(&record).await?;
                Ok((record, true))
            }
            Err(e) => Err(e),
        }
    }
}
