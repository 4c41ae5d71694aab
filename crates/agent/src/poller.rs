//! DNS challenge confirmation poller.
//!
//! One poller runs per in-flight domain. Each iteration it re-fetches the
//! authoritative record from the cache store (the issuance supervisor may
//! have progressed it concurrently), queries the challenge TXT name, and
//! persists what it learned. Resolver failures are swallowed per iteration:
//! a transient resolver fault must not abort a challenge that would succeed
//! on the next poll. The confirmation deadline bounds worst-case liveness so
//! an unresponsive DNS provider cannot wedge the workflow indefinitely.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, info, trace, warn};

use certrelay_protocol::{DomainRecord, OutboundEvent, Status};

use crate::context::AgentContext;
use crate::store::StoreError;

/// Message recorded when the confirmation deadline elapses.
const TIMEOUT_MESSAGE: &str = "Session and confirmation timeout.";

/// Per-query resolver timeout.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls DNS for challenge-token confirmation for one domain.
pub struct ChallengePoller {
    ctx: Arc<AgentContext>,
    domain: String,
}

impl ChallengePoller {
    pub fn new(ctx: Arc<AgentContext>, domain: String) -> Self {
        Self { ctx, domain }
    }

    /// The TXT record name queried for this domain's challenge.
    pub fn challenge_name(domain: &str) -> String {
        format!("_acme-challenge.{domain}")
    }

    fn build_resolver(nameservers: &[IpAddr]) -> TokioAsyncResolver {
        let config = if nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for ip in nameservers {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = QUERY_TIMEOUT;
        opts.attempts = 2;
        // Propagation checks must see fresh answers.
        opts.cache_size = 0;

        TokioAsyncResolver::tokio(config, opts)
    }

    /// Query the challenge TXT records, treating any resolver error as
    /// "no answer yet".
    async fn query_challenge(resolver: &TokioAsyncResolver, name: &str) -> Vec<String> {
        match resolver.txt_lookup(name).await {
            Ok(lookup) => lookup
                .iter()
                .map(|txt| {
                    // TXT records can carry multiple character strings; join them.
                    txt.txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect(),
            Err(e) => {
                trace!(record = %name, error = %e, "DNS lookup failed, treating as no answer");
                Vec::new()
            }
        }
    }

    /// Run the confirmation state machine until a terminal status is
    /// reported and the cache entry deleted, or shutdown is signaled.
    pub async fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        let interval = self.ctx.config.acme.poll_interval();
        let resolver = Self::build_resolver(&self.ctx.config.acme.nameservers);
        let challenge_name = Self::challenge_name(&self.domain);

        debug!(domain = %self.domain, record = %challenge_name, "Challenge poller started");

        loop {
            eprintln!("DBG loop top, interval={:?}", interval);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(domain = %self.domain, "Challenge poller cancelled");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            eprintln!("DBG after sleep");

            // Never trust the local copy: the issuance supervisor mutates
            // the same record concurrently.
            let mut record = match self.ctx.fetch_record(&self.domain).await {
                Ok(record) => record,
                Err(StoreError::NotFound { .. }) => {
                    warn!(domain = %self.domain, "Record expired from cache, stopping poller");
                    return;
                }
                Err(e) => {
                    warn!(domain = %self.domain, error = %e, "Cache fetch failed, retrying next poll");
                    continue;
                }
            };

            if record.is_terminal() {
                self.finish(record).await;
                return;
            }

            record.touch();

            eprintln!("DBG before query");
            let answers = Self::query_challenge(&resolver, &challenge_name).await;
            eprintln!("DBG after query, answers={}", answers.len());
            if record.tokens_confirmed(&answers) {
                if !record.continue_check {
                    info!(domain = %self.domain, "DNS challenge confirmed");
                }
                record.continue_check = true;
            }

            if record.deadline_exceeded() {
                record.continue_check = true;
                if record.transition(Status::Failed) {
                    warn!(
                        domain = %self.domain,
                        elapsed_secs = record.elapsed_secs(),
                        "Confirmation deadline exceeded"
                    );
                    record.on_error = Some(TIMEOUT_MESSAGE.to_string());
                }
            }

            if let Err(e) = self.ctx.persist_record(&record).await {
                warn!(domain = %self.domain, error = %e, "Failed to persist record");
            }
            eprintln!("DBG publishing pending, terminal={}", record.is_terminal());
            self.ctx.publish(OutboundEvent::pending_report(&record));

            if record.is_terminal() {
                self.finish(record).await;
                return;
            }
        }
    }

    /// Report the terminal outcome once more, then delete the cache entry.
    /// No further reads of this domain's record are valid afterward.
    async fn finish(&self, record: DomainRecord) {
        self.ctx.publish(OutboundEvent::status_report(&record));
        if let Err(e) = self.ctx.delete_record(&self.domain).await {
            warn!(domain = %self.domain, error = %e, "Failed to delete record");
        }
        info!(domain = %self.domain, status = ?record.status, "Domain workflow finished");
    }
}
