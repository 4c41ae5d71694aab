//! Issuance subprocess supervisor.
//!
//! Launches the external issuance tool for one domain (base + wildcard
//! names), pointing its hook invocations back at this agent's hooks, and
//! records the outcome on the shared record. The tool's hooks do the actual
//! DNS work: the auth hook publishes the challenge token and writes it into
//! the record through the cache store; the deploy hook installs the
//! certificate into the proxy configuration.
//!
//! This task and the challenge poller race on the same cache key; the
//! store's last-write-wins contract resolves it, since the two writers touch
//! disjoint fields. Terminal reporting and cache deletion stay with the
//! poller.

use std::process::Output;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info, warn};

use certrelay_protocol::Status;

use crate::context::AgentContext;
use crate::store::StoreError;

/// Supervises the external issuance subprocess for one domain.
pub struct IssuanceSupervisor {
    ctx: Arc<AgentContext>,
    domain: String,
}

impl IssuanceSupervisor {
    pub fn new(ctx: Arc<AgentContext>, domain: String) -> Self {
        Self { ctx, domain }
    }

    /// Assemble the issuance command for this domain.
    ///
    /// Fixed argument template: a manual DNS-01 order for the base and
    /// wildcard names, with this agent's hooks wired in.
    fn build_command(&self) -> Command {
        let acme = &self.ctx.config.acme;
        let mut command = Command::new(&acme.issuance_tool);
        command
            .arg("certonly")
            .arg("--cert-name")
            .arg(&self.domain)
            .arg("--manual")
            .arg("--manual-auth-hook")
            .arg(&acme.auth_hook)
            .arg("--deploy-hook")
            .arg(&acme.deploy_hook)
            .arg("--force-renewal")
            .arg("--preferred-challenges=dns")
            .arg("--register-unsafely-without-email")
            .arg("--manual-public-ip-logging-ok")
            .arg("--server")
            .arg(&acme.directory_url)
            .arg("--agree-tos")
            .arg("--quiet")
            .arg("-d")
            .arg(&self.domain)
            .arg("-d")
            .arg(format!("*.{}", self.domain))
            // Cancellation must not leave an orphaned order running.
            .kill_on_drop(true);
        command
    }

    /// Flatten captured subprocess output for single-line reporting.
    fn flatten(bytes: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(bytes)
            .replace('\n', " ")
            .trim()
            .to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Run the subprocess to completion and record its outcome.
    pub async fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        info!(
            domain = %self.domain,
            tool = %self.ctx.config.acme.issuance_tool,
            "Starting issuance subprocess"
        );

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(domain = %self.domain, "Issuance supervisor cancelled");
                return;
            }
            result = self.build_command().output() => result,
        };

        match result {
            Ok(output) => self.record_outcome(&output).await,
            Err(e) => {
                warn!(domain = %self.domain, error = %e, "Failed to spawn issuance tool");
                self.record_spawn_failure(e.to_string()).await;
            }
        }
    }

    /// Attach captured output to the freshest record and set the terminal
    /// status. The poller may have progressed the record concurrently, so it
    /// is re-fetched rather than assumed.
    async fn record_outcome(&self, output: &Output) {
        let mut record = match self.ctx.fetch_record(&self.domain).await {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => {
                warn!(domain = %self.domain, "Record gone before issuance outcome could be recorded");
                return;
            }
            Err(e) => {
                warn!(domain = %self.domain, error = %e, "Cache fetch failed recording issuance outcome");
                return;
            }
        };

        record.on_success = Self::flatten(&output.stdout);
        record.on_error = Self::flatten(&output.stderr);

        let status = if output.status.success() {
            Status::Success
        } else {
            Status::Failed
        };
        record.transition(status);

        debug!(
            domain = %self.domain,
            exit = ?output.status.code(),
            status = ?record.status,
            "Issuance subprocess finished"
        );

        if let Err(e) = self.ctx.persist_record(&record).await {
            warn!(domain = %self.domain, error = %e, "Failed to persist issuance outcome");
        }
    }

    async fn record_spawn_failure(&self, detail: String) {
        let mut record = match self.ctx.fetch_record(&self.domain).await {
            Ok(record) => record,
            Err(e) => {
                warn!(domain = %self.domain, error = %e, "Cache fetch failed recording spawn failure");
                return;
            }
        };

        record.on_error = Some(format!(
            "failed to spawn '{}': {detail}",
            self.ctx.config.acme.issuance_tool
        ));
        record.transition(Status::Failed);

        if let Err(e) = self.ctx.persist_record(&record).await {
            warn!(domain = %self.domain, error = %e, "Failed to persist spawn failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use certrelay_config::AgentConfig;
    use certrelay_protocol::DomainRecord;

    fn context_with_tool(tool: &str) -> (Arc<AgentContext>, crate::context::QueueReceivers) {
        let mut config = AgentConfig::default();
        config.acme.issuance_tool = tool.to_string();
        AgentContext::new(config, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_flatten_joins_lines() {
        assert_eq!(
            IssuanceSupervisor::flatten(b"line one\nline two\n"),
            Some("line one line two".to_string())
        );
        assert_eq!(IssuanceSupervisor::flatten(b"\n\n"), None);
        assert_eq!(IssuanceSupervisor::flatten(b""), None);
    }

    #[test]
    fn test_command_template() {
        let (ctx, _rx) = context_with_tool("certbot");
        let supervisor = IssuanceSupervisor::new(ctx, "example.com".to_string());
        let command = supervisor.build_command();
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args[0], "certonly");
        assert!(args.contains(&"--manual".to_string()));
        assert!(args.contains(&"--preferred-challenges=dns".to_string()));
        assert!(args.contains(&"example.com".to_string()));
        assert!(args.contains(&"*.example.com".to_string()));
        assert_eq!(
            command.as_std().get_program().to_string_lossy(),
            "certbot"
        );
    }

    #[tokio::test]
    async fn test_zero_exit_records_success() {
        let (ctx, _rx) = context_with_tool("true");
        ctx.persist_record(&DomainRecord::new("example.com"))
            .await
            .unwrap();

        IssuanceSupervisor::new(ctx.clone(), "example.com".to_string())
            .run()
            .await;

        let record = ctx.fetch_record("example.com").await.unwrap();
        assert_eq!(record.status, Status::Success);
    }

    #[tokio::test]
    async fn test_nonzero_exit_records_failure() {
        let (ctx, _rx) = context_with_tool("false");
        ctx.persist_record(&DomainRecord::new("example.com"))
            .await
            .unwrap();

        IssuanceSupervisor::new(ctx.clone(), "example.com".to_string())
            .run()
            .await;

        let record = ctx.fetch_record("example.com").await.unwrap();
        assert_eq!(record.status, Status::Failed);
    }

    #[tokio::test]
    async fn test_missing_tool_records_failure() {
        let (ctx, _rx) = context_with_tool("certrelay-no-such-tool");
        ctx.persist_record(&DomainRecord::new("example.com"))
            .await
            .unwrap();

        IssuanceSupervisor::new(ctx.clone(), "example.com".to_string())
            .run()
            .await;

        let record = ctx.fetch_record("example.com").await.unwrap();
        assert_eq!(record.status, Status::Failed);
        assert!(record.on_error.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_poller_failure_is_not_overwritten() {
        let (ctx, _rx) = context_with_tool("true");
        let mut record = DomainRecord::new("example.com");
        record.transition(Status::Failed);
        ctx.persist_record(&record).await.unwrap();

        IssuanceSupervisor::new(ctx.clone(), "example.com".to_string())
            .run()
            .await;

        // Exit 0 arrived after the poller already failed the workflow; the
        // terminal status must not regress.
        let record = ctx.fetch_record("example.com").await.unwrap();
        assert_eq!(record.status, Status::Failed);
    }
}
