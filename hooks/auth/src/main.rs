//! Certbot manual auth hook.
//!
//! Invoked by the issuance tool once per validation name with the domain and
//! token in the environment. Publishes the token to the acme-dns service,
//! writes it into the shared domain record through the cache store, and then
//! blocks until the agent's challenge poller confirms DNS propagation (or
//! the deadline forces the workflow on), so the issuance tool only proceeds
//! to validation once the record is actually visible.

mod acme_dns;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use certrelay_agent::{CacheStore, RedisStore};
use certrelay_config::AgentConfig;
use certrelay_protocol::DomainRecord;

use crate::acme_dns::AcmeDnsClient;

/// Cadence for re-checking the shared record while waiting for propagation.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Certbot manual auth hook publishing DNS-01 tokens via acme-dns
#[derive(Parser, Debug)]
#[command(name = "certrelay-auth-hook")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Agent configuration file path
    #[arg(short = 'c', long = "config", env = "CERTRELAY_CONFIG")]
    config: Option<String>,

    /// acme-dns instance URL
    #[arg(
        long = "acme-dns-url",
        env = "CERTRELAY_ACME_DNS_URL",
        default_value = "https://auth.acme-dns.io"
    )]
    acme_dns_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout is captured by the issuance supervisor as diagnostics; keep
    // logging on stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            AgentConfig::from_file(path).context("failed to load configuration file")?
        }
        None => AgentConfig::default(),
    };

    // The issuance tool hands us the validation context in the environment.
    let mut domain =
        std::env::var("CERTBOT_DOMAIN").context("CERTBOT_DOMAIN is not set")?;
    let token =
        std::env::var("CERTBOT_VALIDATION").context("CERTBOT_VALIDATION is not set")?;

    // The wildcard name validates against the same challenge name as the
    // base domain.
    if let Some(stripped) = domain.strip_prefix("*.") {
        domain = stripped.to_string();
    }

    info!(domain = %domain, "Auth hook invoked");

    let client = AcmeDnsClient::new(cli.acme_dns_url.trim_end_matches('/'));
    let account = match acme_dns::load_account(&config.paths.letsencrypt_dir, &domain)? {
        Some(account) => account,
        None => {
            let account = client.register().await.context("acme-dns registration failed")?;
            acme_dns::save_account(&config.paths.letsencrypt_dir, &domain, &account)?;
            warn!(
                domain = %domain,
                cname_target = %account.fulldomain,
                "New acme-dns account: _acme-challenge.{domain} must CNAME to this target"
            );
            account
        }
    };

    client
        .update_txt_record(&account, &token)
        .await
        .context("failed to publish TXT challenge record")?;

    let store = RedisStore::connect(&config.cache.url)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to cache store: {e}"))?;
    let store: Arc<dyn CacheStore> = Arc::new(store);

    let mut record = fetch_record(store.as_ref(), &domain)
        .await
        .context("no workflow record for this domain")?;
    record.set_account(account.to_record_map());
    record.set_token(token.as_str());
    persist_record(store.as_ref(), &record).await?;
    info!(domain = %domain, "Challenge token recorded");

    // With both tokens published, block until the agent's poller confirms
    // propagation or the deadline forces the workflow on. Certbot queries
    // the ACME server only after this hook returns.
    if record.token_one.is_some() && record.token_two.is_some() {
        wait_for_confirmation(store.as_ref(), &domain, record.cache_time_out).await?;
    }

    Ok(())
}

async fn fetch_record(store: &dyn CacheStore, domain: &str) -> Result<DomainRecord> {
    let bytes = store
        .get(domain)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    serde_json::from_slice(&bytes).context("stored record is not decodable")
}

async fn persist_record(store: &dyn CacheStore, record: &DomainRecord) -> Result<()> {
    let bytes = serde_json::to_vec(record)?;
    store
        .set(&record.domain, bytes, record.cache_time_out)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
}

/// Poll the shared record until `continue_check` goes true.
///
/// The agent's poller sets it on a DNS match or on deadline expiry, so this
/// loop always terminates; `deadline_secs` is a belt against the record
/// disappearing mid-wait.
async fn wait_for_confirmation(
    store: &dyn CacheStore,
    domain: &str,
    deadline_secs: u64,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(deadline_secs);

    loop {
        let record = fetch_record(store, domain)
            .await
            .context("workflow record disappeared while waiting for propagation")?;
        if record.continue_check {
            info!(domain = %domain, "Propagation confirmed, releasing issuance tool");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for propagation confirmation");
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}
