//! Certbot deploy hook.
//!
//! Invoked by the issuance tool once per successful issuance with the
//! renewed domains in the environment. Renders the proxy TLS server blocks
//! for the base and wildcard names and reloads the proxy so the new
//! certificate is served immediately.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use certrelay_config::AgentConfig;

/// Certbot deploy hook installing TLS server blocks for the proxy
#[derive(Parser, Debug)]
#[command(name = "certrelay-deploy-hook")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Agent configuration file path
    #[arg(short = 'c', long = "config", env = "CERTRELAY_CONFIG")]
    config: Option<String>,

    /// Skip the proxy reload (render configuration only)
    #[arg(long = "no-reload")]
    no_reload: bool,
}

fn main() -> Result<()> {
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

    let renewed = std::env::var("RENEWED_DOMAINS").context("RENEWED_DOMAINS is not set")?;
    let domain = renewed
        .split_whitespace()
        .next()
        .context("RENEWED_DOMAINS is empty")?;

    info!(domain = %domain, "Deploy hook invoked");

    let live_dir = config.paths.letsencrypt_dir.join("live").join(domain);
    let certificate = live_dir.join("fullchain.pem");
    let certificate_key = live_dir.join("privkey.pem");
    if !certificate.is_file() {
        bail!("certificate {} does not exist for {domain}", certificate.display());
    }
    if !certificate_key.is_file() {
        bail!(
            "certificate key {} does not exist for {domain}",
            certificate_key.display()
        );
    }

    let rendered = render_server_blocks(domain, &certificate, &certificate_key);
    let config_path = site_config_path(&config.paths.proxy_config_dir, domain);
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    info!(path = %config_path.display(), "Wrote proxy TLS configuration");

    if !cli.no_reload {
        reload_proxy();
    }

    println!("Certificate for {domain} deployed to the proxy configuration");
    Ok(())
}

fn site_config_path(proxy_config_dir: &Path, domain: &str) -> PathBuf {
    proxy_config_dir.join("conf.d").join(format!("{domain}.conf"))
}

/// Render the TLS server blocks for the base and wildcard names.
fn render_server_blocks(domain: &str, certificate: &Path, certificate_key: &Path) -> String {
    let certificate = certificate.display();
    let certificate_key = certificate_key.display();
    format!(
        r#"server {{
    listen 80;
    server_name {domain} *.{domain};
    access_log on;
    access_log /var/log/nginx/{domain}.log main;
    error_log /var/log/nginx/{domain}.log;
    return 301 https://$host$request_uri;
}}
server {{
    listen 443 ssl http2;
    server_name {domain};
    rewrite ^(.*) http://www.{domain}$1 permanent;
    ssl_certificate {certificate};
    ssl_certificate_key {certificate_key};
    include /etc/nginx/common/restricted.conf;
}}
server {{
    listen 443 ssl http2;
    server_name *.{domain};
    ssl_certificate {certificate};
    ssl_certificate_key {certificate_key};
    include /etc/nginx/common/restricted.conf;
}}
"#
    )
}

/// Reload the proxy. Failure is logged, not fatal: the rendered
/// configuration is picked up on the next reload either way.
fn reload_proxy() {
    // Give the issuance tool a moment to finish writing symlinks.
    std::thread::sleep(Duration::from_secs(2));
    match Command::new("nginx").arg("-s").arg("reload").output() {
        Ok(output) if output.status.success() => {
            info!("Proxy reloaded");
        }
        Ok(output) => {
            warn!(
                exit = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Proxy reload failed"
            );
        }
        Err(e) => {
            warn!(error = %e, "Could not run proxy reload");
        }
    }
}
