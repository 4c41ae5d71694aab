//! acme-dns API client and per-domain account storage.
//!
//! acme-dns hosts the `_acme-challenge` CNAME target, so publishing a TXT
//! update there is all the DNS write access this host ever needs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the acme-dns API or account storage.
#[derive(Debug, Error)]
pub enum AcmeDnsError {
    #[error("acme-dns request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("acme-dns returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("account storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("corrupt account file '{path}': {reason}")]
    CorruptAccount { path: PathBuf, reason: String },
}

/// Registered acme-dns account for one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeDnsAccount {
    pub username: String,
    pub password: String,
    pub fulldomain: String,
    pub subdomain: String,
    #[serde(default)]
    pub allowfrom: Vec<String>,
}

impl AcmeDnsAccount {
    /// Convert to the opaque credential map carried in the domain record.
    pub fn to_record_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// Client for the acme-dns registration/update API.
pub struct AcmeDnsClient {
    base_url: String,
    http: reqwest::Client,
}

impl AcmeDnsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Register a new acme-dns account.
    pub async fn register(&self) -> Result<AcmeDnsAccount, AcmeDnsError> {
        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 201 {
            return Err(AcmeDnsError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let account: AcmeDnsAccount = response.json().await?;
        info!(subdomain = %account.subdomain, "Registered new acme-dns account");
        Ok(account)
    }

    /// Update the TXT challenge record on the account's subdomain.
    pub async fn update_txt_record(
        &self,
        account: &AcmeDnsAccount,
        txt: &str,
    ) -> Result<(), AcmeDnsError> {
        let response = self
            .http
            .post(format!("{}/update", self.base_url))
            .header("X-Api-User", &account.username)
            .header("X-Api-Key", &account.password)
            .json(&serde_json::json!({
                "subdomain": account.subdomain,
                "txt": txt,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AcmeDnsError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        debug!(subdomain = %account.subdomain, "Updated TXT challenge record");
        Ok(())
    }
}

/// Load a stored account for `domain`, if one exists.
pub fn load_account(dir: &Path, domain: &str) -> Result<Option<AcmeDnsAccount>, AcmeDnsError> {
    let path = account_path(dir, domain);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let account =
        serde_json::from_str(&content).map_err(|e| AcmeDnsError::CorruptAccount {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    debug!(path = %path.display(), "Loaded stored acme-dns account");
    Ok(Some(account))
}

/// Persist a registered account for `domain`.
pub fn save_account(
    dir: &Path,
    domain: &str,
    account: &AcmeDnsAccount,
) -> Result<(), AcmeDnsError> {
    std::fs::create_dir_all(dir)?;
    let path = account_path(dir, domain);
    let content = serde_json::to_string_pretty(account).map_err(|e| {
        AcmeDnsError::CorruptAccount {
            path: path.clone(),
            reason: e.to_string(),
        }
    })?;
    std::fs::write(&path, content)?;

    // Credentials grant DNS write access to the challenge subdomain.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!(path = %path.display(), "Saved acme-dns account");
    Ok(())
}

fn account_path(dir: &Path, domain: &str) -> PathBuf {
    dir.join(format!("{domain}.json"))
}
