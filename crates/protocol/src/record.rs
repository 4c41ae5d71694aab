//! Per-domain certificate lifecycle record.
//!
//! One [`DomainRecord`] exists per domain in flight, keyed by the domain name
//! in the shared cache store. Two independent tasks mutate it — the challenge
//! poller and the issuance supervisor — each following a
//! read-fresh / mutate / write-back cycle against the store. The writers touch
//! disjoint fields, so last-write-wins is sufficient for both to converge on
//! the same terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Default confirmation deadline: how long the poller waits for the DNS
/// challenge records to appear before failing the workflow.
pub const DEFAULT_CONTINUE_TIMEOUT_SECS: u64 = 5 * 60;

/// Default cache expiry for a record. Slightly longer than the confirmation
/// deadline so a wedged workflow is reclaimed by the store itself.
pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 11 * 60;

/// Certificate request status.
///
/// Transitions are one-way: `Pending -> Success` or `Pending -> Failed`.
/// A terminal record is reported once more and then deleted from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Success,
    Failed,
}

impl Status {
    /// Whether this status ends the workflow.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }
}

/// The lifecycle record for one certificate request.
///
/// Base and wildcard validation share one challenge name in this design, so
/// up to two DNS tokens accumulate per domain; `token_one` always fills
/// first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Domain name, also the cache key.
    pub domain: String,
    /// Current workflow status.
    pub status: Status,
    /// Opaque issuance-provider credentials, written by the auth hook.
    #[serde(default)]
    pub account: Map<String, Value>,
    /// First DNS challenge token.
    pub token_one: Option<String>,
    /// Second DNS challenge token (wildcard validation).
    pub token_two: Option<String>,
    /// Diagnostic text captured from the issuance subprocess on failure.
    pub on_error: Option<String>,
    /// Diagnostic text captured from the issuance subprocess on success.
    pub on_success: Option<String>,
    /// When the workflow started.
    pub start_time: DateTime<Utc>,
    /// Last time the poller observed the record.
    pub current_time: DateTime<Utc>,
    /// Confirmation deadline in seconds, counted from `start_time`.
    pub continue_time_out: u64,
    /// Cache expiry in seconds, applied on every write-back.
    pub cache_time_out: u64,
    /// True once DNS has matched all known tokens or the deadline elapsed.
    pub continue_check: bool,
}

impl DomainRecord {
    /// Create a fresh pending record for `domain` with default timeouts.
    pub fn new(domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            domain: domain.into(),
            status: Status::Pending,
            account: Map::new(),
            token_one: None,
            token_two: None,
            on_error: None,
            on_success: None,
            start_time: now,
            current_time: now,
            continue_time_out: DEFAULT_CONTINUE_TIMEOUT_SECS,
            cache_time_out: DEFAULT_CACHE_TIMEOUT_SECS,
            continue_check: false,
        }
    }

    /// Override the cache expiry, e.g. from the `cache_ttl` command field.
    pub fn with_cache_ttl(mut self, secs: u64) -> Self {
        self.cache_time_out = secs;
        self
    }

    /// Record a DNS challenge token. `token_one` fills first.
    pub fn set_token(&mut self, token: impl Into<String>) {
        if self.token_one.is_none() {
            self.token_one = Some(token.into());
        } else {
            self.token_two = Some(token.into());
        }
    }

    /// Attach the issuance-provider account credentials.
    pub fn set_account(&mut self, account: Map<String, Value>) {
        self.account = account;
    }

    /// Tokens known so far, in fill order.
    pub fn known_tokens(&self) -> impl Iterator<Item = &str> {
        self.token_one
            .iter()
            .chain(self.token_two.iter())
            .map(String::as_str)
    }

    /// Check a DNS answer set against the known tokens.
    ///
    /// True iff at least one token is known and every known token appears in
    /// `answers`. An empty token set never matches: confirmation before the
    /// auth hook has published anything would be meaningless.
    pub fn tokens_confirmed(&self, answers: &[String]) -> bool {
        let mut known = self.known_tokens().peekable();
        if known.peek().is_none() {
            return false;
        }
        known.all(|token| answers.iter().any(|a| a == token))
    }

    /// Refresh `current_time` for deadline accounting.
    pub fn touch(&mut self) {
        self.current_time = Utc::now();
    }

    /// Seconds between `start_time` and `current_time`.
    pub fn elapsed_secs(&self) -> i64 {
        (self.current_time - self.start_time).num_seconds()
    }

    /// Whether the confirmation deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        self.elapsed_secs() >= self.continue_time_out as i64
    }

    /// Seconds remaining until the confirmation deadline, clamped at zero.
    pub fn auto_check_in(&self) -> i64 {
        (self.continue_time_out as i64 - self.elapsed_secs()).max(0)
    }

    /// Attempt a status transition, enforcing monotonicity.
    ///
    /// Only `Pending -> Success` and `Pending -> Failed` are accepted; a
    /// terminal record never changes status again. Returns whether the
    /// transition was applied. Re-asserting the current status is a no-op
    /// that reports success.
    pub fn transition(&mut self, next: Status) -> bool {
        if self.status == next {
            return true;
        }
        if self.status.is_terminal() {
            warn!(
                domain = %self.domain,
                from = ?self.status,
                to = ?next,
                "Refusing status transition out of a terminal state"
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Whether this record has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Build the wire-facing view of this record.
    pub fn report(&self) -> DomainReport {
        DomainReport {
            domain: self.domain.clone(),
            status: self.status,
            account: self.account.clone(),
            token_one: self.token_one.clone(),
            token_two: self.token_two.clone(),
            on_error: self.on_error.clone(),
            on_success: self.on_success.clone(),
            continue_time_out: self.continue_time_out,
            continue_check: self.continue_check,
            auto_check_in: self.auto_check_in(),
        }
    }
}

/// Serialized record shape carried in outbound status reports.
///
/// `auto_check_in` is the controller's hint for when to expect the next
/// pending report: the confirmation deadline minus elapsed time, clamped at
/// zero once the deadline has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainReport {
    pub domain: String,
    pub status: Status,
    #[serde(default)]
    pub account: Map<String, Value>,
    pub token_one: Option<String>,
    pub token_two: Option<String>,
    pub on_error: Option<String>,
    pub on_success: Option<String>,
    pub continue_time_out: u64,
    pub continue_check: bool,
    pub auto_check_in: i64,
}
