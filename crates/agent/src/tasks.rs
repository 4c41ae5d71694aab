//! Per-domain workflow task registry.
//!
//! Workflow tasks are never fire-and-forget: the handles of every spawned
//! poller/supervisor pair are retained here so shutdown can await them
//! deterministically instead of relying on blanket cancellation.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Registry of spawned per-domain workflow handles.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<DashMap<String, Vec<JoinHandle<()>>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain the handles of a newly spawned workflow pair.
    pub fn register(&self, domain: &str, handles: Vec<JoinHandle<()>>) {
        debug!(domain = %domain, tasks = handles.len(), "Registered domain workflow");
        self.inner.insert(domain.to_string(), handles);
    }

    /// Number of domains with registered workflows.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Await every registered workflow task.
    ///
    /// Called after the shutdown token is set, so tasks are already winding
    /// down; joining here guarantees none outlives the process teardown.
    pub async fn join_all(&self) {
        let domains: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        for domain in domains {
            if let Some((_, handles)) = self.inner.remove(&domain) {
                for handle in handles {
                    if let Err(e) = handle.await {
                        if e.is_panic() {
                            warn!(domain = %domain, "Workflow task panicked during shutdown");
                        }
                    }
                }
                debug!(domain = %domain, "Domain workflow joined");
            }
        }
    }
}
