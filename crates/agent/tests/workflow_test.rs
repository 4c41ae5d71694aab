//! End-to-end domain workflow tests against the in-memory cache store.
//!
//! The issuance tool is substituted with small host binaries (`true`,
//! `false`) so the supervisor exercises real subprocess handling without an
//! ACME endpoint, and the resolver points at a refused local port so DNS
//! lookups fail fast and are swallowed as "no answer yet".

use std::sync::Arc;
use std::time::Duration;

use certrelay_agent::{AgentContext, ChallengePoller, Dispatcher, MemoryStore, StoreError};
use certrelay_config::AgentConfig;
use certrelay_protocol::{
    DomainRecord, InboundMessage, OutboundEvent, ReportKind, Status,
};

fn test_config(tool: &str, continue_timeout_secs: u64) -> AgentConfig {
    AgentConfig::from_toml(&format!(
        r#"
            [gateway]
            connect_url = "ws://127.0.0.1:9000/agent"
            connect_token = "secret"

            [acme]
            issuance_tool = "{tool}"
            poll_interval_secs = 1
            continue_timeout_secs = {continue_timeout_secs}
            nameservers = ["127.0.0.1"]
        "#
    ))
    .unwrap()
}

fn test_context(
    tool: &str,
    continue_timeout_secs: u64,
) -> (Arc<AgentContext>, certrelay_agent::context::QueueReceivers) {
    AgentContext::new(
        test_config(tool, continue_timeout_secs),
        Arc::new(MemoryStore::new()),
    )
}

/// Drain outbound events until a terminal status report arrives.
async fn wait_for_terminal(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutboundEvent>,
) -> (ReportKind, certrelay_protocol::DomainReport) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for outbound event")
            .expect("outbound queue closed");
        if let OutboundEvent::StatusReport { ftype, content, .. } = event {
            if ftype != ReportKind::AcmePending {
                return (ftype, content);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn add_domain_reaches_success_and_cleans_up() {
    let (ctx, mut rx) = test_context("true", 300);
    let dispatcher = tokio::spawn(Dispatcher::new(ctx.clone()).run(rx.inbound));

    // The exact inbound wire shape.
    let message = InboundMessage::from_json(
        r#"{"action":"add_domain","content":{"domain":"example.com","cache_ttl":30}}"#,
    )
    .unwrap();
    ctx.deliver(message);

    let (kind, report) = wait_for_terminal(&mut rx.outbound).await;
    assert_eq!(kind, ReportKind::AcmeSuccess);
    assert_eq!(report.domain, "example.com");
    assert_eq!(report.status, Status::Success);

    // Once the terminal outcome is reported the entry is gone.
    assert!(matches!(
        ctx.fetch_record("example.com").await,
        Err(StoreError::NotFound { .. })
    ));

    ctx.shutdown.cancel();
    ctx.workflows.join_all().await;
    dispatcher.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_issuance_reports_failure() {
    let (ctx, mut rx) = test_context("false", 300);
    let dispatcher = tokio::spawn(Dispatcher::new(ctx.clone()).run(rx.inbound));

    ctx.deliver(InboundMessage {
        action: "add_domain".to_string(),
        content: serde_json::json!({"domain": "broken.example", "cache_ttl": 60}),
    });

    let (kind, report) = wait_for_terminal(&mut rx.outbound).await;
    assert_eq!(kind, ReportKind::AcmeFailed);
    assert_eq!(report.domain, "broken.example");
    assert_eq!(report.status, Status::Failed);

    assert!(ctx.fetch_record("broken.example").await.is_err());

    ctx.shutdown.cancel();
    ctx.workflows.join_all().await;
    dispatcher.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_add_domain_spawns_one_workflow() {
    let (ctx, mut rx) = test_context("true", 300);
    let dispatcher = tokio::spawn(Dispatcher::new(ctx.clone()).run(rx.inbound));

    for _ in 0..2 {
        ctx.deliver(InboundMessage {
            action: "add_domain".to_string(),
            content: serde_json::json!({"domain": "example.com", "cache_ttl": 60}),
        });
    }

    let (_, report) = wait_for_terminal(&mut rx.outbound).await;
    assert_eq!(report.domain, "example.com");

    // Exactly one workflow pair was registered for both commands.
    assert_eq!(ctx.workflows.len(), 1);

    // No second terminal report is in flight.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut extra_terminal = 0;
    while let Ok(event) = rx.outbound.try_recv() {
        if let OutboundEvent::StatusReport { ftype, .. } = event {
            if ftype != ReportKind::AcmePending {
                extra_terminal += 1;
            }
        }
    }
    assert_eq!(extra_terminal, 0);

    ctx.shutdown.cancel();
    ctx.workflows.join_all().await;
    dispatcher.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn confirmation_timeout_fails_the_workflow() {
    // No issuance subprocess at all: only the poller drives this record, and
    // no DNS answer ever matches, so the deadline is the only exit.
    let (ctx, mut rx) = test_context("true", 1);

    let mut record = DomainRecord::new("stuck.example");
    record.continue_time_out = 1;
    record.set_token("never-published");
    ctx.persist_record(&record).await.unwrap();

    let poller = tokio::spawn(ChallengePoller::new(ctx.clone(), "stuck.example".to_string()).run());

    let (kind, report) = wait_for_terminal(&mut rx.outbound).await;
    assert_eq!(kind, ReportKind::AcmeFailed);
    assert_eq!(report.status, Status::Failed);
    assert!(report.continue_check);
    let on_error = report.on_error.expect("timeout must record a message");
    assert!(!on_error.is_empty());

    assert!(ctx.fetch_record("stuck.example").await.is_err());
    poller.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_reports_precede_terminal_on_slow_workflows() {
    // Drive the poller alone against a pending record: with a 3s deadline
    // and a 1s poll interval, at least one pending report must be published
    // before the terminal failure.
    let (ctx, mut rx) = test_context("true", 3);

    let mut record = DomainRecord::new("slow.example");
    record.continue_time_out = 3;
    ctx.persist_record(&record).await.unwrap();

    let poller = tokio::spawn(ChallengePoller::new(ctx.clone(), "slow.example".to_string()).run());

    let first = tokio::time::timeout(Duration::from_secs(10), rx.outbound.recv())
        .await
        .unwrap()
        .unwrap();
    match first {
        OutboundEvent::StatusReport { ftype, content, .. } => {
            assert_eq!(ftype, ReportKind::AcmePending);
            assert_eq!(content.domain, "slow.example");
            assert!(content.auto_check_in >= 0);
        }
        other => panic!("expected a pending report, got {other:?}"),
    }

    let (kind, _) = wait_for_terminal(&mut rx.outbound).await;
    assert_eq!(kind, ReportKind::AcmeFailed);
    poller.await.unwrap();
}
