//! End-to-end remediation scenarios through the public orchestrator API.

mod common;

use common::{alert, diagnosis, test_config, Harness};
use notify::NotifyEvent;
use remediator::registry::{command, MatchPredicate, RunbookDefinition, RunbookRegistry, VerificationPredicate};
use remediator::types::{
    BlockReason, FailureReason, RemediationRequest, RemediationStatus, RiskLevel, TriggeredBy,
};
use remediator::RemediationError;
use uuid::Uuid;

#[tokio::test]
async fn test_confident_diagnosis_cleans_disk() {
    let h = Harness::new(&test_config());
    h.alerts.fire(alert("a-disk", "H1", "disk_percent", 97.0, 90.0));
    h.diagnosis.respond_with(diagnosis(0.9, Some("disk_cleanup")));
    h.telemetry.set("H1", "disk_percent", 80.0);

    let record = h
        .orchestrator
        .handle(RemediationRequest::auto("a-disk", "H1"))
        .await
        .unwrap();

    assert_eq!(record.status, RemediationStatus::Success);
    assert_eq!(record.runbook_name.as_deref(), Some("disk_cleanup"));
    assert_eq!(record.risk_level, Some(RiskLevel::Auto));
    assert_eq!(record.verification_passed, Some(true));
    assert_eq!(record.command_results.len(), 3);
    assert!(record.command_results.iter().all(|r| r.exit_code == 0 && !r.simulated));
    assert!(record.diagnosis.is_some());
    assert!(record.completed_at.is_some());

    let sent = h.transport.commands_for("H1");
    assert_eq!(sent[0], "find /tmp -xdev -type f -mtime +7 -delete");
    assert_eq!(sent[2], "apt-get clean");

    let stored = h.orchestrator.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored, record);

    h.wait_for(|h| {
        h.notifications.events().iter().any(|e| {
            matches!(e, NotifyEvent::RemediationFinished { status, runbook, .. }
                if status == "success" && runbook.as_deref() == Some("disk_cleanup"))
        })
    })
    .await;
}

#[tokio::test]
async fn test_low_confidence_without_rule_is_blocked() {
    let h = Harness::new(&test_config());
    h.alerts.fire(alert("a-cpu", "H2", "cpu_percent", 99.0, 90.0));
    h.diagnosis.respond_with(diagnosis(0.2, Some("disk_cleanup")));

    let record = h
        .orchestrator
        .handle(RemediationRequest::auto("a-cpu", "H2"))
        .await
        .unwrap();

    assert_eq!(record.status, RemediationStatus::Blocked);
    assert_eq!(record.blocked_reason, Some(BlockReason::NoMatchingRunbook));
    assert_eq!(record.reason(), Some("no_matching_runbook"));
    assert!(record.runbook_name.is_none());
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn test_circuit_opens_after_consecutive_failures() {
    let mut config = test_config();
    config.safety.rate_limit_max = 10;
    let h = Harness::new(&config);
    h.transport.fail_commands_containing("find /tmp");

    for i in 0..3 {
        let id = format!("a-fail-{i}");
        h.alerts.fire(alert(&id, "H3", "disk_percent", 97.0, 90.0));
        let record = h
            .orchestrator
            .handle(RemediationRequest::auto(id, "H3"))
            .await
            .unwrap();
        assert_eq!(record.status, RemediationStatus::Failed);
        assert_eq!(record.failure_reason, Some(FailureReason::CommandFailed));
        // stopped at the first failing command
        assert_eq!(record.command_results.len(), 1);
    }

    h.transport.clear_failures();
    h.alerts.fire(alert("a-fourth", "H3", "disk_percent", 97.0, 90.0));
    let record = h
        .orchestrator
        .handle(RemediationRequest::auto("a-fourth", "H3"))
        .await
        .unwrap();

    assert_eq!(record.status, RemediationStatus::Blocked);
    assert_eq!(record.blocked_reason, Some(BlockReason::CircuitOpen));
    assert!(record.command_results.is_empty());
    assert_eq!(h.transport.commands_for("H3").len(), 3);
}

fn destructive_registry(risk_level: RiskLevel) -> RunbookRegistry {
    RunbookRegistry::new(vec![RunbookDefinition {
        id: "purge".to_string(),
        name: "Purge everything".to_string(),
        description: String::new(),
        predicate: MatchPredicate {
            metrics: vec!["disk_percent".to_string()],
            keywords: Vec::new(),
        },
        risk_level,
        commands: vec![
            command("purge", "df -h", "^df -h$").unwrap(),
            command("purge", "rm -rf /", ".*").unwrap(),
        ],
        verification: VerificationPredicate::ThresholdCleared,
    }])
    .unwrap()
}

#[tokio::test]
async fn test_blacklisted_command_blocks_any_risk_level() {
    for risk in [RiskLevel::Auto, RiskLevel::Confirm] {
        let h = Harness::with_registry(&test_config(), destructive_registry(risk));
        h.alerts.fire(alert("a-purge", "H4", "disk_percent", 97.0, 90.0));

        let record = h
            .orchestrator
            .handle(RemediationRequest::auto("a-purge", "H4"))
            .await
            .unwrap();

        assert_eq!(record.status, RemediationStatus::Blocked, "risk {risk}");
        assert_eq!(record.blocked_reason, Some(BlockReason::BlacklistViolation));
        assert!(record.command_results.is_empty());
        assert!(h.transport.calls().is_empty());
        assert!(h.orchestrator.awaiting_approval().is_empty());
    }
}

#[tokio::test]
async fn test_confirm_runbook_runs_after_approval() {
    let h = Harness::new(&test_config());
    h.alerts.fire(alert("a-mem", "H5", "memory_percent", 96.0, 90.0));
    h.telemetry.set("H5", "memory_percent", 60.0);

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .handle(RemediationRequest::auto("a-mem", "H5"))
            .await
    });

    h.wait_for(|h| !h.orchestrator.awaiting_approval().is_empty())
        .await;
    let record_id = h.orchestrator.awaiting_approval()[0];
    assert!(h.transport.calls().is_empty());

    let pending = h.orchestrator.get(record_id).await.unwrap().unwrap();
    assert_eq!(pending.status, RemediationStatus::Matched);
    assert_eq!(pending.risk_level, Some(RiskLevel::Confirm));

    h.orchestrator.approve(record_id, "alice").await.unwrap();
    let record = run.await.unwrap().unwrap();

    assert_eq!(record.id, record_id);
    assert_eq!(record.status, RemediationStatus::Success);
    assert_eq!(record.runbook_name.as_deref(), Some("memory_cache_drop"));
    assert_eq!(record.approved_by.as_deref(), Some("alice"));
    assert!(record.approved_at.is_some());
    assert_eq!(h.transport.commands_for("H5"), vec!["sync", "sysctl -w vm.drop_caches=1"]);

    let err = h.orchestrator.approve(record_id, "bob").await.unwrap_err();
    assert!(matches!(
        err,
        RemediationError::InvalidApproval {
            status: RemediationStatus::Success,
            ..
        }
    ));

    let err = h.orchestrator.approve(Uuid::new_v4(), "bob").await.unwrap_err();
    assert!(matches!(err, RemediationError::RecordNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_unapproved_confirm_runbook_times_out() {
    let mut config = test_config();
    config.safety.approval_timeout_secs = 60;
    let h = Harness::new(&config);
    h.alerts.fire(alert("a-mem", "H5", "memory_percent", 96.0, 90.0));

    let record = h
        .orchestrator
        .handle(RemediationRequest::auto("a-mem", "H5"))
        .await
        .unwrap();

    assert_eq!(record.status, RemediationStatus::Blocked);
    assert_eq!(record.blocked_reason, Some(BlockReason::ApprovalTimeout));
    assert!(h.transport.calls().is_empty());
    assert!(h.orchestrator.awaiting_approval().is_empty());

    h.wait_for(|h| {
        h.notifications
            .events()
            .iter()
            .any(|e| matches!(e, NotifyEvent::ApprovalRequested { runbook, .. } if runbook == "memory_cache_drop"))
    })
    .await;
}

#[tokio::test]
async fn test_manual_trigger_records_operator() {
    let h = Harness::new(&test_config());
    h.alerts.fire(alert("a-disk", "H1", "disk_percent", 97.0, 90.0));
    h.telemetry.set("H1", "disk_percent", 50.0);

    let record = h
        .orchestrator
        .request_manual("a-disk", "carol")
        .await
        .unwrap();
    assert_eq!(record.triggered_by, TriggeredBy::Manual("carol".to_string()));
    assert_eq!(record.status, RemediationStatus::Success);

    let err = h
        .orchestrator
        .request_manual("missing", "carol")
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::AlertNotFound(_)));
}

#[tokio::test]
async fn test_unverified_fix_is_failure() {
    let h = Harness::new(&test_config());
    h.alerts.fire(alert("a-disk", "H1", "disk_percent", 97.0, 90.0));
    h.telemetry.set("H1", "disk_percent", 95.0);

    let record = h
        .orchestrator
        .handle(RemediationRequest::auto("a-disk", "H1"))
        .await
        .unwrap();

    assert_eq!(record.status, RemediationStatus::Failed);
    assert_eq!(record.failure_reason, Some(FailureReason::VerificationFailed));
    assert_eq!(record.verification_passed, Some(false));
    assert_eq!(record.command_results.len(), 3);
}

#[tokio::test]
async fn test_missing_telemetry_fails_verification() {
    let h = Harness::new(&test_config());
    h.alerts.fire(alert("a-disk", "H1", "disk_percent", 97.0, 90.0));

    let record = h
        .orchestrator
        .handle(RemediationRequest::auto("a-disk", "H1"))
        .await
        .unwrap();

    assert_eq!(record.status, RemediationStatus::Failed);
    assert_eq!(record.verification_passed, Some(false));
}

#[tokio::test]
async fn test_unknown_host_is_blocked() {
    let h = Harness::new(&test_config());
    h.alerts.fire(alert("a-disk", "H1", "disk_percent", 97.0, 90.0));

    let record = h
        .orchestrator
        .handle(RemediationRequest::auto("a-disk", "H-unknown"))
        .await
        .unwrap();
    assert_eq!(record.blocked_reason, Some(BlockReason::TargetUnavailable));

    let record = h
        .orchestrator
        .handle(RemediationRequest::auto("a-never-fired", "H1"))
        .await
        .unwrap();
    assert_eq!(record.blocked_reason, Some(BlockReason::TargetUnavailable));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn test_history_lists_host_records_in_order() {
    let h = Harness::new(&test_config());
    h.telemetry.set("H1", "disk_percent", 50.0);
    for id in ["a1", "a2"] {
        h.alerts.fire(alert(id, "H1", "disk_percent", 97.0, 90.0));
        h.orchestrator
            .handle(RemediationRequest::auto(id, "H1"))
            .await
            .unwrap();
    }
    h.alerts.fire(alert("a3", "H9", "cpu_percent", 97.0, 90.0));
    h.orchestrator
        .handle(RemediationRequest::auto("a3", "H9"))
        .await
        .unwrap();

    let history = h.orchestrator.list_for_host("H1").await.unwrap();
    let alerts: Vec<_> = history.iter().map(|r| r.alert_id.as_str()).collect();
    assert_eq!(alerts, vec!["a1", "a2"]);
    assert!(history.iter().all(|r| r.is_terminal()));

    assert_eq!(h.orchestrator.list_for_host("H9").await.unwrap().len(), 1);
}
