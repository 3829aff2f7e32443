//! FSM unit tests

use deployd::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use deployd::errors::DeploydError;
use deployd::models::deployment::{DeploymentFailure, FailureKind};

use crate::support::harness;

fn fail(kind: FailureKind) -> DeploymentEvent {
    DeploymentEvent::Fail(DeploymentFailure::new(kind, "test error"))
}

#[test]
fn test_fsm_success_flow() {
    let state = DeploymentStatus::Pending;

    // Pending -> Building
    let state = state.next(&DeploymentEvent::Start).unwrap();
    assert_eq!(state, DeploymentStatus::Building);
    assert!(state.is_active());

    // Building -> Deploying
    let state = state.next(&DeploymentEvent::BuildSucceeded).unwrap();
    assert_eq!(state, DeploymentStatus::Deploying);

    // Deploying -> Deployed
    let state = state.next(&DeploymentEvent::Activated).unwrap();
    assert_eq!(state, DeploymentStatus::Deployed);
    assert!(state.is_terminal());
}

#[test]
fn test_fsm_invalid_transitions() {
    assert!(matches!(
        DeploymentStatus::Pending.next(&DeploymentEvent::Activated),
        Err(DeploydError::InternalStateError(_))
    ));
    assert!(DeploymentStatus::Deployed.next(&DeploymentEvent::Start).is_err());
    assert!(DeploymentStatus::Failed.next(&DeploymentEvent::Start).is_err());
    assert!(DeploymentStatus::Failed.next(&fail(FailureKind::Internal)).is_err());
}

#[test]
fn test_status_serializes_lowercase() {
    let json = serde_json::to_string(&DeploymentStatus::Deploying).unwrap();
    assert_eq!(json, "\"deploying\"");
    let parsed: DeploymentStatus = serde_json::from_str("\"failed\"").unwrap();
    assert_eq!(parsed, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_store_stamps_transitions() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);
    assert!(deployment.started_at.is_none());

    let started = h
        .store()
        .apply_deployment_event(&deployment.id, DeploymentEvent::Start)
        .unwrap();
    assert_eq!(started.status, DeploymentStatus::Building);
    assert!(started.started_at.is_some());
    assert!(started.completed_at.is_none());

    let failed = h
        .store()
        .apply_deployment_event(&deployment.id, fail(FailureKind::BuildFailure))
        .unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.failure.unwrap().kind, FailureKind::BuildFailure);
    assert!(failed.completed_at.is_some());
}

#[tokio::test]
async fn test_rejected_event_leaves_record_untouched() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);

    let err = h
        .store()
        .apply_deployment_event(&deployment.id, DeploymentEvent::Activated)
        .unwrap_err();
    assert!(matches!(err, DeploydError::InternalStateError(_)));

    let stored = h.store().get_deployment(&deployment.id).unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Pending);
    assert!(stored.started_at.is_none());
}

#[tokio::test]
async fn test_log_frozen_once_terminal() {
    use deployd::models::deployment::LogStream;

    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);
    let store = h.store();

    assert_eq!(store.append_log(&deployment.id, LogStream::System, "one").unwrap(), 1);
    assert_eq!(store.append_log(&deployment.id, LogStream::Stdout, "two").unwrap(), 2);
    store
        .apply_deployment_event(&deployment.id, fail(FailureKind::Internal))
        .unwrap();

    assert!(matches!(
        store.append_log(&deployment.id, LogStream::System, "late"),
        Err(DeploydError::InternalStateError(_))
    ));
    let lines = store.read_logs(&deployment.id, 1, 10).unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].line, "two");
}
