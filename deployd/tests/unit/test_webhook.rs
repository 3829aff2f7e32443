//! Webhook gateway scenarios

use serde_json::json;

use deploy_api::{CreateDeploymentRequest, DeployPendingRequest};
use deployd::deploy::fsm::DeploymentStatus;
use deployd::errors::DeploydError;
use deployd::github::webhook::{sign, WebhookOutcome};
use deployd::models::deployment::TriggerSource;

use crate::support::{harness, Harness, PROJECT};

const COMMIT: &str = "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";

fn push_body(branch: &str, commit: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": format!("refs/heads/{}", branch),
        "after": commit,
        "head_commit": { "id": commit, "message": "Fix login redirect" },
        "pusher": { "name": "octocat" },
        "repository": { "full_name": "acme/shop" }
    }))
    .unwrap()
}

fn deliver(h: &Harness, repo_id: &str, secret: &str, event: &str, body: &[u8]) -> Result<WebhookOutcome, DeploydError> {
    let signature = sign(secret.as_bytes(), body).unwrap();
    h.app.webhooks.handle(repo_id, Some(event), Some(&signature), body)
}

fn deploy_first(h: &Harness, repo_id: &str) -> String {
    let request = CreateDeploymentRequest {
        github_repository_id: Some(repo_id.to_string()),
        web_server_id: h.server_id.clone(),
        ssh_key_id: None,
        branch: None,
        commit_hash: None,
        install_option: None,
        install_option_name: None,
        port: None,
        deployment_path: None,
        environment: Default::default(),
    };
    h.app.deployments.create(PROJECT, request).unwrap().id
}

#[tokio::test]
async fn test_ping_and_ignored_events() {
    let h = harness();
    let created = h.create_repository("acme/shop", false);
    let repo_id = created.repository.id.as_str();
    let secret = created.webhook_secret.as_str();

    assert_eq!(deliver(&h, repo_id, secret, "ping", b"{}").unwrap(), WebhookOutcome::Pong);
    assert!(matches!(
        deliver(&h, repo_id, secret, "issues", b"{}").unwrap(),
        WebhookOutcome::Ignored(_)
    ));
    assert!(matches!(
        deliver(&h, repo_id, secret, "push", &push_body("feature/x", COMMIT)).unwrap(),
        WebhookOutcome::Ignored(_)
    ));

    let deleted = serde_json::to_vec(&json!({
        "ref": "refs/heads/main",
        "after": "0000000000000000000000000000000000000000",
        "deleted": true
    }))
    .unwrap();
    assert!(matches!(
        deliver(&h, repo_id, secret, "push", &deleted).unwrap(),
        WebhookOutcome::Ignored(_)
    ));

    let repo = h.store().get_repository(repo_id).unwrap().unwrap();
    assert!(repo.pending_update.is_none());
    assert!(repo.last_commit_hash.is_none());
}

#[tokio::test]
async fn test_bad_signatures_change_nothing() {
    let h = harness();
    let created = h.create_repository("acme/shop", true);
    let repo_id = created.repository.id.as_str();
    let body = push_body("main", COMMIT);

    // wrong secret
    assert!(matches!(
        deliver(&h, repo_id, "not-the-secret", "push", &body),
        Err(DeploydError::InvalidSignature)
    ));

    // signed, then tampered
    let signature = sign(created.webhook_secret.as_bytes(), &body).unwrap();
    let tampered = push_body("main", "ffffffffffffffffffffffffffffffffffffffff");
    assert!(matches!(
        h.app.webhooks.handle(repo_id, Some("push"), Some(&signature), &tampered),
        Err(DeploydError::InvalidSignature)
    ));

    // unsigned
    assert!(matches!(
        h.app.webhooks.handle(repo_id, Some("push"), None, &body),
        Err(DeploydError::InvalidSignature)
    ));

    let repo = h.store().get_repository(repo_id).unwrap().unwrap();
    assert!(repo.pending_update.is_none());
    assert!(repo.last_commit_hash.is_none());
    assert!(h.store().list_deployments(|_| true).unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_repository() {
    let h = harness();
    let body = push_body("main", COMMIT);
    assert!(matches!(
        deliver(&h, "no-such-repo", "secret", "push", &body),
        Err(DeploydError::RepositoryNotFound(_))
    ));
}

#[tokio::test]
async fn test_auto_deploy_copies_latest_deployment() {
    let mut h = harness();
    let created = h.create_repository("acme/shop", true);
    let repo_id = created.repository.id.clone();
    let template_id = deploy_first(&h, &repo_id);
    let template = h.store().get_deployment(&template_id).unwrap().unwrap();
    assert_eq!(template.deployment_path, "/srv/shop");
    assert_eq!(template.install_option.start_command, "npm start");

    let outcome = deliver(&h, &repo_id, &created.webhook_secret, "push", &push_body("main", COMMIT)).unwrap();
    let WebhookOutcome::DeploymentCreated { deployment_id, commit_hash } = outcome else {
        panic!("expected a deployment, got {:?}", outcome);
    };
    assert_eq!(commit_hash, COMMIT);

    let deployment = h.store().get_deployment(&deployment_id).unwrap().unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Pending);
    assert_eq!(deployment.commit_hash, COMMIT);
    assert_eq!(deployment.branch, "main");
    assert_eq!(deployment.triggered_by, TriggerSource::Webhook);
    assert_eq!(deployment.predecessor_id.as_deref(), Some(template_id.as_str()));
    assert_eq!(deployment.target(), template.target());
    assert!(deployment.queued_at.is_some());
    assert_eq!(h.queue.recv().await.unwrap(), deployment_id);

    let repo = h.store().get_repository(&repo_id).unwrap().unwrap();
    assert_eq!(repo.last_commit_hash.as_deref(), Some(COMMIT));
    assert!(repo.pending_update.is_none());
}

#[tokio::test]
async fn test_auto_deploy_without_history_records_pending_update() {
    let h = harness();
    let created = h.create_repository("acme/shop", true);
    let repo_id = created.repository.id.as_str();

    let outcome = deliver(&h, repo_id, &created.webhook_secret, "push", &push_body("main", COMMIT)).unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::PendingUpdateRecorded {
            commit_hash: COMMIT.to_string()
        }
    );
}

#[tokio::test]
async fn test_pending_update_then_deploy_pending() {
    let mut h = harness();
    let created = h.create_repository("acme/shop", false);
    let repo_id = created.repository.id.clone();
    let secret = created.webhook_secret.clone();

    let older = "1111111111111111111111111111111111111111";
    deliver(&h, &repo_id, &secret, "push", &push_body("main", older)).unwrap();
    deliver(&h, &repo_id, &secret, "push", &push_body("main", COMMIT)).unwrap();

    // the newest push wins
    let info = h.app.repositories.webhook_info(PROJECT, &repo_id).unwrap();
    let marker = info.pending_update.unwrap();
    assert_eq!(marker.commit_hash, COMMIT);
    assert_eq!(marker.pusher, "octocat");
    assert_eq!(marker.message.as_deref(), Some("Fix login redirect"));
    assert!(h.store().list_deployments(|_| true).unwrap().is_empty());

    // without any previous deployment a server must be named
    let err = h
        .app
        .deployments
        .deploy_pending(PROJECT, &repo_id, DeployPendingRequest::default())
        .unwrap_err();
    assert!(matches!(err, DeploydError::ValidationError(_)));
    assert!(h.store().get_repository(&repo_id).unwrap().unwrap().pending_update.is_some());

    let request = DeployPendingRequest {
        web_server_id: Some(h.server_id.clone()),
        deployment_path: Some("/srv/shop-live".to_string()),
    };
    let deployment = h.app.deployments.deploy_pending(PROJECT, &repo_id, request.clone()).unwrap();
    assert_eq!(deployment.commit_hash, COMMIT);
    assert_eq!(deployment.triggered_by, TriggerSource::PendingUpdate);
    assert_eq!(deployment.deployment_path, "/srv/shop-live");
    assert_eq!(h.queue.recv().await.unwrap(), deployment.id);

    // the marker was consumed exactly once
    assert!(h.store().get_repository(&repo_id).unwrap().unwrap().pending_update.is_none());
    assert!(matches!(
        h.app.deployments.deploy_pending(PROJECT, &repo_id, request),
        Err(DeploydError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_failed_deploy_pending_restores_marker() {
    let h = harness();
    let created = h.create_repository("acme/shop", false);
    let repo_id = created.repository.id.clone();
    deliver(&h, &repo_id, &created.webhook_secret, "push", &push_body("main", COMMIT)).unwrap();

    let request = DeployPendingRequest {
        web_server_id: Some(h.server_id.clone()),
        deployment_path: Some("relative/dir".to_string()),
    };
    assert!(matches!(
        h.app.deployments.deploy_pending(PROJECT, &repo_id, request),
        Err(DeploydError::ValidationError(_))
    ));

    let marker = h.store().get_repository(&repo_id).unwrap().unwrap().pending_update;
    assert_eq!(marker.unwrap().commit_hash, COMMIT);
}

#[tokio::test]
async fn test_push_runs_to_deployed_at_pushed_commit() {
    let mut h = harness();
    let created = h.create_repository("acme/shop", true);
    let repo_id = created.repository.id.clone();
    let template_id = deploy_first(&h, &repo_id);
    h.app.executor.execute(&template_id).await.unwrap();

    let outcome = deliver(&h, &repo_id, &created.webhook_secret, "push", &push_body("main", COMMIT)).unwrap();
    let WebhookOutcome::DeploymentCreated { deployment_id, .. } = outcome else {
        panic!("expected a deployment, got {:?}", outcome);
    };
    assert_eq!(h.queue.recv().await.unwrap(), deployment_id);

    let finished = h.app.executor.execute(&deployment_id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Deployed);
    assert_eq!(finished.commit_hash, COMMIT);
    assert!(h
        .remote
        .executed()
        .contains(&format!("git fetch {}", COMMIT)));
    assert_eq!(
        h.app.deployments.get(PROJECT, &template_id).unwrap().status,
        DeploymentStatus::Deployed
    );
}

#[tokio::test]
async fn test_push_with_deleted_target_creates_nothing() {
    let h = harness();
    let created = h.create_repository("acme/shop", true);
    let repo_id = created.repository.id.clone();
    let template_id = deploy_first(&h, &repo_id);
    h.app.executor.execute(&template_id).await.unwrap();
    h.app.web_servers.delete(PROJECT, &h.server_id).unwrap();

    let result = deliver(&h, &repo_id, &created.webhook_secret, "push", &push_body("main", COMMIT));
    assert!(matches!(result, Err(DeploydError::TargetNotFound(_))));
    assert_eq!(h.store().list_deployments(|_| true).unwrap().len(), 1);
}
