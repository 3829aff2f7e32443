//! Deployment lifecycle against a scripted remote host

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use deploy_api::{DeploymentListQuery, PortCheckRequest};
use deployd::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use deployd::errors::DeploydError;
use deployd::models::deployment::{FailureKind, LogStream, TriggerSource};
use deployd::workers::deployer;

use crate::support::{self, harness, Harness, PORT_CHECK_LABEL, PROJECT};

const BUILD: &str = "npm ci && npm run build";
const START: &str = "node server.js";

async fn wait_for_lease(h: &Harness, deployment_id: &str) {
    let deployment = h.store().get_deployment(deployment_id).unwrap().unwrap();
    for _ in 0..200 {
        if let Some(lease) = h.store().get_lease(&deployment.target()).unwrap() {
            if lease.deployment_id == deployment_id {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("deployment {} never took its lease", deployment_id);
}

#[tokio::test]
async fn test_happy_path_runs_steps_in_order() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app/", Some(3000));
    assert_eq!(deployment.deployment_path, "/srv/app");
    assert_eq!(deployment.status, DeploymentStatus::Pending);

    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Deployed);
    assert!(finished.failure.is_none());
    assert!(finished.started_at.is_some() && finished.completed_at.is_some());

    assert_eq!(
        h.remote.executed(),
        vec![BUILD, PORT_CHECK_LABEL, "stop previous instance", START, "wait for port 3000"]
    );
    assert_eq!(h.remote.connections(), 1);
    assert!(h.store().get_lease(&finished.target()).unwrap().is_none());

    let lines = h.store().read_logs(&deployment.id, 0, 1000).unwrap();
    assert!(lines.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(lines
        .iter()
        .any(|l| l.stream == LogStream::Stdout && l.line == format!("ran {}", BUILD)));
    assert!(lines.iter().any(|l| l.line == format!("$ {}", START)));
    assert_eq!(lines.last().unwrap().line, "deployment succeeded");
}

#[tokio::test]
async fn test_without_port_uses_liveness_check() {
    let h = harness();
    let deployment = h.create_deployment("/srv/worker", None);

    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Deployed);
    let executed = h.remote.executed();
    assert!(!executed.iter().any(|l| l == PORT_CHECK_LABEL));
    assert_eq!(executed.last().unwrap(), "liveness check");
}

#[tokio::test]
async fn test_build_failure_stops_before_activation() {
    let h = harness();
    h.remote.fail_step(BUILD, 2);
    let deployment = h.create_deployment("/srv/app", Some(3000));

    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Failed);
    let failure = finished.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::BuildFailure);
    assert_eq!(failure.command.as_deref(), Some(BUILD));
    assert_eq!(failure.exit_code, Some(2));

    assert_eq!(h.remote.executed(), vec![BUILD]);
    let log = h.log_text(&deployment.id);
    assert!(log.iter().any(|l| l == &format!("{}: simulated failure", BUILD)));
    assert_eq!(log.last().unwrap(), &format!("command failed (exit 2): {}", BUILD));
}

#[tokio::test]
async fn test_activation_failure_is_recorded() {
    let h = harness();
    h.remote.fail_step(START, 1);
    let deployment = h.create_deployment("/srv/app", None);

    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Failed);
    assert_eq!(finished.failure.unwrap().kind, FailureKind::ActivationFailure);
    assert!(!h.remote.executed().iter().any(|l| l == "liveness check"));
}

#[tokio::test]
async fn test_port_conflict_leaves_occupant_alone() {
    let h = harness();
    h.remote.set_probe("BUSY 4242/nginx");
    let deployment = h.create_deployment("/srv/app", Some(80));

    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Failed);
    let failure = finished.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::PortConflict);
    assert!(failure.message.contains("4242/nginx"));

    // nothing was stopped or started after the probe
    assert_eq!(h.remote.executed(), vec![BUILD, PORT_CHECK_LABEL]);
    let log = h.log_text(&deployment.id);
    assert!(log.last().unwrap().starts_with("deployment failed:"));
}

#[tokio::test]
async fn test_port_held_by_previous_instance_is_reused() {
    let h = harness();
    h.remote.set_probe("SELF 1717/node");
    let deployment = h.create_deployment("/srv/app", Some(3000));

    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Deployed);
    assert!(h
        .log_text(&deployment.id)
        .iter()
        .any(|l| l == "port 3000 is held by the previous instance"));
}

#[tokio::test]
async fn test_unreachable_server_fails_with_ssh_error() {
    let h = harness();
    h.remote.set_unreachable(true);
    let deployment = h.create_deployment("/srv/app", None);

    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Failed);
    assert_eq!(finished.failure.as_ref().unwrap().kind, FailureKind::SshConnection);
    assert!(h.remote.executed().is_empty());
    assert!(h.store().get_lease(&finished.target()).unwrap().is_none());
}

#[tokio::test]
async fn test_same_target_is_exclusive() {
    let h = harness();
    h.remote.set_step_delay(Duration::from_millis(200));
    let first = h.create_deployment("/srv/app", None);
    let second = h.create_deployment("/srv/app/", None);

    let executor = h.app.executor.clone();
    let first_id = first.id.clone();
    let running = tokio::spawn(async move { executor.execute(&first_id).await });
    wait_for_lease(&h, &first.id).await;

    let busy = h.app.executor.execute(&second.id).await.unwrap();
    assert_eq!(busy.status, DeploymentStatus::Failed);
    assert_eq!(busy.failure.unwrap().kind, FailureKind::TargetBusy);

    let finished = running.await.unwrap().unwrap();
    assert_eq!(finished.status, DeploymentStatus::Deployed);
}

#[tokio::test]
async fn test_spellings_of_one_path_share_a_target() {
    let h = harness();
    let a = h.create_deployment("~/app", None);
    let b = h.create_deployment("/home/deploy/./app/", None);
    assert_eq!(a.target(), b.target());
}

#[tokio::test]
async fn test_different_targets_run_concurrently() {
    let h = harness();
    h.remote.set_step_delay(Duration::from_millis(100));
    let a = h.create_deployment("/srv/a", None);
    let b = h.create_deployment("/srv/b", None);

    let (ra, rb) = tokio::join!(h.app.executor.execute(&a.id), h.app.executor.execute(&b.id));
    assert_eq!(ra.unwrap().status, DeploymentStatus::Deployed);
    assert_eq!(rb.unwrap().status, DeploymentStatus::Deployed);
}

#[tokio::test]
async fn test_executor_skips_non_pending() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);
    h.app.executor.execute(&deployment.id).await.unwrap();
    let executed = h.remote.executed().len();

    let again = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(again.status, DeploymentStatus::Deployed);
    assert_eq!(h.remote.executed().len(), executed);
}

#[tokio::test]
async fn test_execute_enqueues_and_redeploys_terminal() {
    let mut h = harness();
    let deployment = h.create_deployment("/srv/app", None);

    let queued = h.app.deployments.execute(PROJECT, &deployment.id).unwrap();
    assert!(queued.queued_at.is_some());
    assert_eq!(h.queue.recv().await.unwrap(), deployment.id);

    h.app.executor.execute(&deployment.id).await.unwrap();
    let successor = h.app.deployments.execute(PROJECT, &deployment.id).unwrap();
    assert_ne!(successor.id, deployment.id);
    assert_eq!(successor.status, DeploymentStatus::Pending);
    assert_eq!(successor.triggered_by, TriggerSource::Redeploy);
    assert_eq!(successor.predecessor_id.as_deref(), Some(deployment.id.as_str()));
    assert_eq!(successor.deployment_path, deployment.deployment_path);
    assert_eq!(h.queue.recv().await.unwrap(), successor.id);

    // the predecessor keeps its outcome
    let predecessor = h.app.deployments.get(PROJECT, &deployment.id).unwrap();
    assert_eq!(predecessor.status, DeploymentStatus::Deployed);
}

#[tokio::test]
async fn test_execute_rejects_running_deployment() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);
    h.store()
        .apply_deployment_event(&deployment.id, DeploymentEvent::Start)
        .unwrap();

    let err = h.app.deployments.execute(PROJECT, &deployment.id).unwrap_err();
    assert!(matches!(err, DeploydError::Conflict(_)));
}

#[tokio::test]
async fn test_delete_rules() {
    let h = harness();

    let pending = h.create_deployment("/srv/a", None);
    h.app.deployments.delete(PROJECT, &pending.id).unwrap();
    assert!(h.store().get_deployment(&pending.id).unwrap().is_none());

    let running = h.create_deployment("/srv/b", None);
    h.store()
        .apply_deployment_event(&running.id, DeploymentEvent::Start)
        .unwrap();
    assert!(matches!(
        h.app.deployments.delete(PROJECT, &running.id),
        Err(DeploydError::Conflict(_))
    ));

    let done = h.create_deployment("/srv/c", None);
    h.app.executor.execute(&done.id).await.unwrap();
    assert!(!h.log_text(&done.id).is_empty());
    h.app.deployments.delete(PROJECT, &done.id).unwrap();
    assert!(h.log_text(&done.id).is_empty());

    // other projects cannot see it at all
    let other = h.create_deployment("/srv/d", None);
    assert!(matches!(
        h.app.deployments.delete("project-2", &other.id),
        Err(DeploydError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_create_validation() {
    let h = harness();

    let mut request = h.deployment_request("/srv/app", None);
    request.web_server_id = "missing".to_string();
    assert!(matches!(
        h.app.deployments.create(PROJECT, request),
        Err(DeploydError::TargetNotFound(_))
    ));

    let request = h.deployment_request("relative/path", None);
    assert!(matches!(
        h.app.deployments.create(PROJECT, request),
        Err(DeploydError::ValidationError(_))
    ));

    let mut request = h.deployment_request("/srv/app", None);
    request.commit_hash = Some("not-a-sha".to_string());
    assert!(matches!(
        h.app.deployments.create(PROJECT, request),
        Err(DeploydError::ValidationError(_))
    ));

    let mut request = h.deployment_request("/srv/app", None);
    request.install_option = None;
    assert!(matches!(
        h.app.deployments.create(PROJECT, request),
        Err(DeploydError::ValidationError(_))
    ));

    // the server belongs to another project
    let request = h.deployment_request("/srv/app", None);
    assert!(matches!(
        h.app.deployments.create("project-2", request),
        Err(DeploydError::TargetNotFound(_))
    ));
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let h = harness();
    let done = h.create_deployment("/srv/a", None);
    h.app.executor.execute(&done.id).await.unwrap();
    h.create_deployment("/srv/b", None);

    let all = h.app.deployments.list(PROJECT, &DeploymentListQuery::default()).unwrap();
    assert_eq!(all.len(), 2);

    let query = DeploymentListQuery {
        repository_id: None,
        status: Some("deployed".to_string()),
    };
    let deployed = h.app.deployments.list(PROJECT, &query).unwrap();
    assert_eq!(deployed.len(), 1);
    assert_eq!(deployed[0].id, done.id);

    let bad = DeploymentListQuery {
        repository_id: None,
        status: Some("running".to_string()),
    };
    assert!(h.app.deployments.list(PROJECT, &bad).is_err());
}

#[tokio::test]
async fn test_logs_page_and_completion() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);
    h.app.executor.execute(&deployment.id).await.unwrap();

    let first = h.app.deployments.logs(PROJECT, &deployment.id, None, Some(2)).unwrap();
    assert_eq!(first.lines.len(), 2);
    assert!(!first.complete);
    assert_eq!(first.next_cursor, 2);

    let rest = h
        .app
        .deployments
        .logs(PROJECT, &deployment.id, Some(first.next_cursor), None)
        .unwrap();
    assert!(rest.complete);
    assert_eq!(rest.lines.first().unwrap().seq, 3);
    assert_eq!(rest.status, DeploymentStatus::Deployed);
}

#[tokio::test]
async fn test_port_check_is_read_only_and_repeatable() {
    let h = harness();
    h.remote.set_probe("BUSY 99/postgres");
    let request = PortCheckRequest {
        web_server_id: h.server_id.clone(),
        port: 5432,
        deployment_path: None,
    };

    let first = h.app.deployments.check_port(PROJECT, &request).await.unwrap();
    let second = h.app.deployments.check_port(PROJECT, &request).await.unwrap();
    assert_eq!(first, second);
    assert!(!first.available);
    assert_eq!(first.occupying_process.as_deref(), Some("99/postgres"));
    assert_eq!(h.remote.executed(), vec![PORT_CHECK_LABEL, PORT_CHECK_LABEL]);

    h.remote.set_probe("FREE");
    let free = h.app.deployments.check_port(PROJECT, &request).await.unwrap();
    assert!(free.available && !free.owned_by_target);

    let zero = PortCheckRequest { port: 0, ..request };
    assert!(matches!(
        h.app.deployments.check_port(PROJECT, &zero).await,
        Err(DeploydError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_deployer_worker_runs_queued_deployments() {
    let mut h = harness();
    let queue = std::mem::replace(&mut h.queue, mpsc::unbounded_channel().1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let options = h.options.deployer.clone();
    let (executor, store) = (h.app.executor.clone(), h.store().clone());
    let worker = tokio::spawn(async move {
        let shutdown = Box::pin(async move {
            let _ = stop_rx.await;
        });
        deployer::run(&options, executor, store, queue, shutdown).await
    });

    let deployment = h.create_deployment("/srv/app", None);
    h.app.deployments.execute(PROJECT, &deployment.id).unwrap();

    let mut status = DeploymentStatus::Pending;
    for _ in 0..200 {
        status = h.app.deployments.get(PROJECT, &deployment.id).unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, DeploymentStatus::Deployed);

    stop_tx.send(()).unwrap();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_queued_deployments_resume_after_restart() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);
    h.app.deployments.execute(PROJECT, &deployment.id).unwrap();

    // a fresh worker with an empty queue still finds it
    let (_tx, queue) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let options = h.options.deployer.clone();
    let (executor, store) = (Arc::clone(&h.app.executor), h.store().clone());
    let worker = tokio::spawn(async move {
        let shutdown = Box::pin(async move {
            let _ = stop_rx.await;
        });
        deployer::run(&options, executor, store, queue, shutdown).await
    });

    let mut status = DeploymentStatus::Pending;
    for _ in 0..200 {
        status = h.store().get_deployment(&deployment.id).unwrap().unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, DeploymentStatus::Deployed);

    stop_tx.send(()).unwrap();
    worker.await.unwrap();
}

const COMMIT: &str = "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";

#[tokio::test]
async fn test_repository_deployment_fetches_pinned_commit_with_token() {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let h = harness();
    let mut request = h.repository_request("acme/shop", false);
    request.is_private = true;
    request.access_token = Some("ghp_deploytoken".to_string());
    let repo = h.app.repositories.create(PROJECT, request).unwrap().repository;

    let deployment = h.create_repository_deployment(&repo.id, Some(COMMIT));
    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Deployed);

    let fetch = format!("git fetch {}", COMMIT);
    assert_eq!(
        h.remote.executed(),
        vec![
            fetch.as_str(),
            "npm ci",
            PORT_CHECK_LABEL,
            "stop previous instance",
            "npm start",
            "wait for port 3000"
        ]
    );

    // the token travels on stdin, never on a command line
    let expected = format!(
        "Authorization: Basic {}\n",
        STANDARD.encode("x-access-token:ghp_deploytoken")
    );
    assert_eq!(h.remote.stdin_seen(), vec![expected]);
    assert!(!h.log_text(&deployment.id).iter().any(|l| l.contains("ghp_deploytoken")));
}

#[tokio::test]
async fn test_repository_deployment_stages_deploy_key() {
    let h = harness();
    let mut request = h.repository_request("acme/private-api", false);
    request.is_private = true;
    request.ssh_key_id = Some(h.key_id.clone());
    let repo = h.app.repositories.create(PROJECT, request).unwrap().repository;

    let deployment = h.create_repository_deployment(&repo.id, None);
    assert_eq!(deployment.branch, "main");
    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    assert_eq!(finished.status, DeploymentStatus::Deployed);

    // no commit pinned: the branch head is fetched
    assert_eq!(h.remote.executed()[0], "git fetch main");
    let stdin = h.remote.stdin_seen();
    assert_eq!(stdin.len(), 1);
    assert!(stdin[0].contains("OPENSSH PRIVATE KEY"));
}

#[tokio::test]
async fn test_failed_fetch_is_a_build_failure() {
    let h = harness();
    let repo = h.create_repository("acme/shop", false).repository;
    let fetch = format!("git fetch {}", COMMIT);
    h.remote.fail_step(&fetch, 128);

    let deployment = h.create_repository_deployment(&repo.id, Some(COMMIT));
    let finished = h.app.executor.execute(&deployment.id).await.unwrap();
    let failure = finished.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::BuildFailure);
    assert_eq!(failure.command.as_deref(), Some(fetch.as_str()));
    assert_eq!(h.remote.executed(), vec![fetch]);
}

#[tokio::test]
async fn test_redeploy_checks_references_again() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);
    h.app.executor.execute(&deployment.id).await.unwrap();

    h.app.web_servers.delete(PROJECT, &h.server_id).unwrap();
    assert!(matches!(
        h.app.deployments.execute(PROJECT, &deployment.id),
        Err(DeploydError::TargetNotFound(_))
    ));
    let all = h.app.deployments.list(PROJECT, &DeploymentListQuery::default()).unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_redeploy_of_inactive_repository_is_refused() {
    let h = harness();
    let repo = h.create_repository("acme/shop", false).repository;
    let deployment = h.create_repository_deployment(&repo.id, Some(COMMIT));
    h.app.executor.execute(&deployment.id).await.unwrap();

    h.app.repositories.delete(PROJECT, &repo.id).unwrap();
    assert!(matches!(
        h.app.deployments.execute(PROJECT, &deployment.id),
        Err(DeploydError::RepositoryNotFound(_))
    ));
}

#[tokio::test]
async fn test_server_delete_waits_for_unfinished_deployments() {
    let h = harness();
    let deployment = h.create_deployment("/srv/app", None);

    // pending
    assert!(matches!(
        h.app.web_servers.delete(PROJECT, &h.server_id),
        Err(DeploydError::Conflict(_))
    ));

    // running
    h.store()
        .apply_deployment_event(&deployment.id, DeploymentEvent::Start)
        .unwrap();
    assert!(matches!(
        h.app.web_servers.delete(PROJECT, &h.server_id),
        Err(DeploydError::Conflict(_))
    ));
    assert!(h.store().get_web_server(&h.server_id).unwrap().is_some());

    h.store()
        .apply_deployment_event(&deployment.id, DeploymentEvent::BuildSucceeded)
        .unwrap();
    h.store()
        .apply_deployment_event(&deployment.id, DeploymentEvent::Activated)
        .unwrap();
    h.app.web_servers.delete(PROJECT, &h.server_id).unwrap();
    assert!(h.store().get_web_server(&h.server_id).unwrap().is_none());
}

#[tokio::test]
async fn test_deployment_deleted_while_waiting_for_target() {
    let mut settings = support::settings();
    settings.executor.lock_wait_secs = 5;
    let h = support::harness_with(settings);
    h.remote.set_step_delay(Duration::from_millis(100));
    let first = h.create_deployment("/srv/app", None);
    let second = h.create_deployment("/srv/app", None);

    let executor = h.app.executor.clone();
    let first_id = first.id.clone();
    let running = tokio::spawn(async move { executor.execute(&first_id).await });
    wait_for_lease(&h, &first.id).await;

    let executor = h.app.executor.clone();
    let second_id = second.id.clone();
    let waiting = tokio::spawn(async move { executor.execute(&second_id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.app.deployments.delete(PROJECT, &second.id).unwrap();

    assert_eq!(running.await.unwrap().unwrap().status, DeploymentStatus::Deployed);
    assert!(matches!(waiting.await.unwrap(), Err(DeploydError::NotFound(_))));
    assert!(h.store().get_lease(&first.target()).unwrap().is_none());
    assert!(h.log_text(&second.id).is_empty());
}
