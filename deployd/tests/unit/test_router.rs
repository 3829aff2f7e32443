//! HTTP surface through the full router

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

use deployd::authn::caller_token::Role;
use deployd::github::webhook::{sign, EVENT_HEADER, SIGNATURE_HEADER};
use deployd::server::serve::router;

use crate::support::{harness, token, Harness, PROJECT};

struct Api {
    router: Router,
    _stopping: watch::Sender<bool>,
}

impl Api {
    fn new(h: &Harness) -> Self {
        let (stopping_tx, stopping_rx) = watch::channel(false);
        let state = Arc::new(h.app.server_state(stopping_rx));
        Self {
            router: router(&h.options.server.api_prefix, state),
            _stopping: stopping_tx,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }
}

fn project_uri(path: &str) -> String {
    format!("/api/v1/projects/{}{}", PROJECT, path)
}

#[tokio::test]
async fn test_health_is_public() {
    let h = harness();
    let api = Api::new(&h);
    let (status, body) = api.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "deployd");
}

#[tokio::test]
async fn test_caller_must_be_project_admin() {
    let h = harness();
    let api = Api::new(&h);
    let uri = project_uri("/web-servers");

    let (status, body) = api.call(Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = api.call(Method::GET, &uri, Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let developer = token(Role::Developer, &[PROJECT]);
    let (status, body) = api.call(Method::GET, &uri, Some(developer.as_str()), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let outsider = token(Role::Admin, &["project-2"]);
    let (status, _) = api.call(Method::GET, &uri, Some(outsider.as_str()), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = token(Role::Admin, &[PROJECT]);
    let (status, body) = api.call(Method::GET, &uri, Some(admin.as_str()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], h.server_id.as_str());

    let root = token(Role::Superadmin, &[]);
    let (status, _) = api.call(Method::GET, &uri, Some(root.as_str()), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_secrets_never_leave_the_api() {
    let h = harness();
    let api = Api::new(&h);
    let admin = token(Role::Admin, &[PROJECT]);

    let (status, body) = api
        .call(Method::GET, &project_uri(&format!("/ssh-keys/{}", h.key_id)), Some(admin.as_str()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["public_key"].as_str().unwrap().starts_with("ssh-ed25519 "));
    assert!(body.get("private_key").is_none());
    assert!(body.get("encrypted_private_key").is_none());

    let (status, body) = api
        .call(
            Method::POST,
            &project_uri("/github-repositories"),
            Some(admin.as_str()),
            Some(json!({ "full_name": "acme/shop", "access_token": "ghp_secret" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["webhook_secret"].as_str().unwrap().len(), 64);
    assert_eq!(body["has_access_token"], true);
    assert!(!body.to_string().contains("ghp_secret"));

    let repo_id = body["id"].as_str().unwrap().to_string();
    let (status, body) = api
        .call(Method::GET, &project_uri(&format!("/github-repositories/{}", repo_id)), Some(admin.as_str()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("webhook_secret").is_none());
    assert!(body.get("encrypted_webhook_secret").is_none());
}

#[tokio::test]
async fn test_deployment_routes() {
    let h = harness();
    let api = Api::new(&h);
    let admin = token(Role::Admin, &[PROJECT]);

    let (status, body) = api
        .call(
            Method::POST,
            &project_uri("/deployments"),
            Some(admin.as_str()),
            Some(json!({
                "web_server_id": h.server_id,
                "deployment_path": "/srv/app",
                "install_option": { "name": "node", "start_command": "node server.js", "port": 3000 }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["port"], 3000);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = api
        .call(Method::POST, &project_uri(&format!("/deployments/{}/execute", id)), Some(admin.as_str()), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["queued_at"].is_string());

    let (status, body) = api
        .call(Method::GET, &project_uri(&format!("/deployments/{}/status", id)), Some(admin.as_str()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");

    h.app.executor.execute(&id).await.unwrap();
    let (status, body) = api
        .call(Method::GET, &project_uri(&format!("/deployments/{}/logs?limit=1", id)), Some(admin.as_str()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lines"].as_array().unwrap().len(), 1);
    assert_eq!(body["next_cursor"], 1);
    assert_eq!(body["status"], "deployed");

    let (status, body) = api
        .call(Method::GET, &project_uri("/deployments/nope"), Some(admin.as_str()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = api
        .call(Method::DELETE, &project_uri(&format!("/deployments/{}", id)), Some(admin.as_str()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_busy_port_check_route() {
    let h = harness();
    h.remote.set_probe("BUSY 12/redis-server");
    let api = Api::new(&h);
    let admin = token(Role::Admin, &[PROJECT]);

    let (status, body) = api
        .call(
            Method::POST,
            &project_uri("/deployments/check-port"),
            Some(admin.as_str()),
            Some(json!({ "web_server_id": h.server_id, "port": 6379 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], false);
    assert_eq!(body["occupying_process"], "12/redis-server");
}

#[tokio::test]
async fn test_repository_not_found_is_uniform() {
    let h = harness();
    let api = Api::new(&h);
    let admin = token(Role::Admin, &[PROJECT]);

    let (status, body) = api
        .call(Method::GET, &project_uri("/github-repositories/missing/webhook"), Some(admin.as_str()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Repository not found");

    let (status, body) = api
        .call(Method::POST, "/api/v1/deploy/webhook/missing", None, Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Repository not found");
}

#[tokio::test]
async fn test_webhook_route() {
    let h = harness();
    let created = h.create_repository("acme/shop", false);
    let api = Api::new(&h);
    let uri = format!("/api/v1/deploy/webhook/{}", created.repository.id);
    let body = serde_json::to_vec(&json!({
        "ref": "refs/heads/main",
        "after": "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3",
        "pusher": { "name": "octocat" }
    }))
    .unwrap();

    let signed = |signature: String| {
        Request::builder()
            .method(Method::POST)
            .uri(uri.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, "push")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.clone()))
            .unwrap()
    };

    let (status, response) = api.send(signed("sha256=00ff".to_string())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["code"], "invalid_signature");

    let signature = sign(created.webhook_secret.as_bytes(), &body).unwrap();
    let (status, response) = api.send(signed(signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["result"], "pending_update_recorded");
    assert_eq!(response["commit_hash"], "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3");
}
