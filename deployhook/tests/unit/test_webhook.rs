//! Webhook endpoint tests, driven through the router

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use secrecy::SecretString;
use tokio::sync::Notify;
use tower::ServiceExt;

use deployhook::authn::signature::{sign, SignatureAlgorithm, SignatureVerifier};
use deployhook::deploy::coordinator::DeploymentCoordinator;
use deployhook::deploy::executor::{DeploymentExecutor, ExecutorOptions};
use deployhook::deploy::gate::GateOptions;
use deployhook::deploy::launcher::{
    CommandLauncher, CommandSpec, ExitState, LaunchLimits, LaunchReport,
};
use deployhook::server::serve::build_router;
use deployhook::server::state::ServerState;
use deployhook::storage::settings::ExecutionPolicy;

const SECRET: &str = "It's a Secret to Everybody";

/// Counts launches and optionally holds each one until released
struct CountingLauncher {
    exit: ExitState,
    hold: bool,
    launches: AtomicUsize,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl CommandLauncher for CountingLauncher {
    async fn launch(&self, _spec: &CommandSpec, _limits: LaunchLimits) -> LaunchReport {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.hold {
            self.started.notify_one();
            self.release.notified().await;
        }
        LaunchReport {
            exit: self.exit.clone(),
            stdout: b"Already up to date.\n".to_vec(),
            stderr: b"secret internal detail\n".to_vec(),
            truncated: false,
        }
    }
}

struct Harness {
    router: Router,
    launcher: Arc<CountingLauncher>,
    coordinator: Arc<DeploymentCoordinator>,
}

impl Harness {
    fn new(policy: ExecutionPolicy, exit: ExitState, hold: bool) -> Self {
        let coordinator = Arc::new(DeploymentCoordinator::new());
        let launcher = Arc::new(CountingLauncher {
            exit,
            hold,
            launches: AtomicUsize::new(0),
            started: Notify::new(),
            release: Notify::new(),
        });
        let executor = Arc::new(DeploymentExecutor::with_launcher(
            ExecutorOptions {
                command: "/srv/app/scripts/update_and_restart.sh".to_string(),
                ..Default::default()
            },
            coordinator.clone(),
            launcher.clone(),
        ));
        let state = ServerState::new(
            Arc::new(SignatureVerifier::new(
                SecretString::from(SECRET.to_string()),
                false,
            )),
            GateOptions::default(),
            policy,
            executor,
        );
        let router = build_router(Arc::new(state))
            .layer(MockConnectInfo(SocketAddr::from(([198, 51, 100, 23], 53211))));

        Self {
            router,
            launcher,
            coordinator,
        }
    }

    fn launches(&self) -> usize {
        self.launcher.launches.load(Ordering::SeqCst)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, String) {
        let response = tokio_test::assert_ok!(self.router.clone().oneshot(request).await);
        let status = response.status();
        let body = tokio_test::assert_ok!(to_bytes(response.into_body(), usize::MAX).await);
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    async fn wait_until_free(&self) {
        for _ in 0..100 {
            if !self.coordinator.is_busy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment slot was never released");
    }
}

fn push_body(git_ref: &str, message: Option<&str>) -> String {
    serde_json::json!({
        "ref": git_ref,
        "head_commit": message.map(|m| serde_json::json!({ "message": m })),
    })
    .to_string()
}

fn signed(path: &str, body: &str) -> Request<Body> {
    let signature = sign(SignatureAlgorithm::Sha256, body.as_bytes(), SECRET.as_bytes());
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-hub-signature-256", signature)
        .header("x-github-delivery", "72d3162e-cc78-11e3-81ab-4c9367dc0958")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_push_to_main_deploys_once() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);

    let (status, _) = harness
        .send(signed("/webhook", &push_body("refs/heads/main", Some("fix login form"))))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(harness.launches(), 1);
    assert!(!harness.coordinator.is_busy());
}

#[tokio::test]
async fn test_both_paths_serve_the_webhook() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);

    let (status, _) = harness
        .send(signed("/backend-webhook", &push_body("refs/heads/main", None)))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(harness.launches(), 1);
}

#[tokio::test]
async fn test_push_to_other_branch_takes_no_action() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);

    let (status, body) = harness
        .send(signed("/webhook", &push_body("refs/heads/feature-x", None)))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        "Push to refs/heads/feature-x is not refs/heads/main, no action taken"
    );
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_skip_marker_takes_no_action() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);

    let (status, body) = harness
        .send(signed(
            "/webhook",
            &push_body("refs/heads/main", Some("[LOGS_UPDATE] nightly rotate")),
        ))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("[LOGS_UPDATE]"));
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_invalid_signature_is_unauthorized() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);
    let body = push_body("refs/heads/main", None);
    let forged = sign(SignatureAlgorithm::Sha256, body.as_bytes(), b"wrong secret");

    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("x-hub-signature-256", forged)
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _) = harness.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhook")
        .body(Body::from(body))
        .unwrap();
    let (status, _) = harness.send(unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_signature_checked_before_gating() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);
    let bodies = [
        push_body("refs/heads/feature-x", None),
        push_body("refs/heads/main", Some("[LOGS_UPDATE] nightly rotate")),
    ];

    for body in bodies {
        let forged = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(
                "x-hub-signature-256",
                sign(SignatureAlgorithm::Sha256, body.as_bytes(), b"wrong secret"),
            )
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, text) = harness.send(forged).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{body}");
        assert!(!text.contains("no action taken"), "{body}");

        let unsigned = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, text) = harness.send(unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{body}");
        assert!(!text.contains("no action taken"), "{body}");
    }

    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_signature_covers_exact_bytes() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);
    let body = push_body("refs/heads/main", None);
    let signature = sign(SignatureAlgorithm::Sha256, body.as_bytes(), SECRET.as_bytes());

    // Same JSON document, different bytes
    let reformatted = format!("{} ", body);
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("x-hub-signature-256", signature)
        .body(Body::from(reformatted))
        .unwrap();

    let (status, _) = harness.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_legacy_signature_refused_by_default() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);
    let body = push_body("refs/heads/main", None);
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(
            "x-hub-signature",
            sign(SignatureAlgorithm::Sha1, body.as_bytes(), SECRET.as_bytes()),
        )
        .body(Body::from(body))
        .unwrap();

    let (status, _) = harness.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);

    for body in ["not json", "{}", r#"{"ref": 42}"#, "[]"] {
        let (status, _) = harness.send(signed("/webhook", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    }
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_failed_command_is_server_error_without_output() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(1), false);

    let (status, body) = harness
        .send(signed("/webhook", &push_body("refs/heads/main", None)))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.contains("secret internal detail"));
    assert_eq!(harness.launches(), 1);
    assert!(!harness.coordinator.is_busy());
}

#[tokio::test]
async fn test_timed_out_command_is_server_error() {
    let harness = Harness::new(
        ExecutionPolicy::Wait,
        ExitState::TimedOut(Duration::from_secs(600)),
        false,
    );

    let (status, _) = harness
        .send(signed("/webhook", &push_body("refs/heads/main", None)))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!harness.coordinator.is_busy());
}

#[tokio::test]
async fn test_concurrent_pushes_deploy_once() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), true);
    let body = push_body("refs/heads/main", None);

    let router = harness.router.clone();
    let first_request = signed("/webhook", &body);
    let first = tokio::spawn(async move { router.oneshot(first_request).await });

    // The first deployment is now holding the slot
    harness.launcher.started.notified().await;
    let (status, body_text) = harness.send(signed("/webhook", &body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body_text, "Deployment already in progress");

    harness.launcher.release.notify_one();
    let response = tokio_test::assert_ok!(tokio_test::assert_ok!(first.await));
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(harness.launches(), 1);
    assert!(!harness.coordinator.is_busy());
}

#[tokio::test]
async fn test_detached_policy_accepts_and_releases() {
    let harness = Harness::new(ExecutionPolicy::Detach, ExitState::Exited(0), true);
    let body = push_body("refs/heads/main", None);

    let (status, _) = harness.send(signed("/webhook", &body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    harness.launcher.started.notified().await;
    let (status, _) = harness.send(signed("/webhook", &body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    harness.launcher.release.notify_one();
    harness.wait_until_free().await;
    assert_eq!(harness.launches(), 1);
}

#[tokio::test]
async fn test_health_reports_deployment_in_progress() {
    let harness = Harness::new(ExecutionPolicy::Detach, ExitState::Exited(0), true);

    let health = || {
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = harness.send(health()).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["deploying"], false);

    harness
        .send(signed("/webhook", &push_body("refs/heads/main", None)))
        .await;
    harness.launcher.started.notified().await;

    let (status, body) = harness.send(health()).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["deploying"], true);
    assert!(!body.contains("refs/heads"));
    assert_eq!(
        json.as_object().map(|fields| fields.len()),
        Some(4),
        "{body}"
    );

    harness.launcher.release.notify_one();
    harness.wait_until_free().await;
}

#[tokio::test]
async fn test_version_endpoint() {
    let harness = Harness::new(ExecutionPolicy::Wait, ExitState::Exited(0), false);
    let request = Request::builder()
        .uri("/version")
        .body(Body::empty())
        .unwrap();

    let (status, body) = harness.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}
