//! Executor tests against real child processes

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use deployhook::deploy::coordinator::DeploymentCoordinator;
use deployhook::deploy::executor::{DeploymentExecutor, ExecutorOptions, RunContext};
use deployhook::models::deployment::{CommandFailure, RunOutcome};

fn executor(script: &str, timeout: Option<Duration>) -> DeploymentExecutor {
    let options = ExecutorOptions {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        timeout,
        ..Default::default()
    };
    DeploymentExecutor::new(options, Arc::new(DeploymentCoordinator::new()))
}

fn context() -> RunContext {
    RunContext {
        target_ref: Some("refs/heads/main".to_string()),
        delivery_id: Some("72d3162e-cc78-11e3-81ab-4c9367dc0958".to_string()),
    }
}

#[tokio::test]
async fn test_successful_deployment() {
    let executor = executor(
        "echo \"deploying $DEPLOYHOOK_REF\"; echo 'npm WARN deprecated' >&2",
        Some(Duration::from_secs(10)),
    );

    let run = executor.execute(&context()).await;

    assert!(run.is_success());
    assert_eq!(run.exit_code, Some(0));
    assert_eq!(run.stdout_lossy(), "deploying refs/heads/main\n");
    assert_eq!(run.stderr_lossy(), "npm WARN deprecated\n");
    assert!(!executor.coordinator().is_busy());
}

#[tokio::test]
async fn test_lock_released_on_every_failure() {
    let cases = [
        ("exit 1", Some(Duration::from_secs(10))),
        ("sleep 30", Some(Duration::from_millis(200))),
    ];
    for (script, timeout) in cases {
        let executor = executor(script, timeout);
        let run = executor.execute(&context()).await;
        assert!(
            matches!(run.outcome, RunOutcome::CommandFailed(_)),
            "{script}: {:?}",
            run.outcome
        );
        assert!(!executor.coordinator().is_busy(), "{script}");
        assert!(executor.try_begin().is_some(), "{script}");
    }

    let missing = DeploymentExecutor::new(
        ExecutorOptions {
            command: "/nonexistent/update_and_restart.sh".to_string(),
            ..Default::default()
        },
        Arc::new(DeploymentCoordinator::new()),
    );
    let run = missing.execute(&context()).await;
    assert!(matches!(
        run.outcome,
        RunOutcome::CommandFailed(CommandFailure::Spawn(_))
    ));
    assert!(!missing.coordinator().is_busy());
}

#[tokio::test]
async fn test_timeout_is_classified() {
    let executor = executor("sleep 30", Some(Duration::from_millis(200)));

    let run = executor.execute(&context()).await;

    assert_eq!(
        run.outcome,
        RunOutcome::CommandFailed(CommandFailure::Timeout(Duration::from_millis(200)))
    );
    assert_eq!(run.exit_code, None);
    assert!(run.duration < Duration::from_secs(10));
}

#[tokio::test]
async fn test_timeout_stops_every_step_of_the_script() {
    let dir = std::env::temp_dir().join(format!("deployhook-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let marker = dir.join("built");

    let script = format!(
        "sh -c 'sleep 2; echo built > {}'; echo done",
        marker.display()
    );
    let executor = executor(&script, Some(Duration::from_millis(300)));

    let run = executor.execute(&context()).await;
    assert_eq!(
        run.outcome,
        RunOutcome::CommandFailed(CommandFailure::Timeout(Duration::from_millis(300)))
    );
    assert!(!executor.coordinator().is_busy());

    // Past the point where the nested step would have finished
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!tokio::fs::try_exists(&marker).await.unwrap());

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_overlapping_runs_spawn_once() {
    let dir = std::env::temp_dir().join(format!("deployhook-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let marker = dir.join("spawns");

    let script = format!("echo run >> {}; sleep 1", marker.display());
    let executor = Arc::new(executor(&script, Some(Duration::from_secs(10))));

    let first = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.execute(&context()).await })
    };
    while !executor.coordinator().is_busy() {
        tokio::task::yield_now().await;
    }
    let second = executor.execute(&context()).await;
    let first = first.await.unwrap();

    assert_eq!(second.outcome, RunOutcome::Rejected);
    assert!(first.is_success());

    let spawns = tokio::fs::read_to_string(&marker).await.unwrap();
    assert_eq!(spawns.lines().count(), 1);
    assert!(!executor.coordinator().is_busy());

    let _ = tokio::fs::remove_dir_all(&dir).await;
}
