// Integration tests against a real SSH host
//
// Set SSH_HOSTNAME, SSH_USERNAME, SSH_KEY_FILENAME (and optionally SSH_PORT,
// SSH_REMOTE_WORKSPACE) and run with `--ignored`.

use std::time::Duration;
use tempfile::TempDir;

use remote_trainer::config::{apply_env_overrides, OrchestratorConfig};
use remote_trainer::{JobSpec, JobStatus, LogCursor, Orchestrator, StrategyKind};
use futures::StreamExt;

fn ssh_orchestrator(state: &TempDir) -> Orchestrator {
    let local = state.path().join("workspace");
    std::fs::create_dir_all(&local).unwrap();
    std::fs::write(local.join("hello.sh"), "echo hello from $(hostname)\n").unwrap();

    let mut config = OrchestratorConfig {
        training_mode: StrategyKind::Remote,
        local_workspace: local,
        state_dir: state.path().join("state"),
        ..OrchestratorConfig::default()
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok()).unwrap();
    Orchestrator::new(config).unwrap()
}

#[tokio::test]
#[ignore] // Requires a reachable SSH host
async fn test_ssh_check_connection() {
    let state = TempDir::new().unwrap();
    let orchestrator = ssh_orchestrator(&state);
    let report = orchestrator.remote().check_connection().await;
    assert!(report.connected, "{:?}", report.error);
}

#[tokio::test]
#[ignore] // Requires a reachable SSH host
async fn test_ssh_job_lifecycle() {
    let state = TempDir::new().unwrap();
    let orchestrator = ssh_orchestrator(&state);

    let handle = orchestrator.start(JobSpec::new("sh hello.sh; sleep 1")).await.unwrap();
    let mut stream = orchestrator.logs(&handle, LogCursor::start(handle.job_id()));
    let first = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(first, remote_trainer::LogEvent::Line(ref l) if l.text.starts_with("hello from")));
    drop(stream);

    let mut status = orchestrator.status(&handle).await;
    for _ in 0..60 {
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        status = orchestrator.status(&handle).await;
    }
    assert_eq!(status, JobStatus::Succeeded);

    let second = orchestrator.remote().sync_workspace().await.unwrap();
    assert_eq!(second.bytes_transferred, 0);
    orchestrator.release(handle).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires a reachable SSH host
async fn test_ssh_cancel() {
    let state = TempDir::new().unwrap();
    let orchestrator = ssh_orchestrator(&state);

    let handle = orchestrator.start(JobSpec::new("sleep 120")).await.unwrap();
    orchestrator.cancel(&handle).await.unwrap();
    assert_eq!(handle.status(), JobStatus::Cancelled);
    orchestrator.cancel(&handle).await.unwrap();
}
