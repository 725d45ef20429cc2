// Local and remote strategies drive the same job through the same states

mod common;

use common::{collect, line_texts, wait_terminal, Fixture};

use remote_trainer::{JobSpec, JobState, JobStatus, LogCursor, StrategyKind};

#[tokio::test]
async fn test_identical_spec_identical_transitions() {
    let fx = Fixture::new(StrategyKind::Remote);
    let spec = JobSpec::new("echo \"lr=$TRAIN_LEARNING_RATE\"").with_env("TRAIN_LEARNING_RATE", "0.001");

    let mut outcomes = Vec::new();
    for kind in [StrategyKind::Local, StrategyKind::Remote] {
        let handle = fx.orchestrator.start_with(kind, spec.clone()).await.unwrap();
        assert_eq!(handle.kind(), kind);
        let status = wait_terminal(&fx.orchestrator, &handle).await;
        let events = collect(fx.orchestrator.logs(&handle, LogCursor::start(handle.job_id()))).await;
        outcomes.push((status, handle.history(), line_texts(&events)));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    let (status, history, lines) = &outcomes[0];
    assert_eq!(*status, JobStatus::Succeeded);
    assert_eq!(
        history,
        &vec![JobState::Launching, JobState::Running, JobState::Succeeded]
    );
    assert_eq!(lines, &vec!["lr=0.001".to_string()]);
}

#[tokio::test]
async fn test_identical_failure_across_strategies() {
    let fx = Fixture::new(StrategyKind::Local);
    let spec = JobSpec::new("exit 2");

    for kind in [StrategyKind::Local, StrategyKind::Remote] {
        let handle = fx.orchestrator.start_with(kind, spec.clone()).await.unwrap();
        assert_eq!(wait_terminal(&fx.orchestrator, &handle).await, JobStatus::Failed(Some(2)));
    }
}
