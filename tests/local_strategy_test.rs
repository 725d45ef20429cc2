// Integration tests for the local strategy
//
// Jobs run as child processes of the test; state lives in a temp dir.

mod common;

use common::{collect, line_texts, wait_terminal, Fixture};
use futures::StreamExt;

use remote_trainer::job::TrainingParams;
use remote_trainer::{JobSpec, JobState, JobStatus, LogCursor, LogEvent, OrchestratorError, StrategyKind};

#[tokio::test]
async fn test_local_job_lifecycle_and_logs() {
    let fx = Fixture::new(StrategyKind::Local);
    let handle = fx
        .orchestrator
        .start(JobSpec::new("sh train.sh; echo done"))
        .await
        .unwrap();
    assert_eq!(handle.kind(), StrategyKind::Local);
    assert!(handle.pid() > 0);

    assert_eq!(wait_terminal(&fx.orchestrator, &handle).await, JobStatus::Succeeded);
    assert_eq!(
        handle.history(),
        vec![JobState::Launching, JobState::Running, JobState::Succeeded]
    );

    let events = collect(fx.orchestrator.logs(&handle, LogCursor::start(handle.job_id()))).await;
    assert_eq!(line_texts(&events), vec!["training", "done"]);
}

#[tokio::test]
async fn test_local_failure_is_a_status_not_an_error() {
    let fx = Fixture::new(StrategyKind::Local);
    let handle = fx.orchestrator.start(JobSpec::new("exit 7")).await.unwrap();
    assert_eq!(wait_terminal(&fx.orchestrator, &handle).await, JobStatus::Failed(Some(7)));
}

#[tokio::test]
async fn test_local_training_params_reach_the_command() {
    let fx = Fixture::new(StrategyKind::Local);
    let mut params = TrainingParams::new("qwen-0.5b");
    params.epochs = 5;
    let spec = params
        .into_job_spec("echo \"$TRAIN_MODEL_ID $TRAIN_EPOCHS $TRAIN_BATCH_SIZE $TRAIN_USE_LORA\"")
        .unwrap();

    let handle = fx.orchestrator.start(spec).await.unwrap();
    wait_terminal(&fx.orchestrator, &handle).await;
    assert_eq!(
        fx.orchestrator.tail(&handle, 1).await.unwrap(),
        vec!["qwen-0.5b 5 4 true"]
    );

    let job_json = std::path::Path::new(handle.run_dir()).join("job.json");
    let written: JobSpec = serde_json::from_slice(&std::fs::read(job_json).unwrap()).unwrap();
    assert_eq!(&written, handle.spec());
}

#[tokio::test]
async fn test_local_cancel_twice() {
    let fx = Fixture::new(StrategyKind::Local);
    let handle = fx.orchestrator.start(JobSpec::new("sleep 30")).await.unwrap();
    assert_eq!(fx.orchestrator.status(&handle).await, JobStatus::Running);

    fx.orchestrator.cancel(&handle).await.unwrap();
    assert_eq!(handle.status(), JobStatus::Cancelled);
    let history = handle.history();

    fx.orchestrator.cancel(&handle).await.unwrap();
    assert_eq!(handle.history(), history);
}

#[tokio::test]
async fn test_local_stream_follows_running_job() {
    let fx = Fixture::new(StrategyKind::Local);
    let handle = fx
        .orchestrator
        .start(JobSpec::new("echo a; sleep 0.3; echo b; sleep 0.3; printf c"))
        .await
        .unwrap();

    let mut stream = fx.orchestrator.logs(&handle, LogCursor::start(handle.job_id()));
    let mut texts = Vec::new();
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            LogEvent::Line(line) => texts.push(line.text),
            LogEvent::Gap(cursor) => panic!("unexpected gap at {}", cursor.offset),
        }
    }
    // The unterminated last line is flushed once the job is done
    assert_eq!(texts, vec!["a", "b", "c"]);
    assert!(handle.state().is_terminal());
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_before_launch() {
    let fx = Fixture::new(StrategyKind::Local);
    let result = fx.orchestrator.start(JobSpec::new("  ")).await;
    assert!(matches!(result, Err(OrchestratorError::InvalidConfig(_))));
    assert!(fx.orchestrator.jobs().unwrap().is_empty());
}
