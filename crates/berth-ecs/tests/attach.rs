//! Attached runs stop their task exactly once, however they end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::resource_id;
use berth_ecs::api::ApiError;
use berth_ecs::attach::TASK_ARN_LABEL;
use berth_ecs::types::{ContainerDefinition, Failure, TaskDefinitionInput};
use berth_ecs::{AttachedRunner, ClusterApi, MemoryCluster, RunSpec};
use berth_scheduler::{CallContext, RunIo, SchedulerError};
use tokio::io::{AsyncReadExt, DuplexStream};

const HOST: &str = "i-0a1";

struct Fixture {
    cluster: MemoryCluster,
    runner: Arc<AttachedRunner>,
    definition: String,
}

async fn fixture(pending_timeout: Duration) -> Fixture {
    let cluster = MemoryCluster::default();
    cluster.add_host(HOST, "10.0.0.1");
    let definition = cluster
        .register_task_definition(TaskDefinitionInput {
            family: "1234--web".into(),
            containers: vec![ContainerDefinition {
                name: "web".into(),
                image: "registry.local/acme:v3".into(),
                command: vec!["./bin/web".into()],
                cpu: 256,
                memory_mib: 512,
                environment: BTreeMap::new(),
                labels: BTreeMap::new(),
                port_mappings: Vec::new(),
                ulimits: Vec::new(),
                essential: true,
                log_driver: None,
            }],
        })
        .await
        .unwrap()
        .arn;
    let api = Arc::new(cluster.clone());
    let runner = AttachedRunner::new(api.clone(), api.clone(), api, "default", pending_timeout);
    Fixture {
        cluster,
        runner: Arc::new(runner),
        definition,
    }
}

fn spec(definition: &str) -> RunSpec {
    RunSpec {
        started_by: "1234".into(),
        task_definition: definition.into(),
        container: "web".into(),
        command: vec!["bash".into()],
        environment: BTreeMap::from([("BERTH_RELEASE".into(), "v3".into())]),
    }
}

/// Caller I/O plus the read ends of stdout and stderr.
fn io() -> (RunIo, DuplexStream, DuplexStream) {
    let (stdout, stdout_reader) = tokio::io::duplex(4096);
    let (stderr, stderr_reader) = tokio::io::duplex(4096);
    (
        RunIo::new(tokio::io::empty(), stdout, stderr),
        stdout_reader,
        stderr_reader,
    )
}

async fn read_all(mut reader: DuplexStream) -> String {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn session_streams_output_and_stops_the_task() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster.set_attach_output(b"hello from the container\n");
    let (io, stdout, stderr) = io();

    let report = fx
        .runner
        .run_attached(spec(&fx.definition), io, &CallContext::background())
        .await
        .unwrap();

    assert!(report.attached);
    assert!(report.cleanup_warning.is_none());
    let stopped = fx.cluster.stop_calls();
    assert_eq!(stopped.len(), 1);
    assert_eq!(report.task_id, resource_id(&stopped[0]));

    assert_eq!(read_all(stdout).await, "hello from the container\n");
    assert_eq!(
        read_all(stderr).await,
        format!("Attaching to {}...\r\n", report.task_id)
    );

    let task = fx.cluster.task(&stopped[0]).unwrap();
    assert_eq!(task.last_status, "STOPPED");
    assert_eq!(task.started_by.as_deref(), Some("1234"));
    let env = &task.overrides[0].environment;
    assert_eq!(env["ECS_DOCKER_CONFIG_TTY"], "true");
    assert_eq!(env["ECS_DOCKER_CONFIG_OPEN_STDIN"], "true");
    assert_eq!(env["BERTH_RELEASE"], "v3");
}

#[tokio::test]
async fn attach_failure_still_stops_the_task() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster
        .fail_next("AttachToContainer", ApiError::transport("connection reset"));
    let (io, _stdout, _stderr) = io();

    let err = fx
        .runner
        .run_attached(spec(&fx.definition), io, &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::Backend {
            operation: "AttachToContainer",
            ..
        }
    ));
    assert_eq!(fx.cluster.stop_calls().len(), 1);
}

#[tokio::test]
async fn more_than_one_container_is_ambiguous() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster.hold_pending(true);
    let (io, _stdout, _stderr) = io();
    let runner = fx.runner.clone();
    let definition = fx.definition.clone();
    let run = tokio::spawn(async move {
        runner
            .run_attached(spec(&definition), io, &CallContext::background())
            .await
    });

    eventually(|| fx.cluster.calls("WaitUntilTasksNotPending") == 1).await;
    let arn = fx.cluster.live_tasks()[0].arn.clone();
    fx.cluster
        .add_container(HOST, BTreeMap::from([(TASK_ARN_LABEL.to_string(), arn.clone())]));
    fx.cluster.hold_pending(false);

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::AmbiguousContainer { found: 2, .. }
    ));
    assert_eq!(fx.cluster.stop_calls(), [arn]);
}

#[tokio::test]
async fn cancellation_while_pending_stops_the_task() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster.hold_pending(true);
    let (io, _stdout, _stderr) = io();
    let ctx = CallContext::background();
    let (runner, definition, run_ctx) = (fx.runner.clone(), fx.definition.clone(), ctx.clone());
    let run = tokio::spawn(async move {
        runner
            .run_attached(spec(&definition), io, &run_ctx)
            .await
    });

    eventually(|| fx.cluster.calls("WaitUntilTasksNotPending") == 1).await;
    ctx.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Cancelled {
            operation: "WaitUntilTasksNotPending"
        }
    ));
    assert_eq!(fx.cluster.stop_calls().len(), 1);
    assert!(fx.cluster.live_tasks().is_empty());
}

#[tokio::test]
async fn pending_timeout_stops_the_task() {
    let fx = fixture(Duration::from_millis(50)).await;
    fx.cluster.hold_pending(true);
    let (io, _stdout, _stderr) = io();

    let err = fx
        .runner
        .run_attached(spec(&fx.definition), io, &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::Timeout {
            operation: "WaitUntilTasksNotPending",
            ..
        }
    ));
    assert_eq!(fx.cluster.stop_calls().len(), 1);
}

#[tokio::test]
async fn dropped_run_stops_the_task_in_the_background() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster.block_attach(true);
    let (io, _stdout, _stderr) = io();
    let (runner, definition) = (fx.runner.clone(), fx.definition.clone());
    let run = tokio::spawn(async move {
        runner
            .run_attached(spec(&definition), io, &CallContext::background())
            .await
    });

    eventually(|| fx.cluster.calls("AttachToContainer") == 1).await;
    assert!(fx.cluster.stop_calls().is_empty());
    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    eventually(|| fx.cluster.stop_calls().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.cluster.stop_calls().len(), 1);
}

#[tokio::test]
async fn failed_stop_after_clean_session_is_a_warning() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster
        .fail_next("StopTask", ApiError::transport("connection refused"));
    let (io, _stdout, _stderr) = io();

    let report = fx
        .runner
        .run_attached(spec(&fx.definition), io, &CallContext::background())
        .await
        .unwrap();

    assert!(matches!(
        report.cleanup_warning,
        Some(SchedulerError::Cleanup { .. })
    ));
    assert_eq!(fx.cluster.stop_calls().len(), 1);
}

#[tokio::test]
async fn rejected_submission_stops_nothing() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster.add_batch_failure(
        "RunTask",
        Failure {
            arn: fx.definition.clone(),
            reason: "RESOURCE:MEMORY".into(),
        },
    );
    let (io, _stdout, _stderr) = io();

    let err = fx
        .runner
        .run_attached(spec(&fx.definition), io, &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::PartialBatchFailure {
            operation: "RunTask",
            ..
        }
    ));
    assert!(fx.cluster.stop_calls().is_empty());
}

#[tokio::test]
async fn detached_run_leaves_the_task_running() {
    let fx = fixture(Duration::from_secs(5)).await;

    let task = fx
        .runner
        .run_detached(spec(&fx.definition), &CallContext::background())
        .await
        .unwrap();

    assert!(fx.cluster.stop_calls().is_empty());
    assert_eq!(fx.cluster.calls("WaitUntilTasksNotPending"), 0);
    let live = fx.cluster.live_tasks();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].arn, task.arn);
    // Detached runs get no terminal.
    assert!(!task.overrides[0].environment.contains_key("ECS_DOCKER_CONFIG_TTY"));
}

#[tokio::test]
async fn every_session_step_failure_stops_the_task() {
    for operation in [
        "DescribeContainerInstances",
        "DescribeInstances",
        "ConnectRuntime",
        "ListContainers",
    ] {
        let fx = fixture(Duration::from_secs(5)).await;
        fx.cluster
            .fail_next(operation, ApiError::transport("connection reset"));
        let (io, _stdout, _stderr) = io();

        let err = fx
            .runner
            .run_attached(spec(&fx.definition), io, &CallContext::background())
            .await
            .unwrap_err();

        match err {
            SchedulerError::Backend { operation: failed, .. } => assert_eq!(failed, operation),
            other => panic!("{operation}: unexpected error {other:?}"),
        }
        assert_eq!(fx.cluster.stop_calls().len(), 1, "{operation}");
        assert!(fx.cluster.live_tasks().is_empty(), "{operation}");
    }
}

#[tokio::test]
async fn no_container_is_ambiguous() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster.hold_pending(true);
    let (io, _stdout, _stderr) = io();
    let (runner, definition) = (fx.runner.clone(), fx.definition.clone());
    let run = tokio::spawn(async move {
        runner
            .run_attached(spec(&definition), io, &CallContext::background())
            .await
    });

    eventually(|| fx.cluster.calls("WaitUntilTasksNotPending") == 1).await;
    fx.cluster.clear_containers(HOST);
    fx.cluster.hold_pending(false);

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::AmbiguousContainer { found: 0, .. }
    ));
    assert_eq!(fx.cluster.stop_calls().len(), 1);
}

#[tokio::test]
async fn dropping_the_run_during_its_stop_stops_once() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.cluster.hold_stops(true);
    let (io, _stdout, _stderr) = io();
    let (runner, definition) = (fx.runner.clone(), fx.definition.clone());
    let run = tokio::spawn(async move {
        runner
            .run_attached(spec(&definition), io, &CallContext::background())
            .await
    });

    eventually(|| fx.cluster.stop_calls().len() == 1).await;
    run.abort();
    let _ = run.await;
    fx.cluster.hold_stops(false);

    eventually(|| fx.cluster.live_tasks().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.cluster.stop_calls().len(), 1);
}
