//! Task aggregation against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_core::{App, Constraints, Manifest, NameScheme, Process, TaskState};
use berth_ecs::aggregator::{DEFAULT_VERSION, UNMANAGED_HOST};
use berth_ecs::types::{ContainerOverride, Failure, RunTaskRequest};
use berth_ecs::{ClusterApi, MemoryCluster, TaskAggregator, TaskDefinitionBuilder};
use berth_scheduler::manager::RELEASE_ENV;
use berth_scheduler::{CallContext, SchedulerError};

fn manifest() -> Manifest {
    let mut worker = Process::new("worker", vec!["./bin/worker".to_string()]);
    worker.constraints = Constraints::TWO_X;
    Manifest {
        app: App {
            id: "1234".into(),
            name: "acme".into(),
            image: "registry.local/acme:v7".into(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        },
        release: "v7".into(),
        processes: vec![worker],
    }
}

/// Register the worker definition and start `count` one-off tasks of it.
async fn start_tasks(
    cluster: &MemoryCluster,
    count: u32,
    tag_release: bool,
    command: Vec<String>,
) -> String {
    let manifest = manifest();
    let builder = TaskDefinitionBuilder::new(NameScheme::default(), None);
    let mut input = builder.build(&manifest, &manifest.processes[0]);
    if !tag_release {
        input.containers[0].environment.remove(RELEASE_ENV);
    }
    let definition = cluster.register_task_definition(input).await.unwrap();
    cluster
        .run_task(RunTaskRequest {
            cluster: "default".into(),
            task_definition: definition.arn.clone(),
            started_by: "1234".into(),
            count,
            overrides: vec![ContainerOverride {
                name: "worker".into(),
                command,
                environment: BTreeMap::new(),
            }],
        })
        .await
        .unwrap();
    definition.arn
}

fn aggregator(cluster: &MemoryCluster) -> TaskAggregator {
    TaskAggregator::new(Arc::new(cluster.clone()), "default")
}

#[tokio::test]
async fn describes_in_bounded_batches() {
    let cluster = MemoryCluster::default().with_page_size(100);
    cluster.add_host("i-0a1", "10.0.0.1");
    start_tasks(&cluster, 250, true, Vec::new()).await;

    let tasks = aggregator(&cluster)
        .tasks("1234", &BTreeMap::new(), &CallContext::background())
        .await
        .unwrap();

    assert_eq!(tasks.len(), 250);
    assert_eq!(cluster.batch_sizes("DescribeTasks"), [100, 100, 50]);
    assert_eq!(cluster.calls("ListTasks"), 3);
    // One distinct task definition, one lookup.
    assert_eq!(cluster.calls("DescribeTaskDefinition"), 1);
    assert_eq!(cluster.batch_sizes("DescribeContainerInstances"), [1]);
    assert!(tasks.iter().all(|t| t.host.id == "i-0a1"));
}

#[tokio::test]
async fn task_view_is_assembled_from_its_definition() {
    let cluster = MemoryCluster::default();
    cluster.add_host("i-0a1", "10.0.0.1");
    start_tasks(&cluster, 1, true, vec!["rake".into(), "db:migrate".into()]).await;

    let tasks = aggregator(&cluster)
        .tasks("1234", &BTreeMap::new(), &CallContext::background())
        .await
        .unwrap();

    let task = &tasks[0];
    assert_eq!(task.version, "v7");
    assert_eq!(task.process_type, "worker");
    assert_eq!(task.name, format!("v7.worker.{}", task.id));
    assert_eq!(task.command, ["rake", "db:migrate"]);
    assert_eq!(task.constraints, Constraints::TWO_X);
    assert_eq!(task.state, TaskState::Pending);
    assert!(task.updated_at.is_some());
}

#[tokio::test]
async fn sentinels_fill_missing_host_and_release() {
    let cluster = MemoryCluster::default();
    start_tasks(&cluster, 2, false, Vec::new()).await;

    let tasks = aggregator(&cluster)
        .tasks("1234", &BTreeMap::new(), &CallContext::background())
        .await
        .unwrap();

    assert_eq!(tasks.len(), 2);
    for task in &tasks {
        assert_eq!(task.host.id, UNMANAGED_HOST);
        assert_eq!(task.version, DEFAULT_VERSION);
        // Empty override command keeps the definition's command.
        assert_eq!(task.command, ["./bin/worker"]);
    }
    assert_eq!(cluster.calls("DescribeContainerInstances"), 0);
}

#[tokio::test]
async fn a_failure_entry_fails_the_whole_call() {
    let cluster = MemoryCluster::default();
    start_tasks(&cluster, 3, true, Vec::new()).await;
    cluster.add_batch_failure(
        "DescribeTasks",
        Failure {
            arn: "arn:aws:ecs:us-east-1:000000000000:task/default/gone".into(),
            reason: "MISSING".into(),
        },
    );

    let err = aggregator(&cluster)
        .tasks("1234", &BTreeMap::new(), &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::PartialBatchFailure {
            operation: "DescribeTasks",
            ref reason,
            ..
        } if reason == "MISSING"
    ));
}

#[tokio::test]
async fn unknown_app_has_no_tasks() {
    let cluster = MemoryCluster::default();
    start_tasks(&cluster, 2, true, Vec::new()).await;

    let tasks = aggregator(&cluster)
        .tasks("9999", &BTreeMap::new(), &CallContext::background())
        .await
        .unwrap();

    assert!(tasks.is_empty());
    assert_eq!(cluster.calls("DescribeTasks"), 0);
}

#[tokio::test]
async fn cancelled_context_stops_before_listing() {
    let cluster = MemoryCluster::default();
    let ctx = CallContext::background();
    ctx.cancel();

    let err = aggregator(&cluster)
        .tasks("1234", &BTreeMap::new(), &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::Cancelled { operation: "ListTasks" }));
    assert_eq!(cluster.calls("ListTasks"), 0);
}

#[tokio::test]
async fn a_container_instance_left_out_of_the_response_fails_the_call() {
    let cluster = MemoryCluster::default();
    let ci = cluster.add_host("i-0a1", "10.0.0.1");
    start_tasks(&cluster, 2, true, Vec::new()).await;
    cluster.omit_container_instance(&ci);

    let err = aggregator(&cluster)
        .tasks("1234", &BTreeMap::new(), &CallContext::background())
        .await
        .unwrap_err();

    match err {
        SchedulerError::PartialBatchFailure {
            operation,
            item,
            reason,
        } => {
            assert_eq!(operation, "DescribeContainerInstances");
            assert_eq!(item, ci);
            assert_eq!(reason, "MISSING");
        }
        other => panic!("unexpected error {other:?}"),
    }
}
