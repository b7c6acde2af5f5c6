//! Tests for tokio spawner utilities and the API surface

use std::sync::Arc;

use prometheus_task_lot::core::{Activity, Scheduler, SchedulerOptions, Spawn, TaskStatus};
use prometheus_task_lot::infra::InMemoryTaskStore;
use prometheus_task_lot::runtime::tokio_spawner::TokioSpawner;
use prometheus_task_lot::runtime::{health, snapshot, submit_task, task_status, TaskSubmission};
use prometheus_task_lot::util::TaskId;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_tokio_spawner_owned_runtime() {
    let spawner = TokioSpawner::with_worker_threads(2).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    spawner.spawn(async move {
        tx.send("done").unwrap();
    });
    assert_eq!(rx.recv().unwrap(), "done");
}

#[tokio::test]
async fn test_api_submit_and_status() {
    let scheduler = Scheduler::new(
        Arc::new(InMemoryTaskStore::new()),
        TokioSpawner::current(),
        SchedulerOptions::default(),
    );
    scheduler
        .register(
            Activity::builder("echo")
                .process_fn(|task| async move { Ok(task.input) })
                .build()
                .unwrap(),
        )
        .unwrap();

    let view = submit_task(
        &scheduler,
        TaskSubmission {
            activity_code: "echo".to_string(),
            input: serde_json::json!([1, 2]),
        },
    )
    .await
    .unwrap();
    assert_eq!(view.status, TaskStatus::Idle);

    scheduler.process_and_wait().await.unwrap();
    let view = task_status(&scheduler, &view.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Finished);
    assert_eq!(view.result, Some(serde_json::json!([1, 2])));

    assert!(task_status(&scheduler, &TaskId::from("missing")).await.is_err());
    assert!(submit_task(
        &scheduler,
        TaskSubmission {
            activity_code: "unknown".to_string(),
            input: serde_json::Value::Null,
        },
    )
    .await
    .is_err());

    let snap = snapshot(&scheduler).await.unwrap();
    assert_eq!(snap.counts["FINISHED"], 1);
    assert_eq!(snap.counts["IDLE"], 0);
    assert_eq!(snap.activities.len(), 1);
    assert_eq!(snap.task_limit, 5);

    let health = health(&scheduler).await;
    assert!(health.ok);
    assert_eq!(health.backend, "memory");
}
