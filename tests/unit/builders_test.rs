//! Tests for builder modules

use std::sync::Arc;

use prometheus_task_lot::builders::SchedulerBuilder;
use prometheus_task_lot::config::{ActivityConfig, SchedulerConfig};
use prometheus_task_lot::core::{
    Activity, ActivityMode, InMemoryAuditSink, NewTaskRequest, TaskStatus,
};
use prometheus_task_lot::infra::InMemoryTaskStore;
use prometheus_task_lot::runtime::TokioSpawner;
use prometheus_task_lot::util::Priority;

fn config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.activities.insert(
        "resize".to_string(),
        ActivityConfig {
            mode: ActivityMode::Batch,
            priority: Priority::new(4).unwrap(),
            ..ActivityConfig::default()
        },
    );
    config
}

#[tokio::test]
async fn test_scheduler_builder_registers_configured_activities() {
    let audit = InMemoryAuditSink::new(16);
    let scheduler = SchedulerBuilder::new(config(), TokioSpawner::current())
        .process_fn("resize", |task| async move { Ok(task.input) })
        .activity(
            Activity::builder("ping")
                .process_fn(|_| async { Ok(serde_json::json!("pong")) })
                .build()
                .unwrap(),
        )
        .store(Arc::new(InMemoryTaskStore::new()))
        .audit(Box::new(audit.clone()))
        .build()
        .unwrap();

    let resize = scheduler.registry().require("resize").unwrap();
    assert_eq!(resize.mode(), ActivityMode::Batch);
    assert_eq!(resize.priority().value(), 4);
    assert!(scheduler.registry().get("ping").is_some());

    let task = scheduler
        .create_task(NewTaskRequest::new("resize", serde_json::json!({ "w": 64 })))
        .await
        .unwrap();
    assert_eq!(task.priority.value(), 4);
    let settled = scheduler.process_and_wait().await.unwrap();
    assert_eq!(settled[0].status, TaskStatus::Finished);
    assert_eq!(audit.events().len(), 3);
}

#[tokio::test]
async fn test_scheduler_builder_requires_process_for_each_activity() {
    let result = SchedulerBuilder::new(config(), TokioSpawner::current()).build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_scheduler_builder_rejects_unconfigured_process() {
    let result = SchedulerBuilder::new(config(), TokioSpawner::current())
        .process_fn("resize", |task| async move { Ok(task.input) })
        .process_fn("typo", |task| async move { Ok(task.input) })
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_scheduler_builder_rejects_invalid_config() {
    let config = SchedulerConfig {
        task_limit: 0,
        ..SchedulerConfig::default()
    };
    assert!(SchedulerBuilder::new(config, TokioSpawner::current()).build().is_err());
}
