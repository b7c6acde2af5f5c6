//! Tests for audit sink

use prometheus_task_lot::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event("task1", "send-email", AuditAction::Create, Some("payload".to_string()));

    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].event_id, event.event_id);
    assert_eq!(events[0].task_id, "task1");
    assert_eq!(events[0].action, AuditAction::Create);
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("task1", "a", AuditAction::Create, None));
    sink.record(build_audit_event("task2", "a", AuditAction::Start, None));
    sink.record(build_audit_event("task3", "a", AuditAction::Finish, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].task_id, "task2"); // First one popped
    assert_eq!(events[1].task_id, "task3");
}

#[test]
fn test_clones_share_the_buffer() {
    let sink = InMemoryAuditSink::new(4);
    let mut boxed: Box<dyn AuditSink> = Box::new(sink.clone());
    boxed.record(build_audit_event("task1", "a", AuditAction::Fail, None));
    boxed.record(build_audit_event("task1", "a", AuditAction::Start, None));

    assert_eq!(sink.events().len(), 2);
    assert_eq!(sink.events_for(AuditAction::Fail).len(), 1);
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event("task1", "send-email", AuditAction::Expire, Some("3".to_string()));

    assert!(event.event_id.starts_with("task1-expire-"));
    assert_eq!(event.task_id, "task1");
    assert_eq!(event.activity_code, "send-email");
    assert_eq!(event.action, AuditAction::Expire);
    assert_eq!(event.detail, Some("3".to_string()));
    assert!(event.created_at_ms > 0);
}
