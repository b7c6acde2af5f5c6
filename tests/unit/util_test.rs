//! Tests for utility functions

use std::time::Duration;

use prometheus_task_lot::util::{Clock, ManualClock, Priority, TaskId};

#[test]
fn test_priority_ordering() {
    assert!(Priority::HIGHEST > Priority::LOWEST);
    assert!(Priority::new(5).unwrap() > Priority::new(4).unwrap());
    assert_eq!(Priority::default(), Priority::LOWEST);
}

#[test]
fn test_priority_range() {
    assert_eq!(Priority::new(9).map(Priority::value), Some(9));
    assert!(Priority::new(10).is_none());
    assert!(serde_json::from_str::<Priority>("12").is_err());
    assert_eq!(serde_json::to_string(&Priority::new(3).unwrap()).unwrap(), "3");
}

#[test]
fn test_task_id() {
    let a = TaskId::generate();
    let b = TaskId::generate();
    assert_ne!(a, b);
    assert_eq!(TaskId::from("abc").as_str(), "abc");
    assert_eq!(serde_json::to_string(&TaskId::from("abc")).unwrap(), "\"abc\"");
}

#[test]
fn test_manual_clock() {
    let clock = ManualClock::new(1_000);
    let shared = clock.clone();
    clock.advance(Duration::from_secs(2));
    assert_eq!(shared.now_ms(), 3_000);
    shared.set(10);
    assert_eq!(clock.now_ms(), 10);
}
