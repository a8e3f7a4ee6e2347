use std::sync::Arc;

use taskweave::activities::EventSink;
use taskweave::event_bus::{EventBus, EventType, WorkflowEvent};

fn progress(workflow_id: &str, seq: u64) -> WorkflowEvent {
    WorkflowEvent::new(workflow_id, EventType::Progress, format!("step {}", seq)).with_seq(seq)
}

// Every published logical index appears exactly once, even when a retried
// step republishes the same indexes.
#[tokio::test]
async fn test_exactly_once_per_logical_index() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe("wf");

    for seq in 1..=3 {
        bus.publish(progress("wf", seq));
    }
    // A retry republishes indexes 2 and 3.
    bus.publish(progress("wf", 2));
    bus.publish(progress("wf", 3));
    bus.publish(progress("wf", 4));

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(sub.recv().await.unwrap().event.seq);
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);
    assert!(sub.try_recv().is_none());
}

// Two subscribers each get the full stream; a later subscriber with a cursor
// replays from the retained ring.
#[tokio::test]
async fn test_fan_out_and_cursor_restart() {
    let bus = EventBus::new();
    let mut early = bus.subscribe("wf");
    for seq in 1..=6 {
        bus.publish(progress("wf", seq));
    }

    let mut late = bus.subscribe_from("wf", 4);
    for expected in 1..=6 {
        assert_eq!(early.recv().await.unwrap().event.seq, expected);
    }
    for expected in 4..=6 {
        assert_eq!(late.recv().await.unwrap().event.seq, expected);
    }
}

// Overflow drops oldest events and the next delivery is marked lossy so the
// consumer can detect the gap (seq numbers expose it too).
#[tokio::test]
async fn test_overflow_marks_subscriber_lossy() {
    let bus = EventBus::with_capacity(3, 64);
    let mut sub = bus.subscribe("wf");
    for seq in 1..=10 {
        bus.publish(progress("wf", seq));
    }

    let first = sub.recv().await.unwrap();
    assert_eq!(first.event.seq, 8);
    assert!(first.lossy);

    let second = sub.recv().await.unwrap();
    assert_eq!(second.event.seq, 9);
    assert!(!second.lossy);
}

// Workflows are isolated: publishing to one never reaches another's
// subscribers, and removal only tears down its own topic.
#[tokio::test]
async fn test_workflow_isolation_and_cleanup() {
    let bus = EventBus::new();
    let mut sub_a = bus.subscribe("wf-a");
    let mut sub_b = bus.subscribe("wf-b");

    bus.publish(progress("wf-a", 1));
    bus.publish(progress("wf-b", 1));

    assert_eq!(sub_a.recv().await.unwrap().event.workflow_id, "wf-a");
    assert_eq!(sub_b.recv().await.unwrap().event.workflow_id, "wf-b");

    bus.remove_workflow("wf-a");
    assert!(sub_a.recv().await.is_none());
    bus.publish(progress("wf-b", 2));
    assert_eq!(sub_b.recv().await.unwrap().event.seq, 2);
}

// The sink assigns monotonically increasing indexes, and restoring a
// snapshot makes a retry re-emit the same indexes, which the bus drops.
#[tokio::test]
async fn test_event_sink_snapshot_restore_dedups_retries() {
    let bus = Arc::new(EventBus::new());
    let mut sub = bus.subscribe("wf");
    let sink = EventSink::new(Arc::clone(&bus), "wf");

    sink.emit(EventType::WorkflowStarted, "started");
    let snapshot = sink.snapshot();
    sink.emit(EventType::AgentStarted, "attempt 1");
    sink.emit(EventType::ErrorOccurred, "attempt 1 failed");

    // Retry: restore and re-emit the same logical step.
    sink.restore(snapshot);
    sink.emit(EventType::AgentStarted, "attempt 2");
    sink.emit(EventType::AgentCompleted, "attempt 2 done");
    sink.emit(EventType::WorkflowCompleted, "done");

    let mut received = Vec::new();
    for _ in 0..4 {
        let delivery = sub.recv().await.unwrap();
        received.push((delivery.event.seq, delivery.event.event_type));
    }
    assert_eq!(
        received,
        vec![
            (1, EventType::WorkflowStarted),
            (2, EventType::AgentStarted),
            (3, EventType::ErrorOccurred),
            (4, EventType::WorkflowCompleted),
        ]
    );
    assert!(sub.try_recv().is_none());
}
