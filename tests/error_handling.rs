//! Error handling and edge case tests.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use stream_subscriber::{
    DispatchError, FileCheckpoint, InMemoryEventSource, MemoryCheckpoint, StreamPosition,
    SubscribedEvent, Subscriber, SubscriberError, SubscriberOptions, SubscriberState,
    EventSource,
};
use tempfile::TempDir;

fn noop(_: &SubscribedEvent) -> Result<(), DispatchError> {
    Ok(())
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// --- Configuration Errors ---

#[test]
fn test_heartbeat_timeout_not_greater_than_frequency() {
    let source = InMemoryEventSource::new();

    for (frequency, timeout) in [(5, 5), (5, 1)] {
        let options = SubscriberOptions::default().with_heartbeat(
            Duration::from_secs(frequency),
            Duration::from_secs(timeout),
        );
        let result = Subscriber::catch_up_from_position(source.clone(), "orders", None, noop, options);
        assert!(matches!(
            result,
            Err(SubscriberError::HeartbeatTimeoutTooShort { .. })
        ));
    }

    assert_eq!(source.subscriptions_opened(), 0);
    assert!(source.read_stream("orders").is_empty());
}

#[test]
fn test_heartbeat_half_configured() {
    let source = InMemoryEventSource::new();

    let only_frequency = SubscriberOptions {
        heartbeat_frequency: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    assert!(matches!(
        Subscriber::live(source.clone(), "orders", noop, only_frequency),
        Err(SubscriberError::HeartbeatTimeoutMissing)
    ));

    let only_timeout = SubscriberOptions {
        heartbeat_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    assert!(matches!(
        Subscriber::live(source.clone(), "orders", noop, only_timeout),
        Err(SubscriberError::HeartbeatFrequencyMissing)
    ));

    assert_eq!(source.subscriptions_opened(), 0);
}

#[test]
fn test_invalid_options_leave_checkpoint_file_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("orders.checkpoint");
    let options = SubscriberOptions::default()
        .with_heartbeat(Duration::from_secs(10), Duration::from_secs(1));

    let result = Subscriber::catch_up_from_checkpoint_file(
        InMemoryEventSource::new(),
        "orders",
        &path,
        noop,
        options,
    );
    assert!(result.unwrap_err().is_configuration());
    assert!(!path.exists());
}

#[test]
fn test_zero_queue_bound() {
    let result = Subscriber::live(
        InMemoryEventSource::new(),
        "orders",
        noop,
        SubscriberOptions::default().with_upper_queue_bound(0),
    );
    assert!(matches!(result, Err(SubscriberError::Configuration(_))));
}

// --- Source Errors ---

#[test]
fn test_start_fails_when_heartbeat_cannot_be_sent() {
    let source = InMemoryEventSource::new();
    source.fail_appends(Some("cluster is read only"));

    let subscriber = Subscriber::live(
        source.clone(),
        "orders",
        noop,
        SubscriberOptions::default()
            .with_heartbeat(Duration::from_millis(50), Duration::from_millis(200)),
    )
    .unwrap();

    assert!(matches!(subscriber.start(), Err(SubscriberError::Source(_))));
    assert_eq!(source.subscriptions_opened(), 0);
    assert_eq!(subscriber.state(), SubscriberState::Uninitialized);
}

#[test]
fn test_start_fails_when_subscribe_fails() {
    let source = InMemoryEventSource::new();
    source.fail_subscribes(Some("access denied"));

    let subscriber = Subscriber::catch_up_from_position(
        source.clone(),
        "orders",
        None,
        noop,
        SubscriberOptions::default(),
    )
    .unwrap();

    assert!(matches!(subscriber.start(), Err(SubscriberError::Source(_))));
    assert_eq!(subscriber.state(), SubscriberState::Subscribing);

    source.fail_subscribes(None);
    subscriber.start().unwrap();
    assert!(wait_until(|| subscriber.state() == SubscriberState::Live));
}

// --- Checkpoint Errors ---

#[test]
fn test_checkpoint_file_in_use() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("orders.checkpoint");
    let _held = FileCheckpoint::open_default(&path).unwrap();

    let result = Subscriber::catch_up_from_checkpoint_file(
        InMemoryEventSource::new(),
        "orders",
        &path,
        noop,
        SubscriberOptions::default(),
    );
    assert!(matches!(result, Err(SubscriberError::Locked)));
}

#[test]
fn test_corrupted_checkpoint_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("orders.checkpoint");
    {
        let mut checkpoint = FileCheckpoint::open_default(&path).unwrap();
        stream_subscriber::CheckpointStore::write(&mut checkpoint, StreamPosition(12));
        stream_subscriber::CheckpointStore::flush(&mut checkpoint).unwrap();
    }

    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let result = Subscriber::catch_up_from_checkpoint_file(
        InMemoryEventSource::new(),
        "orders",
        &path,
        noop,
        SubscriberOptions::default(),
    );
    assert!(matches!(
        result,
        Err(SubscriberError::ChecksumMismatch { .. })
    ));
}

// --- Dispatch Errors ---

#[test]
fn test_panicking_handler_does_not_stop_dispatch() {
    let source = InMemoryEventSource::new();
    let handled = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&handled);
    let dispatcher = move |event: &SubscribedEvent| -> Result<(), DispatchError> {
        if event.event_type == "Poison" {
            panic!("projection cannot handle {}", event.position);
        }
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };

    let checkpoint = MemoryCheckpoint::new();
    let subscriber = Subscriber::catch_up_with_checkpoint(
        source.clone(),
        "orders",
        checkpoint.clone(),
        dispatcher,
        SubscriberOptions::default(),
    )
    .unwrap();
    subscriber.start().unwrap();

    source.append("orders", "OrderPlaced", vec![]).unwrap();
    source.append("orders", "Poison", vec![]).unwrap();
    source.append("orders", "OrderShipped", vec![]).unwrap();

    assert!(wait_until(|| handled.load(Ordering::SeqCst) == 2));
    assert!(wait_until(|| checkpoint.position() == Some(StreamPosition(2))));
    assert_eq!(subscriber.dispatch_failures(), 1);
    assert_eq!(subscriber.state(), SubscriberState::Live);
}

// --- Lifecycle Errors ---

#[test]
fn test_join_before_start() {
    let subscriber = Subscriber::live(
        InMemoryEventSource::new(),
        "orders",
        noop,
        SubscriberOptions::default(),
    )
    .unwrap();
    assert!(matches!(
        subscriber.join(),
        Err(SubscriberError::InvalidOperation(_))
    ));
}

#[test]
fn test_start_after_shutdown() {
    let source = InMemoryEventSource::new();
    let subscriber =
        Subscriber::live(source.clone(), "orders", noop, SubscriberOptions::default()).unwrap();
    subscriber.start().unwrap();
    subscriber.shutdown();

    assert!(matches!(subscriber.start(), Err(SubscriberError::ShutDown)));
    assert_eq!(source.subscriptions_opened(), 1);
}

#[test]
fn test_catch_up_progress_on_empty_stream() {
    let subscriber = Subscriber::catch_up_from_position(
        InMemoryEventSource::new(),
        "orders",
        None,
        noop,
        SubscriberOptions::default(),
    )
    .unwrap();

    let progress = subscriber.catch_up_progress().unwrap();
    assert_eq!(progress.last_position, None);
    assert_eq!(progress.percentage(), 100.0);
}
