//! Session lifecycle tests against the mock transport.
//!
//! Every test runs on a paused clock, so operation and disconnect timeouts
//! elapse as soon as the runtime is otherwise idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use gattkit_core::uuids::{
    BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIG, DEVICE_INFORMATION_SERVICE,
    MANUFACTURER_NAME,
};
use gattkit_core::{
    DisconnectReason, Error, EventReceiver, GattEvent, GattListener, GattManager, GattOperation,
    GattSession, GattStatus, IntFormat, ListenerAction, MockCall, MockTransport,
    NotificationDescriptorType, OperationOptions, WriteType,
};

const EVENT_WAIT: Duration = Duration::from_secs(60);

fn setup(transport: MockTransport) -> (Arc<MockTransport>, GattManager, EventReceiver) {
    let transport = Arc::new(transport);
    let manager = GattManager::new(transport.clone()).unwrap();
    let events = manager.subscribe();
    (transport, manager, events)
}

async fn next_event(events: &mut EventReceiver) -> GattEvent {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("no event within wait")
        .expect("event channel closed")
        .event
}

async fn wait_for(events: &mut EventReceiver, mut matches: impl FnMut(&GattEvent) -> bool) -> GattEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

async fn assert_quiet(events: &mut EventReceiver) {
    let result = tokio::time::timeout(EVENT_WAIT, events.recv()).await;
    assert!(result.is_err(), "unexpected event: {:?}", result);
}

async fn connected_session(
    manager: &GattManager,
    events: &mut EventReceiver,
) -> Arc<GattSession> {
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();
    session.connect(false, OperationOptions::new()).unwrap();
    let discovered = wait_for(events, |e| matches!(e, GattEvent::ServicesDiscovered { .. })).await;
    assert!(matches!(
        discovered,
        GattEvent::ServicesDiscovered { success: true, .. }
    ));
    session
}

fn is_disconnected(event: &GattEvent) -> bool {
    matches!(event, GattEvent::Disconnected { .. })
}

#[derive(Default)]
struct TimeoutRecorder {
    keep: bool,
    seen: Mutex<Vec<GattOperation>>,
}

impl GattListener for TimeoutRecorder {
    fn on_operation_timeout(
        &self,
        _session: &GattSession,
        operation: GattOperation,
        _timeout: Duration,
        _elapsed: Duration,
    ) -> bool {
        self.seen.lock().push(operation);
        self.keep
    }
}

// ==================== Connect ====================

#[tokio::test(start_paused = true)]
async fn test_connect_reports_lifecycle_in_order() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();

    session.connect(false, OperationOptions::new()).unwrap();

    assert_eq!(next_event(&mut events).await, GattEvent::Connecting);
    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::Connected { .. }
    ));
    match next_event(&mut events).await {
        GattEvent::ServicesDiscovered {
            services, success, ..
        } => {
            assert!(success);
            assert!(services.iter().any(|s| s.uuid == BATTERY_SERVICE));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(session.is_connected());
    assert_eq!(session.services().len(), 2);
    assert_eq!(session.metrics().connect.snapshot().success_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_preconditions() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    assert!(matches!(
        session.connect(false, OperationOptions::new()),
        Err(Error::AlreadyConnected)
    ));

    transport.set_confirm_disconnect(false);
    assert!(session.disconnect());
    assert!(session.is_disconnecting());
    assert!(matches!(
        session.connect(false, OperationOptions::new()),
        Err(Error::Disconnecting)
    ));

    let other = manager.get_session_for(MockTransport::random_address()).unwrap();
    transport.set_enabled(false);
    assert!(matches!(
        other.connect(false, OperationOptions::new()),
        Err(Error::AdapterUnavailable)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connect_refused_by_transport() {
    let (_transport, manager, mut events) =
        setup(MockTransport::builder().refuse(GattOperation::Connect).build());
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();

    session.connect(false, OperationOptions::new()).unwrap();

    let event = wait_for(&mut events, is_disconnected).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::ConnectFailed,
            ..
        }
    ));
    assert!(session.is_disconnected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_reported_to_listeners() {
    let (_transport, manager, mut events) =
        setup(MockTransport::builder().silent(GattOperation::Connect).build());
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();
    let recorder = Arc::new(TimeoutRecorder::default());
    session.add_listener(recorder.clone());

    session
        .connect(false, Duration::from_secs(1).into())
        .unwrap();

    let event = wait_for(&mut events, is_disconnected).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::SolicitedDisconnect,
            ..
        }
    ));
    assert_eq!(*recorder.seen.lock(), vec![GattOperation::Connect]);
    assert_eq!(session.metrics().connect.snapshot().timeout_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_timeout_classified_after_link_up() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .silent(GattOperation::DiscoverServices)
            .build(),
    );
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();
    let recorder = Arc::new(TimeoutRecorder::default());
    session.add_listener(recorder.clone());

    session.connect(false, OperationOptions::new()).unwrap();

    wait_for(&mut events, is_disconnected).await;
    assert_eq!(*recorder.seen.lock(), vec![GattOperation::DiscoverServices]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_disconnect() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    assert!(session.disconnect());
    wait_for(&mut events, is_disconnected).await;

    session.connect(false, OperationOptions::new()).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, GattEvent::ServicesDiscovered { success: true, .. })
    })
    .await;
    assert!(session.is_connected());
    assert_eq!(
        transport.count_calls(|c| matches!(c, MockCall::Connect { .. })),
        2
    );
}

// ==================== Serialization ====================

#[tokio::test(start_paused = true)]
async fn test_operations_run_one_at_a_time() {
    let (transport, manager, mut events) = setup(
        MockTransport::builder()
            .latency(Duration::from_millis(50))
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;

    session
        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
        .unwrap();
    session
        .characteristic_write(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            vec![42u8],
            WriteType::DefaultWithResponse,
            OperationOptions::new(),
        )
        .unwrap();
    session.read_remote_rssi(OperationOptions::new()).unwrap();
    session
        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
        .unwrap();

    match next_event(&mut events).await {
        GattEvent::CharacteristicRead { value, success, .. } => {
            assert!(success);
            assert_eq!(&value[..], &[87]);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::CharacteristicWrite { success: true, .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::RemoteRssiRead {
            rssi: -60,
            success: true,
            ..
        }
    ));
    match next_event(&mut events).await {
        GattEvent::CharacteristicRead { value, .. } => assert_eq!(&value[..], &[42]),
        other => panic!("unexpected event: {:?}", other),
    }

    assert_eq!(transport.max_in_flight(), 1);
    let summary = session.metrics().summary();
    assert_eq!(summary.bytes_read, 2);
    assert_eq!(summary.bytes_written, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submitters_are_serialized() {
    let (transport, manager, mut events) = setup(
        MockTransport::builder()
            .latency(Duration::from_millis(2))
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;

    let submitters: Vec<_> = (0..8)
        .map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                for _ in 0..5 {
                    session
                        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.await.unwrap();
    }

    let mut reads = 0;
    while reads < 40 {
        if let GattEvent::CharacteristicRead { success, .. } = next_event(&mut events).await {
            assert!(success);
            reads += 1;
        }
    }
    assert_eq!(transport.max_in_flight(), 1);
    assert_eq!(
        transport.count_calls(|c| matches!(c, MockCall::ReadCharacteristic { .. })),
        40
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_from_operation_start() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .latency(Duration::from_millis(400))
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;

    session
        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
        .unwrap();
    // Queued behind the first read for longer than its own timeout.
    session
        .characteristic_read(
            DEVICE_INFORMATION_SERVICE,
            MANUFACTURER_NAME,
            Duration::from_millis(500).into(),
        )
        .unwrap();

    for expected in [BATTERY_LEVEL, MANUFACTURER_NAME] {
        match next_event(&mut events).await {
            GattEvent::CharacteristicRead {
                characteristic,
                success,
                elapsed,
                ..
            } => {
                assert!(success);
                assert_eq!(characteristic.uuid, expected);
                assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_operations_queue_while_connecting() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();

    session.connect(false, OperationOptions::new()).unwrap();
    session
        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
        .unwrap();

    wait_for(&mut events, |e| {
        matches!(e, GattEvent::ServicesDiscovered { .. })
    })
    .await;
    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::CharacteristicRead { success: true, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_encoded_writes() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    session
        .characteristic_write_int(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            -2,
            IntFormat::I16,
            OperationOptions::new(),
        )
        .unwrap();
    wait_for(&mut events, |e| matches!(e, GattEvent::CharacteristicWrite { .. })).await;
    assert_eq!(
        transport.value(BATTERY_LEVEL).as_deref(),
        Some(&[0xFE, 0xFF][..])
    );

    session
        .characteristic_write_str(
            DEVICE_INFORMATION_SERVICE,
            MANUFACTURER_NAME,
            "acme",
            OperationOptions::new(),
        )
        .unwrap();
    wait_for(&mut events, |e| matches!(e, GattEvent::CharacteristicWrite { .. })).await;
    assert_eq!(
        transport.value(MANUFACTURER_NAME).as_deref(),
        Some(&b"acme"[..])
    );

    let err = session
        .characteristic_write_int(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            300,
            IntFormat::U8,
            OperationOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidValue(_)));
}

// ==================== Preconditions ====================

#[tokio::test(start_paused = true)]
async fn test_operations_require_connection() {
    let (transport, manager, _events) = setup(MockTransport::new());
    let session = manager.get_session("AA:BB:CC:DD:EE:FF").unwrap();

    let err = session
        .characteristic_write(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            vec![1u8],
            WriteType::DefaultWithResponse,
            OperationOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert!(matches!(
        session.read_remote_rssi(OperationOptions::new()),
        Err(Error::NotConnected)
    ));
    assert!(transport.calls().is_empty());
}

// ==================== Failures and timeouts ====================

#[tokio::test(start_paused = true)]
async fn test_timeout_disconnects_without_veto() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .silent(GattOperation::CharacteristicRead)
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;
    let recorder = Arc::new(TimeoutRecorder::default());
    session.add_listener(recorder.clone());

    session
        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
        .unwrap();

    let event = wait_for(&mut events, is_disconnected).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::SolicitedDisconnect,
            ..
        }
    ));
    assert_eq!(*recorder.seen.lock(), vec![GattOperation::CharacteristicRead]);
    let reads = session.metrics().reads.snapshot();
    assert_eq!(reads.timeout_count, 1);
    assert_eq!(reads.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_veto_keeps_connection() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .silent(GattOperation::CharacteristicRead)
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;
    let keeper = Arc::new(TimeoutRecorder {
        keep: true,
        ..Default::default()
    });
    let other = Arc::new(TimeoutRecorder::default());
    session.add_listener(keeper.clone());
    session.add_listener(other.clone());

    session
        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
        .unwrap();
    session.read_remote_rssi(OperationOptions::new()).unwrap();

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::RemoteRssiRead { success: true, .. }
    ));
    assert!(session.is_connected());
    // Every listener sees the timeout, not only the one that kept the link.
    assert_eq!(*keeper.seen.lock(), vec![GattOperation::CharacteristicRead]);
    assert_eq!(*other.seen.lock(), vec![GattOperation::CharacteristicRead]);
}

#[tokio::test(start_paused = true)]
async fn test_late_completion_not_taken_by_next_operation() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .latency(Duration::from_millis(500))
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;
    let keeper = Arc::new(TimeoutRecorder {
        keep: true,
        ..Default::default()
    });
    session.add_listener(keeper.clone());

    session
        .characteristic_read(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            Duration::from_millis(100).into(),
        )
        .unwrap();
    session
        .characteristic_read(
            DEVICE_INFORMATION_SERVICE,
            MANUFACTURER_NAME,
            OperationOptions::new(),
        )
        .unwrap();

    // The battery answer lands while the manufacturer read is pending.
    match next_event(&mut events).await {
        GattEvent::CharacteristicRead {
            characteristic,
            value,
            success,
            ..
        } => {
            assert!(success);
            assert_eq!(characteristic.uuid, MANUFACTURER_NAME);
            assert_eq!(&value[..], b"gattkit");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(*keeper.seen.lock(), vec![GattOperation::CharacteristicRead]);
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_per_call_timeout_overrides_default() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .silent(GattOperation::ReadRemoteRssi)
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;
    let started = tokio::time::Instant::now();

    session
        .read_remote_rssi(Duration::from_millis(500).into())
        .unwrap();
    wait_for(&mut events, is_disconnected).await;

    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(500));
    assert!(waited < session.config().operation_timeout);
}

#[tokio::test(start_paused = true)]
async fn test_failed_completion_disconnects() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .status(GattOperation::CharacteristicWrite, GattStatus::WRITE_NOT_PERMITTED)
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;

    session
        .characteristic_write(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            vec![1u8],
            WriteType::DefaultWithResponse,
            OperationOptions::new(),
        )
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::CharacteristicWrite { success: false, .. }
    ));
    assert!(is_disconnected(&next_event(&mut events).await));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_characteristic_fails() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    session
        .characteristic_read(
            BATTERY_SERVICE,
            gattkit_core::uuids::HEART_RATE_MEASUREMENT,
            OperationOptions::new(),
        )
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::CharacteristicRead { success: false, .. }
    ));
    wait_for(&mut events, is_disconnected).await;
    assert_eq!(
        transport.count_calls(|c| matches!(c, MockCall::ReadCharacteristic { .. })),
        0
    );
}

// ==================== Disconnect ====================

#[tokio::test(start_paused = true)]
async fn test_double_disconnect() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    assert!(session.disconnect());
    assert!(!session.disconnect());

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            status: Some(GattStatus::SUCCESS),
            reason: DisconnectReason::SolicitedDisconnect,
            ..
        }
    ));
    assert!(!session.disconnect());
    assert_quiet(&mut events).await;
    assert_eq!(
        transport.count_calls(|c| matches!(c, MockCall::Disconnect { .. })),
        1
    );
    assert_eq!(session.metrics().summary().disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connect_queued() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();

    session.connect(false, OperationOptions::new()).unwrap();
    assert!(session.disconnect());

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::SolicitedDisconnect,
            ..
        }
    ));
    assert_quiet(&mut events).await;
    assert!(session.is_disconnected());
    assert_eq!(
        transport.count_calls(|c| matches!(c, MockCall::Connect { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_releases_pending_wait() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .silent(GattOperation::CharacteristicRead)
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;
    let recorder = Arc::new(TimeoutRecorder::default());
    session.add_listener(recorder.clone());
    let started = tokio::time::Instant::now();

    session
        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(session.disconnect());

    wait_for(&mut events, is_disconnected).await;
    assert!(started.elapsed() < session.config().operation_timeout);
    // The released wait still reaches the timeout hook.
    assert_eq!(*recorder.seen.lock(), vec![GattOperation::CharacteristicRead]);
    assert_eq!(session.metrics().reads.snapshot().timeout_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_releases_pending_wait() {
    let (transport, manager, mut events) = setup(
        MockTransport::builder()
            .silent(GattOperation::CharacteristicRead)
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;
    let recorder = Arc::new(TimeoutRecorder::default());
    session.add_listener(recorder.clone());

    session
        .characteristic_read(BATTERY_SERVICE, BATTERY_LEVEL, OperationOptions::new())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(transport.simulate_link_loss(session.address(), GattStatus::ERROR));

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::UnsolicitedDisconnect,
            ..
        }
    ));
    assert_quiet(&mut events).await;
    assert_eq!(*recorder.seen.lock(), vec![GattOperation::CharacteristicRead]);
    assert_eq!(
        transport.count_calls(|c| matches!(c, MockCall::Disconnect { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_disconnect_times_out() {
    let (_transport, manager, mut events) =
        setup(MockTransport::builder().unconfirmed_disconnect().build());
    let session = connected_session(&manager, &mut events).await;

    assert!(session.disconnect());
    assert!(session.is_disconnecting());

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            status: None,
            reason: DisconnectReason::SolicitedDisconnectTimeout,
            ..
        }
    ));
    assert!(session.is_disconnected());
}

#[tokio::test(start_paused = true)]
async fn test_refused_disconnect_tears_down() {
    let (transport, manager, mut events) =
        setup(MockTransport::builder().refuse_disconnect().build());
    let session = connected_session(&manager, &mut events).await;

    assert!(session.disconnect());

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::SolicitedDisconnect,
            ..
        }
    ));
    assert!(!transport.has_link(session.address()));
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_link_loss() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    assert!(transport.simulate_link_loss(session.address(), GattStatus::ERROR));

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            status: Some(GattStatus::ERROR),
            reason: DisconnectReason::UnsolicitedDisconnect,
            elapsed: Some(_),
        }
    ));
    assert_quiet(&mut events).await;
    assert!(!transport.has_link(session.address()));
}

// ==================== Registry ====================

#[tokio::test(start_paused = true)]
async fn test_close_disconnects_every_session() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let mut addresses = Vec::new();
    for _ in 0..3 {
        addresses.push(connected_session(&manager, &mut events).await.address());
    }

    assert_eq!(manager.close(), 3);
    assert!(manager.is_empty());

    let mut disconnected = Vec::new();
    while disconnected.len() < 3 {
        let event = tokio::time::timeout(EVENT_WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        if is_disconnected(&event.event) {
            disconnected.push(event.address);
        }
    }
    disconnected.sort();
    addresses.sort();
    assert_eq!(disconnected, addresses);
    assert_quiet(&mut events).await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_session_reports_disconnect() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let address = connected_session(&manager, &mut events).await.address();

    assert!(manager.remove_session(address).is_some());

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::SolicitedDisconnect,
            ..
        }
    ));
    assert_quiet(&mut events).await;
}

#[tokio::test(start_paused = true)]
async fn test_closed_session_reports_unconfirmed_disconnect() {
    let (_transport, manager, mut events) =
        setup(MockTransport::builder().unconfirmed_disconnect().build());
    let session = connected_session(&manager, &mut events).await;

    assert!(session.close());
    drop(session);

    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::SolicitedDisconnectTimeout,
            ..
        }
    ));
    assert!(manager.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_same_session_for_same_address() {
    let (_transport, manager, _events) = setup(MockTransport::new());
    let a = manager.get_session("01:02:03:04:05:06").unwrap();
    let b = manager.clone().get_session("01:02:03:04:05:06").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

// ==================== Notifications ====================

#[tokio::test(start_paused = true)]
async fn test_set_notification_writes_descriptor() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    session
        .characteristic_set_notification(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            NotificationDescriptorType::EnableWithoutResponse,
            true,
            OperationOptions::new(),
        )
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::CharacteristicSetNotification { success: true, .. }
    ));
    let descriptor_writes: Vec<_> = transport
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            MockCall::WriteDescriptor {
                descriptor, value, ..
            } => Some((descriptor, value)),
            _ => None,
        })
        .collect();
    assert_eq!(descriptor_writes.len(), 1);
    assert_eq!(descriptor_writes[0].0, CLIENT_CHARACTERISTIC_CONFIG);
    assert_eq!(&descriptor_writes[0].1[..], &[0x01, 0x00]);
    assert!(transport.notifications_enabled(session.address(), BATTERY_LEVEL));

    assert!(transport.simulate_notification(session.address(), BATTERY_LEVEL, vec![12u8]));
    match next_event(&mut events).await {
        GattEvent::CharacteristicChanged {
            characteristic,
            value,
        } => {
            assert_eq!(characteristic.uuid, BATTERY_LEVEL);
            assert_eq!(&value[..], &[12]);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_set_notification_local_only() {
    let (transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    session
        .characteristic_set_notification(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            NotificationDescriptorType::EnableWithResponse,
            false,
            OperationOptions::new(),
        )
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::CharacteristicSetNotification { success: true, .. }
    ));
    assert_eq!(
        transport.count_calls(|c| matches!(c, MockCall::WriteDescriptor { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_set_notification_without_descriptor_fails() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;

    session
        .characteristic_set_notification(
            DEVICE_INFORMATION_SERVICE,
            MANUFACTURER_NAME,
            NotificationDescriptorType::EnableWithoutResponse,
            true,
            OperationOptions::new(),
        )
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        GattEvent::CharacteristicSetNotification { success: false, .. }
    ));
    wait_for(&mut events, is_disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_notifications_dropped_while_disconnecting() {
    let (transport, manager, mut events) =
        setup(MockTransport::builder().unconfirmed_disconnect().build());
    let session = connected_session(&manager, &mut events).await;

    assert!(session.disconnect());
    // The link is still open, but the session no longer forwards changes.
    assert!(transport.simulate_notification(session.address(), BATTERY_LEVEL, vec![1u8]));

    assert!(is_disconnected(&next_event(&mut events).await));
}

// ==================== Listeners and hooks ====================

#[tokio::test(start_paused = true)]
async fn test_after_success_runs_after_listeners() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let session = connected_session(&manager, &mut events).await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = order.clone();
    session.add_listener_fn(move |_, event: &GattEvent| {
        if matches!(event, GattEvent::CharacteristicRead { .. }) {
            seen.lock().push("listener");
        }
        ListenerAction::Continue
    });

    let hook = order.clone();
    session
        .characteristic_read(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            OperationOptions::new().after_success(move |_, _| hook.lock().push("hook")),
        )
        .unwrap();

    wait_for(&mut events, |e| matches!(e, GattEvent::CharacteristicRead { .. })).await;
    assert_eq!(*order.lock(), vec!["listener", "hook"]);
}

#[tokio::test(start_paused = true)]
async fn test_after_success_skipped_on_failure() {
    let (_transport, manager, mut events) = setup(
        MockTransport::builder()
            .status(GattOperation::CharacteristicRead, GattStatus::READ_NOT_PERMITTED)
            .build(),
    );
    let session = connected_session(&manager, &mut events).await;
    let ran = Arc::new(AtomicUsize::new(0));

    let hook = ran.clone();
    session
        .characteristic_read(
            BATTERY_SERVICE,
            BATTERY_LEVEL,
            OperationOptions::new().after_success(move |_, _| {
                hook.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    wait_for(&mut events, is_disconnected).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_detaching_listener_sees_one_event() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    session.add_listener_fn(move |_, _: &GattEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
        ListenerAction::Detach
    });
    assert_eq!(session.listener_count(), 1);

    session.connect(false, OperationOptions::new()).unwrap();
    wait_for(&mut events, |e| matches!(e, GattEvent::ServicesDiscovered { .. })).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_listener_requested_disconnect() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();

    session.add_listener_fn(|_, event: &GattEvent| {
        if matches!(event, GattEvent::Connected { .. }) {
            ListenerAction::Disconnect
        } else {
            ListenerAction::Continue
        }
    });

    session.connect(false, OperationOptions::new()).unwrap();

    let event = wait_for(&mut events, is_disconnected).await;
    assert!(matches!(
        event,
        GattEvent::Disconnected {
            reason: DisconnectReason::SolicitedDisconnect,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_listener_attached_during_delivery_sees_next_event() {
    let (_transport, manager, mut events) = setup(MockTransport::new());
    let session = manager.get_session_for(MockTransport::random_address()).unwrap();
    let late_calls = Arc::new(AtomicUsize::new(0));

    let late_counter = late_calls.clone();
    session.add_listener_fn(move |session, event: &GattEvent| {
        if matches!(event, GattEvent::Connecting) {
            let counter = late_counter.clone();
            session.add_listener_fn(move |_, _: &GattEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                ListenerAction::Continue
            });
        }
        ListenerAction::Continue
    });

    session.connect(false, OperationOptions::new()).unwrap();
    wait_for(&mut events, |e| matches!(e, GattEvent::ServicesDiscovered { .. })).await;

    // Connected and ServicesDiscovered, but not the Connecting that added it.
    assert_eq!(late_calls.load(Ordering::SeqCst), 2);
    assert_eq!(session.listener_count(), 2);
}
