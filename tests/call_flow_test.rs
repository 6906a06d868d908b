//! End-to-end call flows over the in-memory broker with mock engines.

use peercall::test_utils::{CountingCallLog, MockEngineFactory, RecordingCallUi};
use peercall::{
    AccountId, ActiveCallSession, CallId, CallPhase, CallSessionCoordinator, CallSignal,
    ConnectionState, CoordinatorConfig, EndCallReason, IceCandidate, InMemoryBroker,
    IncomingCallPayload, MediaKind, MemoryCallLog, NativeUiEvent, RoomId, SignalKind,
    SignalingTransport,
};
use std::sync::Arc;
use std::time::Duration;

struct TestAccount {
    id: AccountId,
    coordinator: Arc<CallSessionCoordinator>,
    factory: Arc<MockEngineFactory>,
    ui: Arc<RecordingCallUi>,
    log: Arc<MemoryCallLog>,
}

async fn account(broker: &Arc<InMemoryBroker>, id: &str) -> TestAccount {
    account_with_config(broker, id, CoordinatorConfig::default()).await
}

async fn account_with_config(
    broker: &Arc<InMemoryBroker>,
    id: &str,
    mut config: CoordinatorConfig,
) -> TestAccount {
    let _ = env_logger::builder().is_test(true).try_init();
    let factory = MockEngineFactory::new();
    let ui = RecordingCallUi::new();
    let log = Arc::new(MemoryCallLog::new());
    config.native_ui = ui.clone();
    config.call_log = log.clone();

    let coordinator = CallSessionCoordinator::start(
        AccountId::from(id),
        broker.clone() as Arc<dyn SignalingTransport>,
        factory.clone(),
        config,
    )
    .await
    .expect("coordinator should start");

    TestAccount {
        id: AccountId::from(id),
        coordinator,
        factory,
        ui,
        log,
    }
}

async fn wait_until(what: &str, f: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_session(
    account: &TestAccount,
    what: &str,
    pred: impl Fn(&Option<ActiveCallSession>) -> bool,
) {
    wait_until(what, || pred(&account.coordinator.session_snapshot())).await;
}

fn phase_is_incoming_offered(s: &Option<ActiveCallSession>) -> bool {
    matches!(
        s,
        Some(ActiveCallSession {
            phase: CallPhase::IncomingOffered { .. },
            ..
        })
    )
}

fn phase_is_connected(s: &Option<ActiveCallSession>) -> bool {
    matches!(
        s,
        Some(ActiveCallSession {
            phase: CallPhase::Connected { .. },
            ..
        })
    )
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 UDP 2130706431 192.168.1.{n} 8888 typ host"
    ))
}

/// A call-request as a caller without a coordinator would send it.
fn manual_call_request(caller: &str, callee: &str, call_id: &CallId) -> CallSignal {
    let caller = AccountId::from(caller);
    let callee = AccountId::from(callee);
    let room = RoomId::for_participants(&caller, &callee);
    CallSignal::new(
        SignalKind::CallRequest,
        call_id.clone(),
        room,
        caller.clone(),
        caller,
        callee,
        MediaKind::Audio,
    )
}

fn manual_room_signal(
    kind: SignalKind,
    caller: &str,
    callee: &str,
    sender: &str,
    call_id: &CallId,
) -> CallSignal {
    let caller = AccountId::from(caller);
    let callee = AccountId::from(callee);
    let room = RoomId::for_participants(&caller, &callee);
    CallSignal::new(
        kind,
        call_id.clone(),
        room,
        AccountId::from(sender),
        caller,
        callee,
        MediaKind::Audio,
    )
}

/// Drive two coordinators to the Connected phase and return the call id.
async fn establish_call(x: &TestAccount, y: &TestAccount) -> CallId {
    let call_id = x
        .coordinator
        .start_call(y.id.clone(), None, MediaKind::Audio)
        .await
        .expect("start_call should succeed");

    wait_for_session(y, "incoming call ringing", phase_is_incoming_offered).await;
    y.coordinator.accept().await.expect("accept should succeed");

    // The offer/answer exchange runs through the room; wait for both
    // engines to finish their part.
    wait_until("caller offer sent", || {
        x.factory
            .last_engine()
            .is_some_and(|e| e.offers_created() == 1)
    })
    .await;
    wait_until("callee answer sent", || {
        y.factory
            .last_engine()
            .is_some_and(|e| e.answers_created() == 1)
    })
    .await;
    wait_until("caller applied answer", || {
        x.factory
            .last_engine()
            .is_some_and(|e| !e.remote_descriptions().is_empty())
    })
    .await;

    x.factory
        .last_engine()
        .unwrap()
        .emit_connection_state(ConnectionState::Connected);
    y.factory
        .last_engine()
        .unwrap()
        .emit_connection_state(ConnectionState::Connected);

    wait_for_session(x, "caller connected", phase_is_connected).await;
    wait_for_session(y, "callee connected", phase_is_connected).await;

    call_id
}

/// Scenario: X calls Y, Y rings, accepts, SDP is exchanged, both sides
/// connect, X hangs up, and both call logs are completed.
#[tokio::test]
async fn test_full_call_lifecycle() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;
    let y = account(&broker, "y").await;

    let call_id = x
        .coordinator
        .start_call(y.id.clone(), Some("Yara".to_string()), MediaKind::Audio)
        .await
        .unwrap();

    // Y transitions Idle -> IncomingOffered and alerts.
    wait_for_session(&y, "incoming call", phase_is_incoming_offered).await;

    // Y's ringing signal moves X to OutgoingRinging.
    wait_for_session(&x, "outgoing ringing", |s| {
        matches!(
            s,
            Some(ActiveCallSession {
                phase: CallPhase::OutgoingRinging { .. },
                ..
            })
        )
    })
    .await;

    y.coordinator.accept().await.unwrap();

    // Accept-then-offer: only the caller creates an offer, only after
    // the accept arrives.
    wait_until("offer created", || {
        x.factory
            .last_engine()
            .is_some_and(|e| e.offers_created() == 1)
    })
    .await;
    wait_until("answer created", || {
        y.factory
            .last_engine()
            .is_some_and(|e| e.answers_created() == 1)
    })
    .await;
    assert_eq!(
        y.factory.last_engine().unwrap().offers_created(),
        0,
        "callee must never create an offer"
    );
    wait_until("answer applied on caller", || {
        x.factory
            .last_engine()
            .is_some_and(|e| !e.remote_descriptions().is_empty())
    })
    .await;

    x.factory
        .last_engine()
        .unwrap()
        .emit_connection_state(ConnectionState::Connected);
    y.factory
        .last_engine()
        .unwrap()
        .emit_connection_state(ConnectionState::Connected);
    wait_for_session(&x, "caller connected", phase_is_connected).await;
    wait_for_session(&y, "callee connected", phase_is_connected).await;

    // The native UI mirrored the whole flow.
    assert!(
        x.ui.calls()
            .iter()
            .any(|c| c.starts_with("start_outgoing"))
    );
    assert!(
        y.ui.calls()
            .iter()
            .any(|c| c.starts_with("display_incoming"))
    );
    assert!(
        x.ui.calls()
            .iter()
            .any(|c| c.starts_with("report_connected"))
    );

    // Engine-gathered candidates are forwarded through the room and
    // applied directly by the peer once its remote description is set.
    x.factory.last_engine().unwrap().emit_candidate(candidate(9));
    wait_until("candidate forwarded to callee", || {
        y.factory
            .last_engine()
            .unwrap()
            .applied_candidates()
            .contains(&candidate(9))
    })
    .await;

    // Remote media surfaces as an event.
    let mut x_events = x.coordinator.subscribe_events();
    x.factory.last_engine().unwrap().emit_remote_media();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let peercall::CallEvent::RemoteMedia { .. } = x_events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .expect("remote media event");

    x.coordinator.hang_up().await.unwrap();
    wait_for_session(&x, "caller idle", Option::is_none).await;
    wait_for_session(&y, "callee idle", Option::is_none).await;

    // Both sides released media and completed their log entries.
    let x_engine = x.factory.last_engine().unwrap();
    assert_eq!(x_engine.close_calls(), 1);
    assert_eq!(x_engine.release_calls(), 1);
    assert!(!x_engine.media_acquired());

    let x_entries = x.log.entries();
    assert_eq!(x_entries.len(), 1);
    assert!(!x_entries[0].is_pending());
    assert_eq!(x_entries[0].reason, Some(EndCallReason::UserEnded));
    assert_eq!(x_entries[0].call_id, call_id);

    let y_entries = y.log.entries();
    assert_eq!(y_entries[0].reason, Some(EndCallReason::RemoteEnded));
    assert!(y_entries[0].duration_secs.is_some());
}

/// A repeated call-request for the active room is an idempotent no-op.
#[tokio::test]
async fn test_duplicate_call_request_is_ignored() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;
    let y = account(&broker, "y").await;

    let call_id = x
        .coordinator
        .start_call(y.id.clone(), None, MediaKind::Audio)
        .await
        .unwrap();
    wait_for_session(&y, "incoming call", phase_is_incoming_offered).await;

    // The transport redelivers the request.
    broker
        .send_to_inbox(&y.id, manual_call_request("x", "y", &call_id))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = y.coordinator.session_snapshot().unwrap();
    assert_eq!(session.call_id, call_id);
    assert_eq!(y.log.entries().len(), 1, "no second session was created");
}

/// Scenario: a third account calls a busy callee and is auto-rejected;
/// the established call is untouched.
#[tokio::test]
async fn test_busy_collision_auto_rejects_new_caller() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;
    let y = account(&broker, "y").await;
    let z = account(&broker, "z").await;

    let call_id = establish_call(&x, &y).await;

    let z_call = z
        .coordinator
        .start_call(y.id.clone(), None, MediaKind::Audio)
        .await
        .unwrap();

    // Z's call dies with a reject; no session ever appears on Y for it.
    wait_for_session(&z, "busy caller rejected", Option::is_none).await;
    let z_entries = z.log.entries();
    assert_eq!(z_entries.len(), 1);
    assert_eq!(z_entries[0].call_id, z_call);
    assert_eq!(z_entries[0].reason, Some(EndCallReason::Declined));

    let y_session = y.coordinator.session_snapshot().unwrap();
    assert_eq!(y_session.call_id, call_id);
    assert!(y_session.phase.is_connected());
    assert_eq!(y.log.entries().len(), 1);
}

/// Scenario: candidates arriving before the remote description are
/// buffered and applied in arrival order once it is set.
#[tokio::test]
async fn test_ice_candidates_buffered_until_remote_description() {
    let broker = InMemoryBroker::new();
    let y = account(&broker, "y").await;

    // A scripted caller with no coordinator of its own.
    let call_id = CallId::generate();
    broker
        .send_to_inbox(&y.id, manual_call_request("x", "y", &call_id))
        .await
        .unwrap();
    wait_for_session(&y, "incoming call", phase_is_incoming_offered).await;
    y.coordinator.accept().await.unwrap();

    let room = RoomId::for_participants(&AccountId::from("x"), &AccountId::from("y"));

    // Three candidates land before the offer.
    for n in 1..=3 {
        broker
            .send_to_room(
                &room,
                manual_room_signal(SignalKind::IceCandidate, "x", "y", "x", &call_id)
                    .with_candidate(candidate(n)),
            )
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        y.factory.last_engine().is_none(),
        "no engine exists before the offer arrives"
    );

    broker
        .send_to_room(
            &room,
            manual_room_signal(SignalKind::Offer, "x", "y", "x", &call_id)
                .with_sdp("v=0 scripted-offer"),
        )
        .await
        .unwrap();

    wait_until("answer created", || {
        y.factory
            .last_engine()
            .is_some_and(|e| e.answers_created() == 1)
    })
    .await;

    let engine = y.factory.last_engine().unwrap();
    assert_eq!(
        engine.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)],
        "buffered candidates must be applied in arrival order"
    );

    // A late candidate with the description in place goes straight through.
    broker
        .send_to_room(
            &room,
            manual_room_signal(SignalKind::IceCandidate, "x", "y", "x", &call_id)
                .with_candidate(candidate(4)),
        )
        .await
        .unwrap();
    wait_until("late candidate applied", || {
        y.factory.last_engine().unwrap().applied_candidates().len() == 4
    })
    .await;
}

/// An answer is applied only while a locally-created offer is
/// outstanding; anything else is discarded without a state change.
#[tokio::test]
async fn test_unsolicited_answer_is_discarded() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;

    // The "callee" is scripted by hand.
    let call_id = x
        .coordinator
        .start_call(AccountId::from("y"), None, MediaKind::Audio)
        .await
        .unwrap();
    let room = RoomId::for_participants(&x.id, &AccountId::from("y"));

    // Answer before any accept: no offer is outstanding, no engine exists.
    broker
        .send_to_room(
            &room,
            manual_room_signal(SignalKind::Answer, "x", "y", "y", &call_id)
                .with_sdp("v=0 premature-answer"),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(x.factory.last_engine().is_none());
    assert!(matches!(
        x.coordinator.session_snapshot().unwrap().phase,
        CallPhase::OutgoingRequested { .. }
    ));

    // Now the callee accepts and answers properly.
    broker
        .send_to_room(
            &room,
            manual_room_signal(SignalKind::CallAccept, "x", "y", "y", &call_id),
        )
        .await
        .unwrap();
    wait_until("offer created", || {
        x.factory
            .last_engine()
            .is_some_and(|e| e.offers_created() == 1)
    })
    .await;

    broker
        .send_to_room(
            &room,
            manual_room_signal(SignalKind::Answer, "x", "y", "y", &call_id)
                .with_sdp("v=0 real-answer"),
        )
        .await
        .unwrap();
    wait_until("answer applied", || {
        x.factory
            .last_engine()
            .is_some_and(|e| e.remote_descriptions().len() == 1)
    })
    .await;

    // A duplicate answer changes nothing.
    broker
        .send_to_room(
            &room,
            manual_room_signal(SignalKind::Answer, "x", "y", "y", &call_id)
                .with_sdp("v=0 duplicate-answer"),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let descriptions = x.factory.last_engine().unwrap().remote_descriptions();
    assert_eq!(descriptions.len(), 1);
    assert_eq!(descriptions[0].1, "v=0 real-answer");
}

/// Teardown is idempotent: a local hangup racing the peer's call-end
/// releases resources exactly once on each side.
#[tokio::test]
async fn test_teardown_is_idempotent_under_race() {
    let broker = InMemoryBroker::new();
    let y = account(&broker, "y").await;

    // Build the caller by hand so the counting log is the one installed.
    let log_counter = CountingCallLog::new();
    let factory = MockEngineFactory::new();
    let ui = RecordingCallUi::new();
    let mut config = CoordinatorConfig::default();
    config.native_ui = ui.clone();
    config.call_log = log_counter.clone();
    let coordinator = CallSessionCoordinator::start(
        AccountId::from("x"),
        broker.clone() as Arc<dyn SignalingTransport>,
        factory.clone(),
        config,
    )
    .await
    .unwrap();
    let x = TestAccount {
        id: AccountId::from("x"),
        coordinator,
        factory,
        ui,
        log: Arc::new(MemoryCallLog::new()),
    };

    establish_call(&x, &y).await;

    // Both ends hang up at the same time; each also receives the other's
    // call-end afterwards.
    let (rx, ry) = tokio::join!(x.coordinator.hang_up(), y.coordinator.hang_up());
    rx.unwrap();
    ry.unwrap();

    wait_for_session(&x, "caller idle", Option::is_none).await;
    wait_for_session(&y, "callee idle", Option::is_none).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let x_engine = x.factory.last_engine().unwrap();
    let y_engine = y.factory.last_engine().unwrap();
    assert_eq!(x_engine.close_calls(), 1, "engine closed exactly once");
    assert_eq!(x_engine.release_calls(), 1, "media released exactly once");
    assert_eq!(y_engine.close_calls(), 1);
    assert_eq!(y_engine.release_calls(), 1);

    assert_eq!(log_counter.started(), 1);
    assert_eq!(log_counter.finished(), 1, "log completed exactly once");
    let x_end_lines = x
        .ui
        .calls()
        .iter()
        .filter(|c| c.starts_with("end_call"))
        .count();
    assert_eq!(x_end_lines, 1, "native UI notified exactly once");

    // A hangup with no session left is an error, not a crash.
    assert!(x.coordinator.hang_up().await.is_err());
}

/// Permission denial tears the caller down and ends the call for the
/// peer too.
#[tokio::test]
async fn test_permission_denied_tears_down_both_sides() {
    let broker = InMemoryBroker::new();

    let denying_factory = MockEngineFactory::denying_permission();
    let ui = RecordingCallUi::new();
    let log = Arc::new(MemoryCallLog::new());
    let mut config = CoordinatorConfig::default();
    config.native_ui = ui.clone();
    config.call_log = log.clone();
    let x_coordinator = CallSessionCoordinator::start(
        AccountId::from("x"),
        broker.clone() as Arc<dyn SignalingTransport>,
        denying_factory.clone(),
        config,
    )
    .await
    .unwrap();

    let y = account(&broker, "y").await;

    let mut x_events = x_coordinator.subscribe_events();
    x_coordinator
        .start_call(y.id.clone(), None, MediaKind::Audio)
        .await
        .unwrap();

    wait_for_session(&y, "incoming call", phase_is_incoming_offered).await;
    y.coordinator.accept().await.unwrap();

    // The accept triggers media acquisition on X, which fails.
    wait_until("caller torn down", || {
        x_coordinator.session_snapshot().is_none()
    })
    .await;
    wait_for_session(&y, "callee torn down", Option::is_none).await;

    let x_entries = log.entries();
    assert_eq!(x_entries[0].reason, Some(EndCallReason::PermissionDenied));

    // The failure reached the event stream before the Ended event.
    let mut saw_permission_failure = false;
    while let Ok(event) = x_events.try_recv() {
        if let peercall::CallEvent::Failure { reason, .. } = event {
            assert_eq!(reason, EndCallReason::PermissionDenied);
            saw_permission_failure = true;
        }
    }
    assert!(saw_permission_failure);
}

/// Scenario: the engine reports `failed` mid-call. The coordinator ends
/// the session, releases media, and the log entry is completed as a
/// failure rather than left pending.
#[tokio::test]
async fn test_engine_failure_completes_call_log() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;
    let y = account(&broker, "y").await;

    establish_call(&x, &y).await;

    let mut x_events = x.coordinator.subscribe_events();
    x.factory
        .last_engine()
        .unwrap()
        .emit_connection_state(ConnectionState::Failed);

    wait_for_session(&x, "failed caller idle", Option::is_none).await;
    wait_for_session(&y, "peer notified", Option::is_none).await;

    let entries = x.log.entries();
    assert!(!entries[0].is_pending());
    assert_eq!(entries[0].reason, Some(EndCallReason::ConnectionFailed));
    assert!(!x.factory.last_engine().unwrap().media_acquired());

    let mut saw_failure = false;
    while let Ok(event) = x_events.try_recv() {
        if let peercall::CallEvent::Failure { reason, message, .. } = event {
            assert_eq!(reason, EndCallReason::ConnectionFailed);
            assert!(message.contains("connection"));
            saw_failure = true;
        }
    }
    assert!(saw_failure, "connection failure must be surfaced");
}

/// An unanswered outgoing call rings out after the configured timeout.
#[tokio::test]
async fn test_outgoing_ring_timeout() {
    let broker = InMemoryBroker::new();
    let mut config = CoordinatorConfig::default();
    config.ring_timeout = Duration::from_millis(100);
    let x = account_with_config(&broker, "x", config).await;

    // Nobody is listening on y's inbox at all.
    x.coordinator
        .start_call(AccountId::from("y"), None, MediaKind::Audio)
        .await
        .unwrap();

    wait_for_session(&x, "ring timeout", Option::is_none).await;
    let entries = x.log.entries();
    assert_eq!(entries[0].reason, Some(EndCallReason::NoAnswer));
}

/// An unanswered incoming call is recorded as missed.
#[tokio::test]
async fn test_incoming_ring_timeout_is_missed() {
    let broker = InMemoryBroker::new();
    let mut config = CoordinatorConfig::default();
    config.ring_timeout = Duration::from_millis(100);
    let y = account_with_config(&broker, "y", config).await;

    broker
        .send_to_inbox(&y.id, manual_call_request("x", "y", &CallId::generate()))
        .await
        .unwrap();
    wait_for_session(&y, "incoming call", phase_is_incoming_offered).await;

    wait_for_session(&y, "missed", Option::is_none).await;
    assert_eq!(y.log.entries()[0].reason, Some(EndCallReason::Missed));
}

/// A push-wake payload enters the same incoming-call path as a live
/// call-request.
#[tokio::test]
async fn test_push_wake_routes_into_incoming_offered() {
    let broker = InMemoryBroker::new();
    let y = account(&broker, "y").await;

    let payload = IncomingCallPayload {
        call_id: CallId::generate(),
        caller_id: AccountId::from("x"),
        caller_name: Some("Xenia".to_string()),
        media_kind: MediaKind::Video,
        room_id: RoomId::for_participants(&AccountId::from("x"), &AccountId::from("y")),
    };
    y.coordinator.handle_push_wake(payload.clone()).await.unwrap();

    wait_for_session(&y, "incoming call from push", phase_is_incoming_offered).await;
    let session = y.coordinator.session_snapshot().unwrap();
    assert_eq!(session.call_id, payload.call_id);
    assert_eq!(session.peer_name.as_deref(), Some("Xenia"));
    assert!(
        y.ui.calls()
            .iter()
            .any(|c| c.starts_with("display_incoming"))
    );
}

/// Native UI actions (answer, mute, hold, end) drive the coordinator.
#[tokio::test]
async fn test_native_ui_actions_drive_the_call() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;
    let y = account(&broker, "y").await;

    let call_id = x
        .coordinator
        .start_call(y.id.clone(), None, MediaKind::Audio)
        .await
        .unwrap();
    wait_for_session(&y, "incoming call", phase_is_incoming_offered).await;

    // Answer from the native incoming-call screen.
    y.coordinator
        .handle_native_event(NativeUiEvent::Answer {
            call_id: call_id.clone(),
        })
        .await
        .unwrap();
    wait_for_session(&y, "accepted", |s| {
        matches!(
            s,
            Some(ActiveCallSession {
                phase: CallPhase::Connecting { .. },
                ..
            })
        )
    })
    .await;

    // Hold is a mute substitute.
    y.coordinator
        .handle_native_event(NativeUiEvent::Hold {
            call_id: call_id.clone(),
        })
        .await
        .unwrap();
    wait_for_session(&y, "held = muted", |s| {
        s.as_ref().is_some_and(|s| s.is_muted)
    })
    .await;
    y.coordinator
        .handle_native_event(NativeUiEvent::Unhold {
            call_id: call_id.clone(),
        })
        .await
        .unwrap();
    wait_for_session(&y, "resumed", |s| s.as_ref().is_some_and(|s| !s.is_muted)).await;

    // Minimizing only flips the session flag.
    y.coordinator.set_minimized(true).await.unwrap();
    wait_for_session(&y, "minimized", |s| {
        s.as_ref().is_some_and(|s| s.is_minimized)
    })
    .await;

    // An event for a stale call id is ignored.
    y.coordinator
        .handle_native_event(NativeUiEvent::End {
            call_id: CallId::generate(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(y.coordinator.session_snapshot().is_some());

    // Ending from the native UI tears down both sides.
    y.coordinator
        .handle_native_event(NativeUiEvent::End { call_id })
        .await
        .unwrap();
    wait_for_session(&y, "callee idle", Option::is_none).await;
    wait_for_session(&x, "caller idle", Option::is_none).await;
}

/// Declining an incoming call sends call-reject and ends the caller's
/// session without an offer ever being created.
#[tokio::test]
async fn test_reject_ends_caller_without_negotiation() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;
    let y = account(&broker, "y").await;

    x.coordinator
        .start_call(y.id.clone(), None, MediaKind::Audio)
        .await
        .unwrap();
    wait_for_session(&y, "incoming call", phase_is_incoming_offered).await;

    y.coordinator.reject().await.unwrap();
    wait_for_session(&y, "callee idle", Option::is_none).await;
    wait_for_session(&x, "caller idle", Option::is_none).await;

    // Deferred negotiation: nobody allocated media for the dead call.
    assert!(x.factory.last_engine().is_none());
    assert!(y.factory.last_engine().is_none());
    assert_eq!(x.log.entries()[0].reason, Some(EndCallReason::Declined));
}

/// Coordinators are owned by the process-scoped registry, one per
/// account.
#[tokio::test]
async fn test_registry_owns_one_coordinator_per_account() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;
    let y = account(&broker, "y").await;

    let registry = peercall::CoordinatorRegistry::new();
    registry.insert(x.coordinator.clone());
    registry.insert(y.coordinator.clone());
    assert_eq!(registry.len(), 2);

    let found = registry.get(&x.id).expect("x registered");
    assert_eq!(found.account_id(), &x.id);

    let removed = registry.remove(&x.id).expect("x removed");
    removed.shutdown().await;
    assert!(registry.get(&x.id).is_none());
    assert_eq!(registry.len(), 1);
}

/// Starting a second call while one is active is refused locally.
#[tokio::test]
async fn test_second_outgoing_call_is_refused() {
    let broker = InMemoryBroker::new();
    let x = account(&broker, "x").await;
    let y = account(&broker, "y").await;

    x.coordinator
        .start_call(y.id.clone(), None, MediaKind::Audio)
        .await
        .unwrap();

    let err = x
        .coordinator
        .start_call(AccountId::from("z"), None, MediaKind::Audio)
        .await
        .unwrap_err();
    assert!(matches!(err, peercall::CallError::AlreadyInCall));

    // Still exactly one session.
    assert_eq!(x.log.entries().len(), 1);
}
