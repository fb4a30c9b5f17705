//! End-to-end broadcast scenarios
//!
//! A broadcaster and its viewers talk through the in-process signaling hub;
//! transports and capture are in-memory doubles so timing is deterministic
//! under a paused clock.
//!
//! Run with: cargo test --test scenarios

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use livecast_session::reconnect::ReconnectEvent;
use livecast_session::testing::{MockCapture, MockLocalAudio, MockTransportFactory, RecordingChannel};
use livecast_session::transport::{SdpType, SessionDescription, TransportState};
use livecast_session::{
    BroadcastServices, BroadcastSession, CaptureSource, Config, FileSnapshotStore,
    LocalSignalingChannel, MemorySnapshotStore, OperatorEvent, RoomId, SessionState, SignalEnvelope,
    SignalEvent, SignalMessage, SignalingChannel, SignalingHub, SnapshotStore, StreamState,
    TransportFactory, UserInfo, ViewerEvent, ViewerId, ViewerSession,
};
use tokio::sync::broadcast;

struct Room {
    hub: SignalingHub,
    broadcaster: BroadcastSession,
    factory: Arc<MockTransportFactory>,
}

fn room_with(snapshots: Arc<dyn SnapshotStore>) -> Room {
    let hub = SignalingHub::new();
    let factory = Arc::new(MockTransportFactory::new());
    let broadcaster = BroadcastSession::new(
        Config::default(),
        "host",
        BroadcastServices {
            signaling: Arc::new(LocalSignalingChannel::broadcaster(hub.clone(), "host")),
            transports: Arc::clone(&factory) as Arc<dyn TransportFactory>,
            capture: Arc::new(MockCapture::new()) as Arc<dyn CaptureSource>,
            snapshots,
        },
    )
    .unwrap();
    Room {
        hub,
        broadcaster,
        factory,
    }
}

fn room() -> Room {
    room_with(Arc::new(MemorySnapshotStore::new()))
}

/// A viewer that answers every offer it receives
async fn answering_viewer(hub: &SignalingHub, id: &str) -> (Arc<ViewerSession>, broadcast::Receiver<ViewerEvent>) {
    let signaling: Arc<dyn SignalingChannel> = Arc::new(LocalSignalingChannel::viewer(hub.clone(), id));
    let viewer = ViewerSession::new(
        RoomId::from("room1"),
        UserInfo::named(id),
        signaling,
        Arc::new(MockTransportFactory::new()),
        Arc::new(MockLocalAudio::new()),
    );
    let events = viewer.subscribe();
    tokio::spawn(Arc::clone(&viewer).run());
    viewer.join().await.unwrap();
    (viewer, events)
}

/// A viewer that joins and then never answers
async fn silent_viewer(hub: &SignalingHub, id: &str) -> LocalSignalingChannel {
    let channel = LocalSignalingChannel::viewer(hub.clone(), id);
    channel.connect(&RoomId::from("room1")).await.unwrap();
    channel
        .send(SignalMessage::ViewerJoin {
            room_id: RoomId::from("room1"),
            user_info: None,
        })
        .await
        .unwrap();
    channel
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn drain<T: Clone>(events: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn scenario_a_three_viewers_connect() {
    let room = room();
    room.broadcaster
        .start_broadcast(Some(RoomId::from("room1")))
        .await
        .unwrap();
    assert_eq!(room.broadcaster.state(), StreamState::Live);

    let mut viewers = Vec::new();
    for id in ["v1", "v2", "v3"] {
        viewers.push(answering_viewer(&room.hub, id).await);
    }
    settle().await;

    let mut offer_ids = HashSet::new();
    for (viewer, events) in &mut viewers {
        let answered: Vec<_> = drain(events)
            .into_iter()
            .filter_map(|event| match event {
                ViewerEvent::Answered { offer_id } => Some(offer_id),
                _ => None,
            })
            .collect();
        assert_eq!(answered.len(), 1, "{} saw more than one offer", viewer.viewer_id());
        offer_ids.extend(answered);
    }
    assert_eq!(offer_ids.len(), 3);

    for id in ["v1", "v2", "v3"] {
        let viewer_id = ViewerId::from(id);
        assert_eq!(
            room.broadcaster.registry().get(&viewer_id).unwrap().state(),
            SessionState::Answered
        );
        assert!(room.factory.emit_state(&viewer_id, TransportState::Connected));
    }
    settle().await;

    for session in room.broadcaster.registry().sessions() {
        assert_eq!(session.state(), SessionState::Connected);
    }
    assert_eq!(room.broadcaster.viewer_count(), 3);
    assert_eq!(*room.broadcaster.subscribe_viewer_count().borrow(), 3);
    assert_eq!(room.hub.viewer_count(&RoomId::from("room1")), 3);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_unanswered_viewer_is_dropped() {
    let room = room();
    room.broadcaster
        .start_broadcast(Some(RoomId::from("room1")))
        .await
        .unwrap();
    let mut operator = room.broadcaster.subscribe_operator_events();

    let _answering = answering_viewer(&room.hub, "v1").await;
    let _silent = silent_viewer(&room.hub, "v2").await;
    settle().await;
    assert_eq!(room.broadcaster.viewer_count(), 2);

    // Three retries keep the session alive.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let silent = room.broadcaster.registry().get(&ViewerId::from("v2")).unwrap();
    assert_eq!(silent.state(), SessionState::OfferSent);
    assert_eq!(silent.info().await.offer_attempts, 3);

    // The fourth expiry closes it.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(silent.state(), SessionState::Closed);
    assert!(room.broadcaster.registry().get(&ViewerId::from("v2")).is_none());
    assert_eq!(room.broadcaster.registry().roster(), vec![ViewerId::from("v1")]);
    assert_eq!(room.broadcaster.viewer_count(), 1);

    let dropped = drain(&mut operator).into_iter().any(|event| {
        matches!(event, OperatorEvent::ViewerDropped { ref viewer_id, .. } if viewer_id.as_str() == "v2")
    });
    assert!(dropped);
}

/// A live room on a recording channel with `viewers` answered and connected
async fn connected_room_on_recording_channel(
    config: Config,
    snapshots: Arc<dyn SnapshotStore>,
    viewers: &[&str],
) -> (BroadcastSession, Arc<RecordingChannel>, Arc<MockTransportFactory>) {
    let signaling = Arc::new(RecordingChannel::new());
    let factory = Arc::new(MockTransportFactory::new());
    let broadcaster = BroadcastSession::new(
        config,
        "host",
        BroadcastServices {
            signaling: Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
            transports: Arc::clone(&factory) as Arc<dyn TransportFactory>,
            capture: Arc::new(MockCapture::new()),
            snapshots,
        },
    )
    .unwrap();

    let confirm = Arc::clone(&signaling);
    tokio::spawn(async move {
        while confirm.sent_of_type("createRoom").is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        confirm.inject(SignalEvent::Message(SignalEnvelope::new(
            SignalMessage::RoomCreated {
                room_id: RoomId::from("room1"),
            },
        )));
    });
    broadcaster
        .start_broadcast(Some(RoomId::from("room1")))
        .await
        .unwrap();

    for id in viewers {
        signaling.inject(SignalEvent::Message(SignalEnvelope::new(
            SignalMessage::ViewerJoined {
                socket_id: ViewerId::from(*id),
                user_info: None,
                viewer_count: 1,
            },
        )));
    }
    settle().await;
    for id in viewers {
        let viewer_id = ViewerId::from(*id);
        let offer_id = broadcaster
            .registry()
            .get(&viewer_id)
            .unwrap()
            .info()
            .await
            .pending_offer_id
            .unwrap();
        broadcaster
            .registry()
            .handle_answer(
                &viewer_id,
                Some(&offer_id),
                SessionDescription::new(SdpType::Answer, "v=0"),
            )
            .await
            .unwrap();
        factory.emit_state(&viewer_id, TransportState::Connected);
    }
    settle().await;
    (broadcaster, signaling, factory)
}

#[tokio::test(start_paused = true)]
async fn scenario_c_signaling_loss_recreates_sessions() {
    let (broadcaster, signaling, factory) = connected_room_on_recording_channel(
        Config::default(),
        Arc::new(MemorySnapshotStore::new()),
        &["v1", "v2"],
    )
    .await;
    let mut recovery = broadcaster.subscribe_recovery();

    signaling.drop_connection("socket closed");
    settle().await;
    assert_eq!(broadcaster.reconnect_attempts(), 1);
    assert_eq!(signaling.reconnect_count(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(signaling.reconnect_count(), 1);
    assert_eq!(broadcaster.reconnect_attempts(), 0);

    let events = drain(&mut recovery);
    assert_eq!(
        events[0],
        ReconnectEvent::Scheduled {
            attempt: 1,
            delay: Duration::from_millis(1000)
        }
    );
    assert!(events.contains(&ReconnectEvent::Succeeded {
        attempt: 1,
        sessions: 2
    }));

    for id in ["v1", "v2"] {
        let viewer_id = ViewerId::from(id);
        assert_eq!(factory.transports_for(&viewer_id).len(), 2);
        assert_eq!(
            broadcaster.registry().get(&viewer_id).unwrap().state(),
            SessionState::OfferSent
        );
    }
    assert_eq!(broadcaster.viewer_count(), 2);
    assert_eq!(broadcaster.state(), StreamState::Live);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_exhausted_reconnection_recovers_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.reconnect.snapshot_path = dir.path().join("recovery.json").to_string_lossy().into_owned();
    let store = Arc::new(FileSnapshotStore::from_config(&config.reconnect));
    let (broadcaster, signaling, factory) = connected_room_on_recording_channel(
        config,
        Arc::clone(&store) as Arc<dyn SnapshotStore>,
        &["v1", "v2"],
    )
    .await;
    let mut recovery = broadcaster.subscribe_recovery();

    // The server stays unreachable from here on.
    signaling.set_reconnect_fails(true);
    signaling.drop_connection("socket closed");
    settle().await;
    assert_eq!(broadcaster.reconnect_attempts(), 1);

    // Attempts at 1s, 3s, 7s, 15s and 31s all fail.
    tokio::time::sleep(Duration::from_secs(32)).await;
    assert_eq!(signaling.reconnect_count(), 5);
    assert!(broadcaster.is_recovering());
    assert_eq!(broadcaster.state(), StreamState::Live);

    let snapshot = broadcaster.pending_recovery().await.unwrap().unwrap();
    assert_eq!(snapshot.room_id, RoomId::from("room1"));
    assert_eq!(snapshot.reconnect_attempts, 5);
    assert_eq!(snapshot.viewers, vec![ViewerId::from("v1"), ViewerId::from("v2")]);
    assert!(store.path().exists());
    // Nobody can hear the notice while the channel is down.
    assert!(signaling.sent_of_type("recovery-attempt").is_empty());

    let events = drain(&mut recovery);
    assert!(events.contains(&ReconnectEvent::RecoveryStarted { attempts: 5 }));
    assert!(events
        .iter()
        .any(|event| matches!(event, ReconnectEvent::SnapshotPersisted(persisted) if persisted.viewers == snapshot.viewers)));
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, ReconnectEvent::AttemptFailed { .. }))
            .count(),
        5
    );

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(broadcaster.state(), StreamState::Idle);
    assert!(broadcaster.room().is_none());
    assert_eq!(broadcaster.viewer_count(), 0);
    assert_eq!(broadcaster.active_timers(), 0);
    assert!(!broadcaster.is_recovering());
    assert!(drain(&mut recovery).contains(&ReconnectEvent::RecoveryCompleted { graceful: true }));
    let reason = broadcaster.last_stop_reason().unwrap();
    assert!(reason.starts_with("Recovery exhausted after 5 reconnection attempts"), "{reason}");
    for id in ["v1", "v2"] {
        assert!(factory.transport(&ViewerId::from(id)).unwrap().is_closed());
    }

    broadcaster.clear_recovery().await.unwrap();
    assert!(broadcaster.pending_recovery().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_e_one_failing_viewer_leaves_the_room_alone() {
    let room = room();
    room.broadcaster
        .start_broadcast(Some(RoomId::from("room1")))
        .await
        .unwrap();
    let mut viewers = Vec::new();
    for id in ["v1", "v2", "v3"] {
        viewers.push(answering_viewer(&room.hub, id).await);
    }
    settle().await;
    for id in ["v1", "v2", "v3"] {
        room.factory.emit_state(&ViewerId::from(id), TransportState::Connected);
    }
    settle().await;
    let untouched: Vec<_> = ["v2", "v3"]
        .iter()
        .map(|id| room.broadcaster.registry().get(&ViewerId::from(*id)).unwrap())
        .collect();
    let mut operator = room.broadcaster.subscribe_operator_events();

    // v1 can never get a transport again.
    let v1 = ViewerId::from("v1");
    room.factory.set_failing_for(&v1, true);
    room.factory.emit_state(&v1, TransportState::Failed);
    settle().await;
    assert_eq!(room.broadcaster.retry_attempts(&v1), 1);
    assert_eq!(room.broadcaster.reconnect_attempts(), 0);

    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(room.broadcaster.state(), StreamState::Live);
    assert!(!room.broadcaster.is_recovering());
    assert!(room.broadcaster.registry().get(&v1).is_none());
    assert_eq!(room.broadcaster.viewer_count(), 2);
    for session in &untouched {
        let current = room.broadcaster.registry().get(session.viewer_id()).unwrap();
        assert!(Arc::ptr_eq(&current, session));
        assert_eq!(current.state(), SessionState::Connected);
        assert_eq!(room.factory.transports_for(session.viewer_id()).len(), 1);
    }

    let events = drain(&mut operator);
    assert!(events.iter().any(|event| {
        matches!(event, OperatorEvent::ViewerDropped { viewer_id, .. } if *viewer_id == v1)
    }));
    assert!(!events.iter().any(|event| {
        matches!(
            event,
            OperatorEvent::Recovery(ReconnectEvent::Scheduled { .. } | ReconnectEvent::RecoveryStarted { .. })
        )
    }));
}

#[tokio::test(start_paused = true)]
async fn stopping_twice_is_rejected() {
    let room = room();
    room.broadcaster
        .start_broadcast(Some(RoomId::from("room1")))
        .await
        .unwrap();
    room.broadcaster.stop_broadcast(None).await.unwrap();
    assert!(room.broadcaster.stop_broadcast(None).await.is_err());

    // The room can be opened again afterwards.
    room.broadcaster
        .start_broadcast(Some(RoomId::from("room2")))
        .await
        .unwrap();
    assert_eq!(
        room.broadcaster.room().unwrap().room_id,
        RoomId::from("room2")
    );
}
