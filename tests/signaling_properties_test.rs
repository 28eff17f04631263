use marketcall::calls::escrow::EscrowIgnoreReason;
use marketcall::calls::state::IgnoreReason;
use marketcall::calls::{
    CallData, CallState, CallTransition, EscrowDetails, EscrowState, EscrowTransition, Ignored,
    InboundSignal, SessionStore, SignalEvent, SignalKind,
};
use marketcall::{Party, RoomId};
use serde_json::json;

fn buyer() -> Party {
    Party::new("buyer", "Ada")
}

fn seller() -> Party {
    Party::new("seller", "Sam")
}

fn offer(room: &str) -> CallData {
    CallData::new(RoomId::from(room), buyer(), seller())
}

fn shoes() -> EscrowDetails {
    EscrowDetails {
        amount: 5000.0,
        item_title: "Shoes".to_string(),
        item_description: "Size 42".to_string(),
        reference: Some("ESC-0001".to_string()),
        call_session_id: None,
    }
}

fn ringing_seller(room: &str) -> SessionStore {
    let mut store = SessionStore::new(seller());
    store
        .apply_call(CallTransition::RemoteIncoming { data: offer(room) })
        .unwrap();
    store
}

fn active_seller(room: &str) -> SessionStore {
    let mut store = ringing_seller(room);
    store
        .apply_call(CallTransition::Accept {
            room_id: room.into(),
        })
        .unwrap();
    store
}

#[test]
fn test_duplicate_delivery_is_idempotent() {
    let mut store = ringing_seller("room-1");
    let before = store.session().cloned();

    let again = store
        .apply_call(CallTransition::RemoteIncoming {
            data: offer("room-1"),
        })
        .unwrap();

    assert!(matches!(
        again.ignored,
        Some(Ignored::Call(IgnoreReason::Duplicate { .. }))
    ));
    assert!(again.outbound.is_empty());
    assert!(again.notifications.is_empty());
    assert_eq!(store.session().cloned(), before);
}

#[test]
fn test_stale_events_never_touch_the_session() {
    let mut store = active_seller("room-2");

    for trigger in [
        CallTransition::RemoteEnded {
            room_id: "room-1".into(),
        },
        CallTransition::RemoteAccepted {
            room_id: "room-1".into(),
        },
        CallTransition::RemoteRejected {
            room_id: "room-1".into(),
        },
    ] {
        let update = store.apply_call(trigger).unwrap();
        assert!(update.is_ignored());
        assert!(update.outbound.is_empty());
    }

    assert_eq!(store.call_state(), CallState::Active);
    assert_eq!(store.room_id().map(|r| r.as_str()), Some("room-2"));
}

#[test]
fn test_escrow_needs_an_active_call() {
    let mut store = ringing_seller("room-1");

    let update = store
        .apply_escrow(EscrowTransition::RemoteRequested {
            room_id: "room-1".into(),
            details: shoes(),
        })
        .unwrap();

    assert!(matches!(
        update.ignored,
        Some(Ignored::Escrow(EscrowIgnoreReason::NoActiveSession { .. }))
    ));
    assert_eq!(store.escrow_state(), EscrowState::None);
}

#[test]
fn test_escrow_for_another_room_is_ignored() {
    let mut store = active_seller("room-2");

    let update = store
        .apply_escrow(EscrowTransition::RemoteRequested {
            room_id: "room-1".into(),
            details: shoes(),
        })
        .unwrap();

    assert!(update.is_ignored());
    assert!(store.escrow().is_none());
}

#[test]
fn test_every_terminal_path_returns_to_idle() {
    let remote_end = |room: &str| CallTransition::RemoteEnded {
        room_id: room.into(),
    };

    // Ringing, remote cancel.
    let mut store = ringing_seller("room-1");
    store.apply_call(remote_end("room-1")).unwrap();
    assert_eq!(store.call_state(), CallState::Idle);

    // Ringing, local decline.
    let mut store = ringing_seller("room-1");
    let update = store
        .apply_call(CallTransition::Reject {
            room_id: "room-1".into(),
        })
        .unwrap();
    assert_eq!(update.outbound[0].kind, SignalKind::Rejected);
    assert_eq!(store.call_state(), CallState::Idle);

    // Active, remote hangup with an open negotiation.
    let mut store = active_seller("room-1");
    store
        .apply_escrow(EscrowTransition::RemoteRequested {
            room_id: "room-1".into(),
            details: shoes(),
        })
        .unwrap();
    assert_eq!(store.escrow_state(), EscrowState::Requested);
    store.apply_call(remote_end("room-1")).unwrap();
    assert_eq!(store.call_state(), CallState::Idle);
    assert_eq!(store.escrow_state(), EscrowState::None);

    // Caller side, declined.
    let mut store = SessionStore::new(buyer());
    store
        .apply_call(CallTransition::Initiate {
            data: offer("room-1"),
        })
        .unwrap();
    store
        .apply_call(CallTransition::RemoteRejected {
            room_id: "room-1".into(),
        })
        .unwrap();
    assert_eq!(store.call_state(), CallState::Idle);
    assert!(store.session().is_none());
}

#[test]
fn test_room_mismatch_is_malformed() {
    let raw = InboundSignal {
        topic: "Accepted".to_string(),
        room_id: "room-1".to_string(),
        payload: json!({
            "roomId": "room-9",
            "caller": {"id": "buyer", "displayName": "Ada"},
            "receiver": {"id": "seller", "displayName": "Sam"},
        }),
    };
    assert!(SignalEvent::parse(&raw).is_err());
}

#[test]
fn test_snapshot_serializes_for_the_ui() {
    let store = active_seller("room-1");
    let value = serde_json::to_value(store.snapshot()).unwrap();
    assert_eq!(value["callState"], "Active");
    assert_eq!(value["session"]["roomId"], "room-1");
    assert_eq!(value["escrowState"], "None");
}
