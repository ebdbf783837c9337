use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use tabsync::session::SessionTimings;
use tabsync::{
    BroadcastHub, BroadcastMessage, BroadcastTransport, ManualClock, MessageKind, SessionManager,
    SessionSnapshot,
};

const CHANNEL: &str = "tabsync";

fn tab(hub: &BroadcastHub, clock: &Arc<ManualClock>) -> Arc<SessionManager> {
    let transport = Arc::new(BroadcastTransport::connect(Some(hub), CHANNEL));
    let session = Arc::new(SessionManager::new(
        clock.clone(),
        transport,
        SessionTimings::default(),
    ));
    assert!(session.listen());
    session
}

async fn wait_until<F>(session: &SessionManager, predicate: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let mut rx = session.subscribe();
    let snapshot = timeout(Duration::from_secs(2), rx.wait_for(predicate))
        .await
        .expect("session state did not change in time")
        .expect("session dropped");
    *snapshot
}

#[tokio::test]
async fn refresh_is_debounced() {
    let hub = BroadcastHub::new();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let session = tab(&hub, &clock);
    let mut wire = hub.subscribe(CHANNEL);

    assert!(session.refresh_session());
    clock.advance(5_000);
    assert!(!session.refresh_session());

    let sent = wire.try_recv().expect("first refresh broadcast");
    assert_eq!(sent.message.kind, MessageKind::SessionRefresh);
    assert_eq!(sent.message.timestamp, 1_000_000);
    assert!(wire.try_recv().is_err(), "debounced refresh must not broadcast");
    assert_eq!(session.snapshot().start_time, 1_000_000);

    clock.advance(10_000);
    assert!(session.refresh_session());
    assert_eq!(session.snapshot().start_time, 1_015_000);
    assert_eq!(wire.try_recv().unwrap().message.timestamp, 1_015_000);
}

#[tokio::test]
async fn first_refresh_is_never_debounced() {
    let hub = BroadcastHub::new();
    let clock = Arc::new(ManualClock::new(100));
    let session = tab(&hub, &clock);

    // Only the start time is set; no update has been accepted yet
    assert!(session.refresh_session());
    assert_eq!(session.snapshot().last_broadcast_time, Some(100));
}

#[tokio::test]
async fn expiry_boundary() {
    let clock = Arc::new(ManualClock::new(0));
    let session = SessionManager::new(
        clock.clone(),
        Arc::new(BroadcastTransport::disabled()),
        SessionTimings::default(),
    );

    clock.set(3_599_999);
    assert!(!session.check_expiry());
    assert!(session.check_session_status());
    assert!(session.snapshot().active);

    clock.set(3_600_001);
    assert!(!session.check_session_status());
    assert!(session.check_expiry());
    let state = session.snapshot();
    assert!(state.expired);
    assert!(!state.active);
}

#[tokio::test]
async fn sibling_adopts_refresh_time() {
    let hub = BroadcastHub::new();
    let clock_a = Arc::new(ManualClock::new(500_000));
    let clock_b = Arc::new(ManualClock::new(1_000_000));
    let tab_a = tab(&hub, &clock_a);
    let tab_b = tab(&hub, &clock_b);

    assert!(tab_a.refresh_session());

    // Last message wins, even when it is older than the local start
    let state = wait_until(&tab_b, |s| s.start_time == 500_000).await;
    assert_eq!(state.last_broadcast_time, Some(500_000));
    assert!(state.active);
    assert!(!state.expired);

    // The sender is not affected by its own broadcast
    assert_eq!(tab_a.snapshot().start_time, 500_000);
}

#[tokio::test]
async fn adopted_refresh_debounces_local_refresh() {
    let hub = BroadcastHub::new();
    let clock = Arc::new(ManualClock::new(2_000_000));
    let tab_a = tab(&hub, &clock);
    let tab_b = tab(&hub, &clock);
    let mut wire = hub.subscribe(CHANNEL);

    assert!(tab_a.refresh_session());
    wait_until(&tab_b, |s| s.last_broadcast_time == Some(2_000_000)).await;
    let _ = wire.try_recv();

    clock.advance(1_000);
    assert!(!tab_b.refresh_session());
    assert!(wire.try_recv().is_err());
}

#[tokio::test]
async fn sibling_refresh_revives_expired_tab() {
    let hub = BroadcastHub::new();
    let clock = Arc::new(ManualClock::new(0));
    let tab_a = tab(&hub, &clock);
    let tab_b = tab(&hub, &clock);

    clock.set(3_700_000);
    assert!(tab_b.check_expiry());
    assert!(tab_b.is_expired());

    assert!(tab_a.refresh_session());
    let state = wait_until(&tab_b, |s| !s.expired).await;
    assert!(state.active);
    assert_eq!(state.start_time, 3_700_000);
}

#[tokio::test]
async fn fetch_time_propagates() {
    let hub = BroadcastHub::new();
    let clock = Arc::new(ManualClock::new(42_000));
    let tab_a = tab(&hub, &clock);
    let tab_b = tab(&hub, &clock);
    let mut wire = hub.subscribe(CHANNEL);

    tab_a.record_fetch();
    assert_eq!(tab_a.last_fetch_time(), Some(42_000));

    let state = wait_until(&tab_b, |s| s.last_fetch_time.is_some()).await;
    assert_eq!(state.last_fetch_time, Some(42_000));
    // Fetch updates never touch the session window
    assert_eq!(state.last_broadcast_time, None);

    let sent = wire.try_recv().unwrap();
    assert_eq!(sent.message.kind, MessageKind::LastFetchUpdate);
    assert_eq!(sent.message.data, json!({ "time": 42_000 }));
}

#[tokio::test]
async fn visibility_regained_after_expiry_broadcasts() {
    let hub = BroadcastHub::new();
    let clock = Arc::new(ManualClock::new(0));
    let session = tab(&hub, &clock);
    let mut wire = hub.subscribe(CHANNEL);

    clock.set(3_600_000);
    session.check_expiry();
    assert!(session.on_visibility_change(true));

    let sent = wire.try_recv().unwrap();
    assert_eq!(sent.message.kind, MessageKind::SessionRefresh);
    assert_eq!(sent.message.timestamp, 3_600_000);
}

#[tokio::test]
async fn single_tab_mode_without_broadcast() {
    let clock = Arc::new(ManualClock::new(10));
    let session = Arc::new(SessionManager::new(
        clock.clone(),
        Arc::new(BroadcastTransport::disabled()),
        SessionTimings::default(),
    ));

    assert!(!session.listen());
    assert!(session.refresh_session());
    session.record_fetch();
    session.broadcast_update(MessageKind::Other("custom".into()), json!({ "x": 1 }));
    assert_eq!(session.snapshot().start_time, 10);
}

#[tokio::test]
async fn monitor_expires_session() {
    let clock = Arc::new(ManualClock::new(0));
    let session = Arc::new(SessionManager::new(
        clock.clone(),
        Arc::new(BroadcastTransport::disabled()),
        SessionTimings {
            check_interval: 10,
            ..Default::default()
        },
    ));
    let monitor = session.spawn_monitor();

    clock.set(3_600_000);
    let state = wait_until(&session, |s| s.expired).await;
    assert!(!state.active);

    monitor.abort();
}

#[tokio::test]
async fn foreign_message_kinds_are_ignored() {
    let hub = BroadcastHub::new();
    let clock = Arc::new(ManualClock::new(7));
    let session = tab(&hub, &clock);
    let before = session.snapshot();

    let other = BroadcastTransport::connect(Some(&hub), CHANNEL);
    other.publish(BroadcastMessage::new(
        MessageKind::Other("player_state".into()),
        json!({ "playing": true }),
        99,
    ));
    other.publish(BroadcastMessage::new(
        MessageKind::LastFetchUpdate,
        json!({ "time": 123 }),
        123,
    ));

    // Messages arrive in order, so once the fetch update lands the first was skipped
    let state = wait_until(&session, |s| s.last_fetch_time == Some(123)).await;
    assert_eq!(state.start_time, before.start_time);
    assert_eq!(state.last_broadcast_time, None);
}
