use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use tabsync::server::api;
use tabsync::session::SessionTimings;
use tabsync::sync::remote::connect_relay;
use tabsync::{
    BroadcastHub, BroadcastMessage, BroadcastTransport, ManualClock, MessageKind, SessionManager,
};

const CHANNEL: &str = "tabsync";

async fn start_relay() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let _ = api::serve(listener).await;
    });
    (addr, server)
}

/// A hub standing for one process, bridged to the relay
async fn bridged_hub(addr: SocketAddr, channel: &str) -> (BroadcastHub, JoinHandle<()>) {
    let hub = BroadcastHub::new();
    let bridge = connect_relay(&format!("ws://{addr}/ws"), hub.clone(), channel)
        .await
        .expect("relay connect");
    (hub, bridge)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_cross_processes_once() {
    let (addr, server) = start_relay().await;
    let (hub_a, bridge_a) = bridged_hub(addr, CHANNEL).await;
    let (hub_b, bridge_b) = bridged_hub(addr, CHANNEL).await;
    // Let the relay register both peers
    sleep(Duration::from_millis(200)).await;

    let tab_a = BroadcastTransport::connect(Some(&hub_a), CHANNEL);
    let tab_b = BroadcastTransport::connect(Some(&hub_b), CHANNEL);
    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(tab_b.subscribe(move |m| {
        let _ = tx.send(m);
    }));
    let mut local_a = hub_a.subscribe(CHANNEL);

    tab_a.publish(BroadcastMessage::new(
        MessageKind::SessionRefresh,
        json!({}),
        777,
    ));

    let got = timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("message not relayed")
        .unwrap();
    assert_eq!(got.kind, MessageKind::SessionRefresh);
    assert_eq!(got.timestamp, 777);

    // No echo back into the sending process
    sleep(Duration::from_millis(200)).await;
    assert!(local_a.try_recv().is_ok());
    assert!(local_a.try_recv().is_err());
    assert!(rx.try_recv().is_err());

    bridge_a.abort();
    bridge_b.abort();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channels_stay_separate_on_the_relay() {
    let (addr, server) = start_relay().await;
    let (hub_a, bridge_a) = bridged_hub(addr, "player").await;
    let (hub_b, bridge_b) = bridged_hub(addr, CHANNEL).await;
    sleep(Duration::from_millis(200)).await;

    let mut listener = hub_b.subscribe(CHANNEL);
    BroadcastTransport::connect(Some(&hub_a), "player").publish(BroadcastMessage::new(
        MessageKind::Other("player_state".into()),
        json!({}),
        1,
    ));

    sleep(Duration::from_millis(300)).await;
    assert!(listener.try_recv().is_err());

    bridge_a.abort();
    bridge_b.abort();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_refresh_adopted_across_relay() {
    let (addr, server) = start_relay().await;
    let (hub_a, bridge_a) = bridged_hub(addr, CHANNEL).await;
    let (hub_b, bridge_b) = bridged_hub(addr, CHANNEL).await;
    sleep(Duration::from_millis(200)).await;

    let session = |hub: &BroadcastHub, now: i64| {
        let s = Arc::new(SessionManager::new(
            Arc::new(ManualClock::new(now)),
            Arc::new(BroadcastTransport::connect(Some(hub), CHANNEL)),
            SessionTimings::default(),
        ));
        s.listen();
        s
    };
    let tab_a = session(&hub_a, 500_000);
    let tab_b = session(&hub_b, 1_000_000);

    assert!(tab_a.refresh_session());

    let mut rx = tab_b.subscribe();
    let state = *timeout(
        Duration::from_secs(3),
        rx.wait_for(|s| s.start_time == 500_000),
    )
    .await
    .expect("refresh not adopted")
    .unwrap();
    assert_eq!(state.last_broadcast_time, Some(500_000));

    bridge_a.abort();
    bridge_b.abort();
    server.abort();
}

#[tokio::test]
async fn health_endpoint_answers() {
    let (addr, server) = start_relay().await;

    let body: String = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, "OK");

    server.abort();
}

#[tokio::test]
async fn bad_relay_url_is_an_error() {
    assert!(connect_relay("not a url", BroadcastHub::new(), CHANNEL)
        .await
        .is_err());
}
