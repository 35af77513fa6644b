//! Connection manager driven by hand against the mock tracking server.

use pt_protocol::{ClientMessage, ServerMessage};
use pt_test_utils::MockTrackingServer;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracker::config::ReconnectConfig;
use tracker::connection::{
    ConnEvent, ConnectionConfig, ConnectionManager, ConnectionSignal, ConnectionState,
    build_ws_request,
};

const WAIT: Duration = Duration::from_secs(5);

fn manager(url: &str) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnEvent>) {
    ConnectionManager::new(ConnectionConfig {
        ws_url: url.to_owned(),
        token: Some("opaque-token".to_owned()),
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(50),
            max_attempts: 3,
        },
        heartbeat_interval: Duration::from_secs(60),
    })
}

/// Feed link events and timers into the manager until `done` holds,
/// collecting the signals it produced.
async fn drive(
    mgr: &mut ConnectionManager,
    events: &mut mpsc::UnboundedReceiver<ConnEvent>,
    mut done: impl FnMut(&ConnectionManager, &[ConnectionSignal]) -> bool,
) -> Vec<ConnectionSignal> {
    let mut signals = Vec::new();
    tokio::time::timeout(WAIT, async {
        while !done(mgr, &signals) {
            let deadline = mgr
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                Some(event) = events.recv() => {
                    if let Some(signal) = mgr.handle_event(event, Instant::now()) {
                        signals.push(signal);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => mgr.on_timer(Instant::now()),
            }
        }
    })
    .await
    .expect("connection manager did not reach the expected state");
    signals
}

#[tokio::test]
async fn opaque_token_sends_bearer_without_user_id() {
    let server = MockTrackingServer::start().await.unwrap();
    let (mut mgr, mut events) = manager(&server.url());
    assert!(mgr.user_id().is_none());
    assert!(!mgr.send_message(&ClientMessage::Ping), "nothing is sent before connecting");

    mgr.connect();
    mgr.connect();
    assert_eq!(mgr.state(), ConnectionState::Connecting);
    let signals = drive(&mut mgr, &mut events, |m, _| m.is_connected()).await;
    assert_eq!(signals, [ConnectionSignal::Ready { resumed: false }]);

    let upgrades = server.upgrades();
    assert_eq!(upgrades.len(), 1, "double connect dials once");
    assert_eq!(upgrades[0].uri, "/ws");
    assert_eq!(upgrades[0].authorization.as_deref(), Some("Bearer opaque-token"));
}

#[tokio::test]
async fn message_handler_sees_every_decoded_frame() {
    let server = MockTrackingServer::start().await.unwrap();
    let (mut mgr, mut events) = manager(&server.url());
    let seen: Arc<Mutex<Vec<ServerMessage>>> = Arc::default();
    let sink = Arc::clone(&seen);
    mgr.set_message_handler(Some(Box::new(move |msg: &ServerMessage| {
        sink.lock().unwrap().push(msg.clone());
    })));

    mgr.connect();
    drive(&mut mgr, &mut events, |m, _| m.is_connected()).await;
    assert!(mgr.send_message(&ClientMessage::subscribe("PKG1", None)));
    // The ack is queued before the server records the subscribe.
    server.wait_for_messages(1, WAIT).await;
    server.push(json!({"action": "package_created", "package_code": "PKG1"}));
    server.push(json!({"action": "surprise"}));

    let signals = drive(&mut mgr, &mut events, |_, s| {
        s.iter().any(|sig| matches!(sig, ConnectionSignal::Event(_)))
    })
    .await;
    assert_eq!(signals.len(), 1);

    // subscribed ack, package_created; the unknown action arrives last.
    drive(&mut mgr, &mut events, |_, _| seen.lock().unwrap().len() >= 3).await;
    let seen = seen.lock().unwrap();
    assert!(matches!(seen.last(), Some(ServerMessage::Unknown { action }) if action == "surprise"));
}

#[tokio::test]
async fn server_normal_close_leaves_manager_disconnected() {
    let server = MockTrackingServer::start().await.unwrap();
    let (mut mgr, mut events) = manager(&server.url());
    mgr.connect();
    drive(&mut mgr, &mut events, |m, _| m.is_connected()).await;

    server.close_all(1000);
    let signals = drive(&mut mgr, &mut events, |_, s| s.contains(&ConnectionSignal::Lost)).await;
    assert_eq!(signals, [ConnectionSignal::Lost]);
    assert_eq!(mgr.state(), ConnectionState::Disconnected);
    assert!(mgr.reconnect_deadline().is_none());
    assert_eq!(mgr.reconnect_attempts(), 0);
}

#[tokio::test]
async fn dropped_link_reconnects_as_resumed() {
    let server = MockTrackingServer::start().await.unwrap();
    let (mut mgr, mut events) = manager(&server.url());
    mgr.connect();
    drive(&mut mgr, &mut events, |m, _| m.is_connected()).await;

    server.drop_all();
    let signals = drive(&mut mgr, &mut events, |_, s| {
        s.contains(&ConnectionSignal::Ready { resumed: true })
    })
    .await;
    assert_eq!(
        signals,
        [ConnectionSignal::Lost, ConnectionSignal::Ready { resumed: true }]
    );
    assert_eq!(mgr.reconnect_attempts(), 0);
    assert_eq!(server.upgrades().len(), 2);
}

#[test]
fn upgrade_request_carries_user_id_and_bearer() {
    let request = build_ws_request("wss://track.example.com/ws", Some("t0k"), Some("u 1")).unwrap();
    assert_eq!(request.uri().to_string(), "wss://track.example.com/ws?user_id=u+1");
    assert_eq!(request.headers()["Authorization"], "Bearer t0k");
    assert!(request.headers().contains_key("Sec-WebSocket-Key"));

    assert!(build_ws_request("not a url", None, None).is_err());
}
