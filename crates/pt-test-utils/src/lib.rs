// pt-test-utils: Shared test utilities for the parcel tracker.
//
// Provides a mock tracking-events WebSocket server and a mock REST API for
// integration testing of the tracker client.

pub mod mock_rest_api;
pub mod mock_tracking_server;

pub use mock_rest_api::MockRestApi;
pub use mock_tracking_server::{MockTrackingServer, UpgradeRequest};

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::Message;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn send_json(client: &mut Client, value: Value) {
        client
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for server frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Mock tracking server tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn tracking_server_starts_and_reports_port() {
        let server = MockTrackingServer::start().await.unwrap();
        assert_ne!(server.local_addr().port(), 0, "should bind to a real port");
        assert!(server.url().starts_with("ws://127.0.0.1:"));
    }

    #[tokio::test]
    async fn tracking_server_acknowledges_subscribe_and_ping() {
        let server = MockTrackingServer::start().await.unwrap();
        let (mut client, _) = tokio_tungstenite::connect_async(format!("{}?user_id=7", server.url()))
            .await
            .unwrap();

        send_json(&mut client, json!({"action": "subscribe", "package_code": "PKG1", "user_id": "7"})).await;
        assert_eq!(
            next_json(&mut client).await,
            json!({"action": "subscribed", "package_code": "PKG1"})
        );
        send_json(&mut client, json!({"action": "ping"})).await;
        assert_eq!(next_json(&mut client).await, json!({"action": "pong"}));

        let received = server.wait_for_messages(2, Duration::from_secs(5)).await;
        assert_eq!(received[0]["package_code"], "PKG1");
        assert_eq!(received[1]["action"], "ping");

        let upgrades = server.upgrades();
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].query_param("user_id").as_deref(), Some("7"));
        assert_eq!(upgrades[0].authorization, None);
    }

    #[tokio::test]
    async fn tracking_server_push_and_close_reach_the_client() {
        let server = MockTrackingServer::start().await.unwrap();
        let (mut client, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
        server.wait_for_connections(1, Duration::from_secs(5)).await;

        assert_eq!(server.push(json!({"action": "echo"})), 1);
        assert_eq!(next_json(&mut client).await, json!({"action": "echo"}));

        server.close_all(1001);
        let code = loop {
            match client.next().await {
                Some(Ok(Message::Close(Some(frame)))) => break u16::from(frame.code),
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        };
        assert_eq!(code, 1001);
    }

    #[tokio::test]
    async fn tracking_server_accepts_while_another_handshake_is_pending() {
        let server = MockTrackingServer::start().await.unwrap();
        // Connected at the TCP level but never sends the upgrade request.
        let _silent = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();

        let (mut client, _) = tokio::time::timeout(
            Duration::from_secs(5),
            tokio_tungstenite::connect_async(server.url()),
        )
        .await
        .expect("handshake blocked behind the silent client")
        .unwrap();
        send_json(&mut client, json!({"action": "ping"})).await;
        assert_eq!(next_json(&mut client).await, json!({"action": "pong"}));
        assert_eq!(server.upgrades().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Mock REST API tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn rest_api_serves_canned_records() {
        let api = MockRestApi::start().await.unwrap();
        api.set_package("PKG1", json!({"tracking_code": "PKG1", "status": "Created"}));
        api.push_track("PKG1", json!({"id": 1, "action": "CREATE", "timestamp": "2024-01-01T00:00:00Z"}));

        let client = reqwest::Client::new();
        let package: Value = client
            .get(format!("{}/packages/PKG1", api.base_url()))
            .bearer_auth("tok")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(package["status"], "Created");

        let tracks: Value = reqwest::get(format!("{}/packages/PKG1/tracks", api.base_url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(tracks.as_array().unwrap().len(), 1);

        let images: Value = reqwest::get(format!("{}/packages/PKG1/images", api.base_url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(images, json!([]));

        let missing = reqwest::get(format!("{}/packages/NOPE", api.base_url()))
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        assert_eq!(api.request_count("/api/packages/PKG1"), 1);
        let requests = api.requests();
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer tok"));
    }
}
