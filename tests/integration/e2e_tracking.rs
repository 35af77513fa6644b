//! End-to-end tracking flow through the umbrella crate.
//!
//! Config is loaded from a file on disk, the session runs against the mock
//! tracking server and the mock REST API, and the view is observed only
//! through the handle's watch channel.

use parcel_tracker::config::load_config_from_path;
use parcel_tracker::connection::ConnectionState;
use parcel_tracker::reconciler::{LoadPhase, ViewState};
use parcel_tracker::rest::HttpTrackingApi;
use parcel_tracker::view::StepStatus;
use parcel_tracker::{TrackerHandle, spawn};
use pt_test_utils::{MockRestApi, MockTrackingServer};
use serde_json::json;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn write_config(dir: &tempfile::TempDir, server: &MockTrackingServer, api: &MockRestApi) -> std::path::PathBuf {
    let path = dir.path().join("tracker.toml");
    std::fs::write(
        &path,
        format!(
            r#"
schema_version = 1

[tracking]
ws_url = "{}"

[api]
base_url = "{}"

[reconcile]
settle_delay_ms = 60000
created_refetch_delay_ms = 200
"#,
            server.url(),
            api.base_url()
        ),
    )
    .unwrap();
    path
}

async fn wait_view(handle: &TrackerHandle, pred: impl FnMut(&ViewState) -> bool) -> ViewState {
    let mut rx = handle.tracking();
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for view state")
        .unwrap()
        .clone()
}

#[tokio::test]
async fn package_created_burst_triggers_one_refetch() {
    let server = MockTrackingServer::start().await.unwrap();
    let api = MockRestApi::start().await.unwrap();
    api.set_package("NEW1", json!({"tracking_code": "NEW1"}));

    let dir = tempfile::tempdir().unwrap();
    let cfg = load_config_from_path(&write_config(&dir, &server, &api)).unwrap();
    assert!(cfg.token.is_none());
    let rest = HttpTrackingApi::new(&cfg.api.base_url, None).unwrap();
    let (handle, session) = spawn(&cfg, rest);

    handle.track("NEW1");
    let state = wait_view(&handle, |s| s.phase == LoadPhase::Loaded).await;
    assert_eq!(state.view.as_ref().unwrap().steps().len(), 0);

    let mut status = handle.connection();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    server.wait_for_messages(1, WAIT).await;

    api.push_track(
        "NEW1",
        json!({"track_id": "t1", "action": "CREATE", "timestamp": "2024-02-01T12:30:00Z"}),
    );
    for _ in 0..3 {
        server.push(json!({"action": "package_created", "package_code": "NEW1"}));
    }

    let state = wait_view(&handle, |s| {
        s.view.as_ref().is_some_and(|v| v.steps().len() == 1)
    })
    .await;
    let view = state.view.unwrap();
    let step = view.latest_step().unwrap();
    assert_eq!(step.title, "Package Created");
    assert_eq!(step.date, "2024-02-01");
    assert_eq!(step.time, "12:30");
    assert_eq!(step.status, StepStatus::Current);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        api.request_count("/api/packages/NEW1/tracks"),
        2,
        "one initial load plus one debounced re-fetch"
    );

    drop(handle);
    tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, async {
        while server.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dropping the last handle should disconnect");
}
