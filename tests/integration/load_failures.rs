//! REST failure handling during initial loads.

use parcel_tracker::config::load_config_from_str;
use parcel_tracker::reconciler::{LoadPhase, ViewState};
use parcel_tracker::rest::HttpTrackingApi;
use parcel_tracker::{TrackerHandle, spawn};
use pt_test_utils::{MockRestApi, MockTrackingServer};
use serde_json::json;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn start(server: &MockTrackingServer, api: &MockRestApi) -> TrackerHandle {
    let cfg = load_config_from_str(&format!(
        "schema_version = 1\n[tracking]\nws_url = \"{}\"\n[api]\nbase_url = \"{}\"\n",
        server.url(),
        api.base_url()
    ))
    .unwrap();
    let rest = HttpTrackingApi::new(&cfg.api.base_url, None).unwrap();
    spawn(&cfg, rest).0
}

async fn wait_view(handle: &TrackerHandle, pred: impl FnMut(&ViewState) -> bool) -> ViewState {
    let mut rx = handle.tracking();
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for view state")
        .unwrap()
        .clone()
}

fn seed(api: &MockRestApi) {
    api.set_package("PKG1", json!({"tracking_code": "PKG1", "status": "Created", "receiver_address_id": "a1"}));
    api.push_track(
        "PKG1",
        json!({"id": 1, "action": "CREATE", "timestamp": "2024-01-01T00:00:00Z"}),
    );
}

#[tokio::test]
async fn failed_initial_load_reports_error_and_retries_on_next_track() {
    let server = MockTrackingServer::start().await.unwrap();
    let api = MockRestApi::start().await.unwrap();
    seed(&api);
    api.fail_path("/api/packages/PKG1", 503);
    let handle = start(&server, &api);

    handle.track("PKG1");
    let state = wait_view(&handle, |s| s.last_load_error.is_some()).await;
    assert_eq!(state.phase, LoadPhase::Idle);
    assert!(state.view.is_none());
    assert!(state.last_load_error.unwrap().contains("503"));

    api.clear_failure("/api/packages/PKG1");
    handle.track("PKG1");
    let state = wait_view(&handle, |s| s.phase == LoadPhase::Loaded).await;
    assert!(state.last_load_error.is_none());
    assert_eq!(state.view.unwrap().steps().len(), 1);
}

#[tokio::test]
async fn image_and_address_failures_still_load_the_view() {
    let server = MockTrackingServer::start().await.unwrap();
    let api = MockRestApi::start().await.unwrap();
    seed(&api);
    api.fail_path("/api/packages/PKG1/images", 500);
    let handle = start(&server, &api);

    handle.track("PKG1");
    let state = wait_view(&handle, |s| s.phase == LoadPhase::Loaded).await;
    let view = state.view.unwrap();
    assert!(view.images.is_empty());
    assert!(view.recipient.is_none(), "address a1 was never registered");
    assert_eq!(api.request_count("/api/addresses/a1"), 1);
}

#[tokio::test]
async fn unknown_package_fails_with_not_found() {
    let server = MockTrackingServer::start().await.unwrap();
    let api = MockRestApi::start().await.unwrap();
    let handle = start(&server, &api);

    handle.track("GHOST");
    let state = wait_view(&handle, |s| s.last_load_error.is_some()).await;
    assert_eq!(state.package_code.as_deref(), Some("GHOST"));
    assert!(state.last_load_error.unwrap().contains("404"));
}
