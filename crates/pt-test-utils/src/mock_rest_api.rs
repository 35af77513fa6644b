// mock_rest_api: An axum server serving canned package data.
//
// Mirrors the read-only REST surface the tracker loads views from:
//   GET /api/packages/{code}
//   GET /api/packages/{code}/tracks
//   GET /api/packages/{code}/images
//   GET /api/addresses/{id}
// Unknown packages and addresses answer 404.  Every request is recorded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub path: String,
    pub authorization: Option<String>,
}

#[derive(Default)]
struct Data {
    packages: HashMap<String, Value>,
    tracks: HashMap<String, Vec<Value>>,
    images: HashMap<String, Vec<Value>>,
    addresses: HashMap<String, Value>,
    failing: HashMap<String, StatusCode>,
    requests: Vec<RecordedRequest>,
}

type SharedData = Arc<Mutex<Data>>;

pub struct MockRestApi {
    addr: SocketAddr,
    data: SharedData,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for MockRestApi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockRestApi {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let data = SharedData::default();

        let router = Router::new()
            .route("/api/packages/{code}", get(get_package))
            .route("/api/packages/{code}/tracks", get(get_tracks))
            .route("/api/packages/{code}/images", get(get_images))
            .route("/api/addresses/{id}", get(get_address))
            .with_state(Arc::clone(&data));

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self { addr, data, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://127.0.0.1:<port>/api`
    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    /// Register a package.  Its tracks and images default to empty lists.
    pub fn set_package(&self, code: &str, record: Value) {
        let mut data = self.data.lock().unwrap();
        data.packages.insert(code.to_owned(), record);
        data.tracks.entry(code.to_owned()).or_default();
        data.images.entry(code.to_owned()).or_default();
    }

    pub fn set_tracks(&self, code: &str, tracks: Vec<Value>) {
        self.data.lock().unwrap().tracks.insert(code.to_owned(), tracks);
    }

    /// Append one history entry, as the server would after a depot scan.
    pub fn push_track(&self, code: &str, track: Value) {
        self.data
            .lock()
            .unwrap()
            .tracks
            .entry(code.to_owned())
            .or_default()
            .push(track);
    }

    pub fn push_image(&self, code: &str, image: Value) {
        self.data
            .lock()
            .unwrap()
            .images
            .entry(code.to_owned())
            .or_default()
            .push(image);
    }

    pub fn set_address(&self, id: &str, address: Value) {
        self.data
            .lock()
            .unwrap()
            .addresses
            .insert(id.to_owned(), address);
    }

    /// Answer every request for `path` (e.g. `/api/packages/P1/images`) with
    /// `status` until cleared with [`clear_failure`](Self::clear_failure).
    pub fn fail_path(&self, path: &str, status: u16) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.data
            .lock()
            .unwrap()
            .failing
            .insert(path.to_owned(), status);
    }

    pub fn clear_failure(&self, path: &str) {
        self.data.lock().unwrap().failing.remove(path);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.data.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.data
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .count()
    }
}

/// Record the request and return the configured failure, if any.
fn record(data: &SharedData, uri: &Uri, headers: &HeaderMap) -> Result<(), StatusCode> {
    let mut data = data.lock().unwrap();
    data.requests.push(RecordedRequest {
        path: uri.path().to_owned(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    });
    match data.failing.get(uri.path()) {
        Some(status) => Err(*status),
        None => Ok(()),
    }
}

async fn get_package(
    State(data): State<SharedData>,
    Path(code): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    record(&data, &uri, &headers)?;
    let data = data.lock().unwrap();
    data.packages
        .get(&code)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_tracks(
    State(data): State<SharedData>,
    Path(code): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, StatusCode> {
    record(&data, &uri, &headers)?;
    let data = data.lock().unwrap();
    data.tracks
        .get(&code)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_images(
    State(data): State<SharedData>,
    Path(code): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, StatusCode> {
    record(&data, &uri, &headers)?;
    let data = data.lock().unwrap();
    data.images
        .get(&code)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_address(
    State(data): State<SharedData>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    record(&data, &uri, &headers)?;
    let data = data.lock().unwrap();
    data.addresses
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
