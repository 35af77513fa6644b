//! The tracking session: one task owning the connection manager, the
//! subscription registry and the event reconciler.
//!
//! Everything that mutates tracking state happens inside the session task,
//! on delivery of a handle command, a link event, a finished REST load or a
//! timer deadline.  Callers talk to the session
//! through a cloneable [`TrackerHandle`] and observe it through two watch
//! channels.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::TrackerConfig;
use crate::connection::{ConnEvent, ConnectionManager, ConnectionSignal, ConnectionSnapshot};
use crate::reconciler::{EventReconciler, LoadPhase, ViewState};
use crate::registry::SubscriptionRegistry;
use crate::rest::{ApiError, TrackingApi, load_tracking_view};
use crate::view::TrackingView;

#[derive(Debug)]
enum Command {
    Track(String),
    Close,
}

struct LoadOutcome {
    package_code: String,
    seq: u64,
    result: Result<TrackingView, ApiError>,
}

/// Cloneable control surface for a running session.  The session stops once
/// every handle is dropped.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionSnapshot>,
    view_rx: watch::Receiver<ViewState>,
}

impl TrackerHandle {
    /// Start viewing `package_code`.  Replaces any package already viewed.
    /// Returns false if the session has stopped.
    pub fn track(&self, package_code: impl Into<String>) -> bool {
        self.cmd_tx.send(Command::Track(package_code.into())).is_ok()
    }

    /// Stop viewing, drop every subscription and disconnect.  The session
    /// stays alive and accepts a later [`track`](Self::track).
    pub fn close(&self) -> bool {
        self.cmd_tx.send(Command::Close).is_ok()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.status_rx.clone()
    }

    pub fn tracking(&self) -> watch::Receiver<ViewState> {
        self.view_rx.clone()
    }

    /// The most recently published view state.
    pub fn current(&self) -> ViewState {
        self.view_rx.borrow().clone()
    }
}

struct TrackingSession<A> {
    api: Arc<A>,
    conn: ConnectionManager,
    conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    registry: SubscriptionRegistry,
    reconciler: EventReconciler,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    loads: JoinSet<LoadOutcome>,
    view_tx: watch::Sender<ViewState>,
}

/// Start a session on the current runtime.
pub fn spawn<A: TrackingApi>(config: &TrackerConfig, api: A) -> (TrackerHandle, JoinHandle<()>) {
    let (conn, conn_rx) = ConnectionManager::new(config.connection());
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(ViewState::default());
    let handle = TrackerHandle {
        cmd_tx,
        status_rx: conn.subscribe_status(),
        view_rx,
    };
    let session = TrackingSession {
        api: Arc::new(api),
        conn,
        conn_rx,
        registry: SubscriptionRegistry::new(),
        reconciler: EventReconciler::new(config.reconcile),
        cmd_rx,
        loads: JoinSet::new(),
        view_tx,
    };
    (handle, tokio::spawn(session.run()))
}

impl<A: TrackingApi> TrackingSession<A> {
    async fn run(mut self) {
        info!("tracking session started");
        loop {
            let deadline = earliest(self.conn.next_deadline(), self.reconciler.next_deadline());
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Track(code)) => self.track(&code),
                    Some(Command::Close) => self.close_view(),
                    None => {
                        self.close_view();
                        self.publish();
                        break;
                    }
                },
                Some(event) = self.conn_rx.recv() => self.on_conn_event(event),
                Some(joined) = self.loads.join_next(), if !self.loads.is_empty() => {
                    self.on_load(joined);
                }
                _ = sleep_until_deadline(deadline) => self.on_deadline(),
            }
            self.publish();
        }
        info!("tracking session stopped");
    }

    fn track(&mut self, package_code: &str) {
        let code = package_code.trim();
        if code.is_empty() {
            warn!("ignoring request to track an empty package code");
            return;
        }
        if let Some(previous) = self.reconciler.package_code().map(str::to_owned)
            && previous != code
        {
            self.registry.unsubscribe(&self.conn, &previous);
        }
        self.loads.abort_all();
        self.reconciler.begin_load(code);
        self.registry.subscribe(&self.conn, code);
        info!(package_code = code, "tracking package");
        self.spawn_load(code.to_owned());
        self.conn.connect();
    }

    fn close_view(&mut self) {
        self.loads.abort_all();
        self.reconciler.reset();
        self.registry.clear();
        self.conn.disconnect();
        info!("tracking view closed");
    }

    fn on_conn_event(&mut self, event: ConnEvent) {
        let now = Instant::now();
        match self.conn.handle_event(event, now) {
            Some(ConnectionSignal::Ready { resumed }) => {
                self.registry.replay(&self.conn);
                if resumed && self.reconciler.phase() == LoadPhase::Loaded {
                    // Events pushed while the link was down are lost.
                    let delay = self.reconciler.settle_delay();
                    self.reconciler.schedule_refetch(delay, now);
                }
            }
            Some(ConnectionSignal::Event(event)) => {
                let outcome = self.reconciler.apply(&event, now);
                trace!(?outcome, "event reconciled");
            }
            Some(ConnectionSignal::Lost) => debug!("tracking link lost"),
            None => {}
        }
    }

    fn on_load(&mut self, joined: Result<LoadOutcome, JoinError>) {
        match joined {
            Ok(LoadOutcome {
                package_code,
                seq,
                result: Ok(view),
            }) => {
                if self.reconciler.finish_load(&package_code, seq, view) {
                    debug!(package_code, "tracking view loaded");
                }
            }
            Ok(LoadOutcome {
                package_code,
                seq,
                result: Err(e),
            }) => self.reconciler.fail_load(&package_code, seq, e.to_string()),
            Err(e) if e.is_cancelled() => trace!("superseded load aborted"),
            Err(e) => error!(error = %e, "load task failed"),
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        self.conn.on_timer(now);
        if let Some(code) = self.reconciler.take_due_refetch(now) {
            debug!(package_code = %code, "re-fetching authoritative view");
            self.spawn_load(code);
        }
    }

    fn spawn_load(&mut self, package_code: String) {
        let api = Arc::clone(&self.api);
        let seq = self.reconciler.issue_load();
        trace!(package_code, seq, "starting load");
        self.loads.spawn(async move {
            let result = load_tracking_view(api.as_ref(), &package_code).await;
            LoadOutcome {
                package_code,
                seq,
                result,
            }
        });
    }

    fn publish(&self) {
        let snapshot = self.reconciler.snapshot();
        self.view_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::connection::ConnectionState;
    use crate::rest::{AddressRecord, PackageRecord};
    use pt_protocol::{ImagePayload, TrackPayload};
    use std::time::Duration;

    struct FakeApi;

    impl TrackingApi for FakeApi {
        async fn fetch_package(&self, code: &str) -> Result<PackageRecord, ApiError> {
            if code == "MISSING" {
                return Err(ApiError::Status {
                    url: format!("/packages/{code}"),
                    status: 404,
                });
            }
            Ok(PackageRecord {
                package_code: Some(code.to_owned()),
                status: Some("In Transit".to_owned()),
                ..PackageRecord::default()
            })
        }
        async fn fetch_tracks(&self, code: &str) -> Result<Vec<TrackPayload>, ApiError> {
            Ok(vec![TrackPayload {
                track_id: Some(format!("{code}-1")),
                action: Some("CREATE".to_owned()),
                timestamp: Some("2024-01-01T08:00:00Z".to_owned()),
                ..TrackPayload::default()
            }])
        }
        async fn fetch_address(&self, _id: &str) -> Result<AddressRecord, ApiError> {
            Ok(AddressRecord::default())
        }
        async fn fetch_images(&self, _code: &str) -> Result<Vec<ImagePayload>, ApiError> {
            Ok(Vec::new())
        }
    }

    fn config() -> TrackerConfig {
        // Port 9 (discard) refuses connections; the session keeps retrying
        // in the background while the REST side is exercised.
        load_config_from_str(
            r#"
schema_version = 1
[tracking]
ws_url = "ws://127.0.0.1:9/ws"
[api]
base_url = "http://127.0.0.1:9/api"
[reconnect]
base_delay_ms = 60000
"#,
        )
        .unwrap()
    }

    async fn wait_for_phase(handle: &TrackerHandle, phase: LoadPhase) -> ViewState {
        let mut rx = handle.tracking();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("timed out waiting for view phase")
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn track_loads_the_view() {
        let (handle, task) = spawn(&config(), FakeApi);
        assert!(handle.track("PKG1"));

        let state = wait_for_phase(&handle, LoadPhase::Loaded).await;
        assert_eq!(state.package_code.as_deref(), Some("PKG1"));
        let view = state.view.unwrap();
        assert_eq!(view.tracking_code, "PKG1");
        assert_eq!(view.steps().len(), 1);
        assert!(state.updated_at.is_some());

        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn switching_package_replaces_focus() {
        let (handle, _task) = spawn(&config(), FakeApi);
        handle.track("PKG1");
        wait_for_phase(&handle, LoadPhase::Loaded).await;

        handle.track("PKG2");
        let mut rx = handle.tracking();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| {
                s.phase == LoadPhase::Loaded && s.package_code.as_deref() == Some("PKG2")
            }),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(state.view.unwrap().tracking_code, "PKG2");
    }

    #[tokio::test]
    async fn failed_initial_load_returns_to_idle_with_error() {
        let (handle, _task) = spawn(&config(), FakeApi);
        handle.track("MISSING");
        let mut rx = handle.tracking();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.last_load_error.is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(state.phase, LoadPhase::Idle);
        assert!(state.view.is_none());
        assert!(state.last_load_error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn close_resets_view_and_disconnects() {
        let (handle, _task) = spawn(&config(), FakeApi);
        handle.track("PKG1");
        wait_for_phase(&handle, LoadPhase::Loaded).await;

        assert!(handle.close());
        let state = wait_for_phase(&handle, LoadPhase::Idle).await;
        assert!(state.package_code.is_none());
        assert!(state.view.is_none());

        let mut status = handle.connection();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert_eq!(handle.current(), state);
    }

    #[tokio::test]
    async fn blank_code_is_ignored() {
        let (handle, _task) = spawn(&config(), FakeApi);
        handle.track("   ");
        handle.track("PKG1");
        let state = wait_for_phase(&handle, LoadPhase::Loaded).await;
        assert_eq!(state.package_code.as_deref(), Some("PKG1"));
    }

    #[test]
    fn earliest_picks_the_sooner_deadline() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(Some(later), Some(now)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(None, None), None);
    }
}
