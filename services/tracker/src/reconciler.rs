//! Optimistic application of live events, corrected by delayed re-fetches.
//!
//! Per viewed package: `idle -> loading -> loaded`, with live events patching
//! the loaded view in place.  Events arriving before the first full load are
//! dropped; that load supersedes them.  Every applied event schedules an
//! authoritative re-fetch after the settle delay, so the push channel only
//! ever buys latency, never correctness.

use chrono::{DateTime, Utc};
use pt_protocol::DomainEvent;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::view::{Image, TrackApplied, TrackingView};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    Loaded,
}

/// What observers see on the view channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewState {
    pub package_code: Option<String>,
    pub phase: LoadPhase,
    pub view: Option<TrackingView>,
    pub last_load_error: Option<String>,
    /// Wall-clock time the view last changed.
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The view changed; a settle re-fetch is scheduled.
    Applied,
    /// A full re-fetch was scheduled instead of patching.
    RefetchScheduled,
    Duplicate,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NotLoaded,
    OtherPackage,
    Invalid(String),
}

#[derive(Debug)]
pub struct EventReconciler {
    config: ReconcileConfig,
    package_code: Option<String>,
    phase: LoadPhase,
    view: Option<TrackingView>,
    last_load_error: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    refetch_at: Option<Instant>,
    /// Id of the most recently started load.
    issued_seq: u64,
    /// Id of the newest load whose result has been taken.
    settled_seq: u64,
}

impl EventReconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            config,
            package_code: None,
            phase: LoadPhase::Idle,
            view: None,
            last_load_error: None,
            updated_at: None,
            refetch_at: None,
            issued_seq: 0,
            settled_seq: 0,
        }
    }

    pub fn package_code(&self) -> Option<&str> {
        self.package_code.as_deref()
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    pub fn view(&self) -> Option<&TrackingView> {
        self.view.as_ref()
    }

    pub fn snapshot(&self) -> ViewState {
        ViewState {
            package_code: self.package_code.clone(),
            phase: self.phase,
            view: self.view.clone(),
            last_load_error: self.last_load_error.clone(),
            updated_at: self.updated_at,
        }
    }

    /// Focus on `package_code` and start its initial load.  Any pending
    /// re-fetch for the previous package is cancelled.
    pub fn begin_load(&mut self, package_code: &str) {
        self.package_code = Some(package_code.to_owned());
        self.phase = LoadPhase::Loading;
        self.view = None;
        self.last_load_error = None;
        self.updated_at = None;
        self.refetch_at = None;
    }

    /// Number the next load.  Loads may finish out of order; only results
    /// newer than the last one taken are applied.
    pub fn issue_load(&mut self) -> u64 {
        self.issued_seq += 1;
        self.issued_seq
    }

    /// Whether the result of load `seq` for `package_code` may still be used.
    /// Marks it as taken when it may.
    fn accept_result(&mut self, package_code: &str, seq: u64) -> bool {
        if self.package_code.as_deref() != Some(package_code) {
            debug!(package_code, seq, "discarding load for unfocused package");
            return false;
        }
        if seq <= self.settled_seq {
            debug!(package_code, seq, settled = self.settled_seq, "discarding superseded load");
            return false;
        }
        self.settled_seq = seq;
        true
    }

    /// Install a full view.  Results for a package that is no longer in
    /// focus, or older than a result already taken, are discarded; returns
    /// whether the view was taken.
    pub fn finish_load(&mut self, package_code: &str, seq: u64, view: TrackingView) -> bool {
        if !self.accept_result(package_code, seq) {
            return false;
        }
        self.view = Some(view);
        self.phase = LoadPhase::Loaded;
        self.last_load_error = None;
        self.updated_at = Some(Utc::now());
        true
    }

    /// Record a failed load.  A failed initial load returns to `idle`; a
    /// failed re-fetch keeps the current view.
    pub fn fail_load(&mut self, package_code: &str, seq: u64, error: String) {
        if !self.accept_result(package_code, seq) {
            return;
        }
        if self.phase == LoadPhase::Loaded {
            warn!(package_code, error = %error, "re-fetch failed, keeping current view");
        } else {
            warn!(package_code, error = %error, "initial load failed");
            self.phase = LoadPhase::Idle;
        }
        self.last_load_error = Some(error);
    }

    /// Drop focus, view and timers.
    pub fn reset(&mut self) {
        self.package_code = None;
        self.phase = LoadPhase::Idle;
        self.view = None;
        self.last_load_error = None;
        self.updated_at = None;
        self.refetch_at = None;
    }

    /// Apply one live event to the loaded view.
    pub fn apply(&mut self, event: &DomainEvent, now: Instant) -> ApplyOutcome {
        let (Some(focus), Some(view)) = (self.package_code.as_deref(), self.view.as_mut()) else {
            debug!("no loaded view, dropping event");
            return ApplyOutcome::Ignored(IgnoreReason::NotLoaded);
        };
        match event.package_code() {
            Some(code) if code != focus => {
                debug!(package_code = code, focus, "event for another package");
                return ApplyOutcome::Ignored(IgnoreReason::OtherPackage);
            }
            _ => {}
        }

        let outcome = match event {
            DomainEvent::PackageCreated(_) => {
                let delay = self.config.created_refetch_delay;
                self.schedule_refetch(delay, now);
                return ApplyOutcome::RefetchScheduled;
            }
            DomainEvent::ImageUploaded(uploaded) => {
                if view.add_image(Image::from(uploaded.image.clone())) {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Duplicate
                }
            }
            DomainEvent::TrackUpdated(update) => match view.apply_track(&update.track) {
                Ok(TrackApplied::Appended) => ApplyOutcome::Applied,
                Ok(TrackApplied::Duplicate) => ApplyOutcome::Duplicate,
                Err(e) => {
                    warn!(package_code = focus, error = %e, "dropping invalid track event");
                    return ApplyOutcome::Ignored(IgnoreReason::Invalid(e.to_string()));
                }
            },
        };

        if outcome == ApplyOutcome::Applied {
            self.updated_at = Some(Utc::now());
            info!(package_code = focus, "live event applied");
            let delay = self.config.settle_delay;
            self.schedule_refetch(delay, now);
        }
        outcome
    }

    /// (Re)arm the re-fetch timer at `now + delay`.
    pub fn schedule_refetch(&mut self, delay: Duration, now: Instant) {
        if self.package_code.is_none() {
            return;
        }
        self.refetch_at = Some(now + delay);
    }

    pub fn cancel_refetch(&mut self) {
        self.refetch_at = None;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.refetch_at
    }

    /// The package code to re-fetch if the timer has fired.
    pub fn take_due_refetch(&mut self, now: Instant) -> Option<String> {
        match self.refetch_at {
            Some(at) if at <= now => {
                self.refetch_at = None;
                self.package_code.clone()
            }
            _ => None,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        self.config.settle_delay
    }
}
