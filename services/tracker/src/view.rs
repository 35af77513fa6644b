//! The reconciled, UI-facing projection of one package.
//!
//! Steps are stored oldest-first (the order the history endpoint returns
//! them and the order live events append in) and exposed newest-first, both
//! through [`TrackingView::steps`] and when serialized.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use pt_protocol::{ImagePayload, TrackPayload};
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::catalog::{self, PackageStatus};

/// Estimated delivery is this many days after the latest track event.
const DELIVERY_ESTIMATE_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Current,
    Pending,
}

/// One event in the package's journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub id: String,
    /// Track action code this step was derived from.
    pub action: String,
    pub title: String,
    pub description: String,
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    /// `HH:MM`, UTC.
    pub time: String,
    pub location: Option<String>,
    pub status: StepStatus,
    pub icon: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error("track event has no action")]
    MissingAction,
    #[error("track event has no timestamp")]
    MissingTimestamp,
    #[error("unparseable track timestamp '{0}'")]
    BadTimestamp(String),
}

impl Step {
    /// Derive a step from a track record.  The returned step is `Pending`;
    /// the view decides where the progress cursor sits.
    pub fn from_track(track: &TrackPayload) -> Result<Self, TrackError> {
        let action = track
            .action
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(TrackError::MissingAction)?;
        let raw_ts = track
            .timestamp
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(TrackError::MissingTimestamp)?;
        let occurred_at = parse_timestamp(raw_ts)?;

        let entry = catalog::lookup(action);
        let description = track
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(entry.description)
            .to_owned();
        let location = match (&track.depot_name, &track.depot_id) {
            (Some(name), _) if !name.trim().is_empty() => Some(name.trim().to_owned()),
            (_, Some(id)) => Some(format!("Depot {id}")),
            _ => None,
        };

        Ok(Self {
            id: track
                .track_id
                .clone()
                .unwrap_or_else(|| format!("{action}-{raw_ts}")),
            action: action.to_owned(),
            title: entry.title.to_owned(),
            description,
            date: occurred_at.format("%Y-%m-%d").to_string(),
            time: occurred_at.format("%H:%M").to_string(),
            location,
            status: StepStatus::Pending,
            icon: entry.icon.to_owned(),
            occurred_at,
        })
    }

    /// Same id, or same title at the same displayed date and time.
    pub fn is_duplicate_of(&self, other: &Step) -> bool {
        self.id == other.id
            || (self.title == other.title && self.date == other.date && self.time == other.time)
    }

    fn cursor_status(&self) -> StepStatus {
        match catalog::lookup(&self.action).status {
            Some(status) if status.is_terminal() => StepStatus::Completed,
            _ => StepStatus::Current,
        }
    }
}

/// Accepts RFC 3339 and zone-less ISO timestamps (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TrackError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| TrackError::BadTimestamp(raw.to_owned()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Image {
    pub image_id: Option<String>,
    pub purpose: Option<String>,
    pub url: Option<String>,
    pub download_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub timestamp: Option<String>,
}

impl From<ImagePayload> for Image {
    fn from(p: ImagePayload) -> Self {
        Self {
            image_id: p.image_id,
            purpose: p.purpose,
            url: p.url.or(p.image_url),
            download_url: p.download_url,
            thumbnail_url: p.thumbnail_url,
            timestamp: p.timestamp,
        }
    }
}

impl Image {
    /// Dedup by `image_id` when the candidate has one, else by
    /// `(purpose, timestamp)`.
    pub fn is_duplicate_of(&self, existing: &Image) -> bool {
        match &self.image_id {
            Some(id) => existing.image_id.as_ref() == Some(id),
            None => self.purpose == existing.purpose && self.timestamp == existing.timestamp,
        }
    }
}

/// Everything the REST collaborators return for one package.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub tracking_code: String,
    pub status: Option<PackageStatus>,
    pub estimated_delivery: Option<NaiveDate>,
    pub recipient: Option<String>,
    /// Oldest first.
    pub tracks: Vec<TrackPayload>,
    pub images: Vec<ImagePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackApplied {
    Appended,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingView {
    pub tracking_code: String,
    pub status: PackageStatus,
    pub current_location: Option<String>,
    pub estimated_delivery: Option<NaiveDate>,
    pub recipient: Option<String>,
    #[serde(serialize_with = "newest_first")]
    steps: Vec<Step>,
    pub images: Vec<Image>,
}

impl TrackingView {
    /// Build a full view from authoritative REST data.
    ///
    /// Invalid history entries are logged and skipped; duplicates collapse.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut steps: Vec<Step> = Vec::with_capacity(snapshot.tracks.len());
        for track in &snapshot.tracks {
            match Step::from_track(track) {
                Ok(step) if !steps.iter().any(|s| s.is_duplicate_of(&step)) => steps.push(step),
                Ok(_) => {}
                Err(e) => {
                    warn!(package_code = %snapshot.tracking_code, error = %e, "skipping history entry");
                }
            }
        }
        steps.sort_by_key(|s| s.occurred_at);
        for step in &mut steps {
            step.status = StepStatus::Completed;
        }
        if let Some(latest) = steps.last_mut() {
            latest.status = latest.cursor_status();
        }

        let derived_status = steps
            .iter()
            .rev()
            .find_map(|s| catalog::lookup(&s.action).status);
        let estimated_delivery = snapshot
            .estimated_delivery
            .or_else(|| steps.last().map(|s| estimate_delivery(s.occurred_at)));
        let current_location = steps.iter().rev().find_map(|s| s.location.clone());

        let mut images: Vec<Image> = Vec::with_capacity(snapshot.images.len());
        for payload in snapshot.images {
            let image = Image::from(payload);
            if !images.iter().any(|i| image.is_duplicate_of(i)) {
                images.push(image);
            }
        }

        Self {
            tracking_code: snapshot.tracking_code,
            status: snapshot
                .status
                .or(derived_status)
                .unwrap_or(PackageStatus::Created),
            current_location,
            estimated_delivery,
            recipient: snapshot.recipient,
            steps,
            images,
        }
    }

    /// Steps, newest first.
    pub fn steps(&self) -> impl DoubleEndedIterator<Item = &Step> + ExactSizeIterator {
        self.steps.iter().rev()
    }

    pub fn latest_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Apply one live track event.
    ///
    /// The previous `current` step becomes `completed`, the new step becomes
    /// the latest, and status plus estimated delivery follow the new action.
    pub fn apply_track(&mut self, track: &TrackPayload) -> Result<TrackApplied, TrackError> {
        let mut step = Step::from_track(track)?;
        if self.steps.iter().any(|s| s.is_duplicate_of(&step)) {
            return Ok(TrackApplied::Duplicate);
        }

        for existing in self.steps.iter_mut().filter(|s| s.status == StepStatus::Current) {
            existing.status = StepStatus::Completed;
        }
        step.status = step.cursor_status();

        if let Some(status) = catalog::lookup(&step.action).status {
            self.status = status;
        }
        self.estimated_delivery = Some(estimate_delivery(step.occurred_at));
        if let Some(location) = &step.location {
            self.current_location = Some(location.clone());
        }
        self.steps.push(step);
        Ok(TrackApplied::Appended)
    }

    /// Append an image unless it is a duplicate.  Returns whether it was added.
    pub fn add_image(&mut self, image: Image) -> bool {
        if self.images.iter().any(|existing| image.is_duplicate_of(existing)) {
            return false;
        }
        self.images.push(image);
        true
    }
}

fn estimate_delivery(from: DateTime<Utc>) -> NaiveDate {
    (from + Duration::days(DELIVERY_ESTIMATE_DAYS)).date_naive()
}

fn newest_first<S: Serializer>(steps: &[Step], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(steps.iter().rev())
}
