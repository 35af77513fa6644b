//! Authoritative package data over HTTP.
//!
//! The live channel only patches what these endpoints return.  Every full
//! load and every settle re-fetch goes through [`load_tracking_view`].

use chrono::NaiveDate;
use pt_protocol::{ImagePayload, TrackPayload};
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::catalog::PackageStatus;
use crate::view::{Snapshot, TrackingView, parse_timestamp};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid API base URL '{url}': {reason}")]
    BaseUrl { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// `GET /packages/{code}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageRecord {
    #[serde(default, alias = "tracking_code")]
    pub package_code: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(
        default,
        alias = "destination_address_id",
        deserialize_with = "pt_protocol::opt_id"
    )]
    pub receiver_address_id: Option<String>,
    #[serde(default)]
    pub estimated_delivery: Option<String>,
}

/// `GET /addresses/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AddressRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl AddressRecord {
    /// One-line recipient summary, e.g. `Ada, 1 Main St, 10115 Berlin, DE`.
    /// `None` when every field is blank.
    pub fn format(&self) -> Option<String> {
        let locality = [self.postal_code.as_deref(), self.city.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let parts: Vec<&str> = [
            self.name.as_deref(),
            self.street.as_deref(),
            Some(locality.as_str()),
            self.country.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

/// The REST surface the tracking session needs.
pub trait TrackingApi: Send + Sync + 'static {
    fn fetch_package(
        &self,
        package_code: &str,
    ) -> impl Future<Output = Result<PackageRecord, ApiError>> + Send;

    fn fetch_tracks(
        &self,
        package_code: &str,
    ) -> impl Future<Output = Result<Vec<TrackPayload>, ApiError>> + Send;

    fn fetch_address(
        &self,
        address_id: &str,
    ) -> impl Future<Output = Result<AddressRecord, ApiError>> + Send;

    fn fetch_images(
        &self,
        package_code: &str,
    ) -> impl Future<Output = Result<Vec<ImagePayload>, ApiError>> + Send;
}

/// [`TrackingApi`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTrackingApi {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpTrackingApi {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let parsed = Url::parse(base_url).map_err(|e| ApiError::BaseUrl {
            url: base_url.to_owned(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ApiError::BaseUrl {
                url: base_url.to_owned(),
                reason: "URL cannot carry a path".to_owned(),
            });
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            client,
            base_url: parsed,
            token,
        })
    }

    /// Append percent-encoded path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        let url = self.endpoint(segments);
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| ApiError::Http {
            url: url.to_string(),
            source,
        })?;
        if !response.status().is_success() {
            return Err(ApiError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.json::<T>().await.map_err(|source| ApiError::Http {
            url: url.to_string(),
            source,
        })
    }
}

impl TrackingApi for HttpTrackingApi {
    async fn fetch_package(&self, package_code: &str) -> Result<PackageRecord, ApiError> {
        self.get_json(&["packages", package_code]).await
    }

    async fn fetch_tracks(&self, package_code: &str) -> Result<Vec<TrackPayload>, ApiError> {
        self.get_json(&["packages", package_code, "tracks"]).await
    }

    async fn fetch_address(&self, address_id: &str) -> Result<AddressRecord, ApiError> {
        self.get_json(&["addresses", address_id]).await
    }

    async fn fetch_images(&self, package_code: &str) -> Result<Vec<ImagePayload>, ApiError> {
        self.get_json(&["packages", package_code, "images"]).await
    }
}

/// Fetch everything shown for `package_code` and build a full view.
///
/// The package record and its history are required.  Images and the
/// recipient address are decoration: failures there are logged and the view
/// is built without them.
pub async fn load_tracking_view<A: TrackingApi>(
    api: &A,
    package_code: &str,
) -> Result<TrackingView, ApiError> {
    let (package, tracks, images) = tokio::join!(
        api.fetch_package(package_code),
        api.fetch_tracks(package_code),
        api.fetch_images(package_code),
    );
    let package = package?;
    let tracks = tracks?;
    let images = images.unwrap_or_else(|e| {
        warn!(package_code, error = %e, "image fetch failed, continuing without images");
        Vec::new()
    });

    let recipient = match package.receiver_address_id.as_deref() {
        Some(address_id) => match api.fetch_address(address_id).await {
            Ok(address) => address.format(),
            Err(e) => {
                warn!(package_code, address_id, error = %e, "address fetch failed");
                None
            }
        },
        None => None,
    };

    let status = package.status.as_deref().and_then(|s| {
        let parsed = PackageStatus::parse(s);
        if parsed.is_none() {
            debug!(package_code, status = s, "unrecognised package status");
        }
        parsed
    });

    debug!(
        package_code,
        tracks = tracks.len(),
        images = images.len(),
        "package data fetched"
    );

    Ok(TrackingView::from_snapshot(Snapshot {
        tracking_code: package_code.to_owned(),
        status,
        estimated_delivery: package.estimated_delivery.as_deref().and_then(parse_date),
        recipient,
        tracks,
        images,
    }))
}

/// Accepts a bare `YYYY-MM-DD` or a full timestamp.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).ok().map(|ts| ts.date_naive()))
}
