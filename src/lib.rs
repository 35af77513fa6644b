//! parcel-tracker: real-time parcel tracking core.
//!
//! Umbrella crate over the workspace: the wire protocol and the tracker
//! client under one name.

pub use pt_protocol as protocol;
pub use tracker::{TrackerHandle, catalog, config, connection, reconciler, registry, rest, spawn, view};
