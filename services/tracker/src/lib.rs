// tracker: Real-time parcel tracking client.
// Exposes modules for integration testing.

pub mod catalog;
pub mod config;
pub mod connection;
pub mod identity;
pub mod reconciler;
pub mod registry;
pub mod rest;
pub mod session;
pub mod view;

pub use session::{TrackerHandle, spawn};
