//! Track action catalog: display text, icon and coarse package status for
//! each track action code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse package status shown next to the tracking code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageStatus {
    Created,
    #[serde(rename = "In Transit")]
    InTransit,
    Delivered,
    Cancelled,
}

impl PackageStatus {
    /// Parse the REST representation.  Accepts both display strings
    /// ("In Transit") and upper snake case codes ("IN_TRANSIT").
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "created" => Some(Self::Created),
            "intransit" => Some(Self::InTransit),
            "delivered" => Some(Self::Delivered),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// No further track events are expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "Created",
            Self::InTransit => "In Transit",
            Self::Delivered => "Delivered",
            Self::Cancelled => "Cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub title: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    /// `None` leaves the package status unchanged.
    pub status: Option<PackageStatus>,
}

const UNKNOWN: CatalogEntry = CatalogEntry {
    title: "Status Update",
    description: "The package status was updated",
    icon: "info",
    status: None,
};

/// Look up a track action code.  Unknown codes get a generic entry.
pub fn lookup(action: &str) -> CatalogEntry {
    match action.trim().to_ascii_uppercase().as_str() {
        "CREATE" => CatalogEntry {
            title: "Package Created",
            description: "Shipping label created and package registered",
            icon: "package",
            status: Some(PackageStatus::Created),
        },
        "SEND_DEPOT" => CatalogEntry {
            title: "In Transit to Depot",
            description: "Package dispatched to the next depot",
            icon: "truck",
            status: Some(PackageStatus::InTransit),
        },
        "ARRIVED_DEPOT" => CatalogEntry {
            title: "Arrived at Depot",
            description: "Package arrived at the depot",
            icon: "warehouse",
            status: Some(PackageStatus::InTransit),
        },
        "SEND_FINAL" => CatalogEntry {
            title: "Out for Delivery",
            description: "Package is on its way to the final destination",
            icon: "truck-fast",
            status: Some(PackageStatus::InTransit),
        },
        "ARRIVED_FINAL" => CatalogEntry {
            title: "Package Delivered",
            description: "Package delivered to the recipient",
            icon: "check-circle",
            status: Some(PackageStatus::Delivered),
        },
        "CANCELLED" => CatalogEntry {
            title: "Shipment Cancelled",
            description: "The shipment was cancelled",
            icon: "x-circle",
            status: Some(PackageStatus::Cancelled),
        },
        _ => UNKNOWN,
    }
}
