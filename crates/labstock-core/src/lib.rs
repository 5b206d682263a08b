//! Core domain model for the lab inventory tracker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "labstock-core";

/// Lifecycle stage of a purchase request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Requested,
    Ordered,
    Received,
}

impl Status {
    pub const ALL: [Status; 3] = [Status::Requested, Status::Ordered, Status::Received];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Requested => "Requested",
            Status::Ordered => "Ordered",
            Status::Received => "Received",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status {0:?}")]
pub struct StatusParseError(pub String);

impl FromStr for Status {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requested" => Ok(Status::Requested),
            "ordered" => Ok(Status::Ordered),
            "received" => Ok(Status::Received),
            _ => Err(StatusParseError(s.to_string())),
        }
    }
}

/// Persisted purchase-request row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: i64,
    pub requested_by: String,
    pub catalog_number: String,
    pub vendor: String,
    pub name: String,
    pub url: Option<String>,
    pub quantity: i64,
    pub unit: Option<String>,
    pub notes: Option<String>,
    pub cost: f64,
    pub status: Status,
    pub order_date: Option<String>,
    pub received_date: Option<String>,
}

impl InventoryRecord {
    /// Normalized composite identity of the item this row describes.
    pub fn natural_key(&self) -> (String, String) {
        natural_key(&self.catalog_number, &self.vendor)
    }
}

/// Pre-insert shape of a record; id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub requested_by: String,
    pub catalog_number: String,
    pub vendor: String,
    pub name: String,
    pub url: Option<String>,
    pub quantity: i64,
    pub unit: Option<String>,
    pub notes: Option<String>,
    pub cost: f64,
    pub status: Status,
    pub order_date: Option<String>,
    pub received_date: Option<String>,
}

impl Default for RecordDraft {
    fn default() -> Self {
        Self {
            requested_by: "Unknown".to_string(),
            catalog_number: String::new(),
            vendor: String::new(),
            name: "Unknown Item".to_string(),
            url: None,
            quantity: 1,
            unit: None,
            notes: None,
            cost: 0.0,
            status: Status::Requested,
            order_date: None,
            received_date: None,
        }
    }
}

/// Field payload for update-by-key; dates are overridden to NULL by the store
/// whenever `status` is `Requested`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub requested_by: String,
    pub name: String,
    pub quantity: i64,
    pub notes: Option<String>,
    pub status: Status,
    pub order_date: Option<String>,
    pub received_date: Option<String>,
}

/// Normalizes one half of the composite key: surrounding whitespace stripped,
/// lowercased.
pub fn normalize_key_part(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Normalized `(catalog_number, vendor)` pair used as the natural identity of
/// an item. The persisted schema does not enforce uniqueness on it.
pub fn natural_key(catalog_number: &str, vendor: &str) -> (String, String) {
    (
        normalize_key_part(catalog_number),
        normalize_key_part(vendor),
    )
}
