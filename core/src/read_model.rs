//! Entities written by the projection.
//!
//! These mirror the relational read model. They are not authoritative: the
//! source of truth for orders and drivers lives upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Completeness of a block's order set.
///
/// A (re)projected block always starts [`Incomplete`](Self::Incomplete);
/// completing it is some other process's business.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletenessState {
    /// `INC`
    #[default]
    Incomplete,
    /// `COM`
    Complete,
}

impl CompletenessState {
    /// Persisted short code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Incomplete => "INC",
            Self::Complete => "COM",
        }
    }

    /// Parse a persisted short code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "INC" => Some(Self::Incomplete),
            "COM" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for CompletenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Warehouse preparation state of an order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreparationState {
    /// `PEN`
    #[default]
    Pending,
    /// `COM`
    Complete,
}

impl PreparationState {
    /// Persisted short code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Pending => "PEN",
            Self::Complete => "COM",
        }
    }
}

/// A driver, upserted whenever an event references it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    /// Upstream driver id.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// The attributes of a block the projection owns.
///
/// Order count and completeness are maintained through dedicated repository
/// operations, not through the header upsert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block id.
    pub id: String,
    /// Dispatch date.
    pub date: DateTime<Utc>,
    /// Assigned driver.
    pub driver_id: String,
    /// Driver name, denormalized for listing.
    pub driver_name: String,
}

/// An order as carried by the legacy contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Order id.
    pub id: String,
    /// Merchant the order belongs to.
    pub pyme_id: String,
    /// Origin distribution center.
    pub origin_center_id: String,
    /// Destination distribution center.
    pub destination_center_id: String,
    /// Dispatch date (the block date).
    pub dispatch_date: DateTime<Utc>,
    /// Preparation state.
    pub preparation: PreparationState,
    /// Sum of line weights.
    pub total_weight: f64,
    /// Sum of line volumes.
    pub total_volume: f64,
    /// Driver the order is assigned to.
    pub driver_id: Option<String>,
}

/// One product line of an order. Unique per (order, sku).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Stock keeping unit.
    pub sku: String,
    /// Units.
    pub qty: u32,
    /// Line weight.
    pub weight: f64,
    /// Line volume.
    pub volume: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness_codes_round_trip() {
        for state in [CompletenessState::Incomplete, CompletenessState::Complete] {
            assert_eq!(CompletenessState::from_code(state.code()), Some(state));
        }
        assert_eq!(CompletenessState::from_code("???"), None);
    }

    #[test]
    fn defaults_match_persisted_defaults() {
        assert_eq!(CompletenessState::default().code(), "INC");
        assert_eq!(PreparationState::default().code(), "PEN");
    }
}
