//! CloudEvents-style envelope and contract versions.

use crate::error::ContractError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Type string of the legacy contract (full order data inside the event).
pub const BLOCK_READY_V1: &str = "logistrack.distribucion.BloqueConsolidadoListo.v1";

/// Type string of the current contract (orders referenced by id).
pub const BLOCK_READY_V2: &str = "logistrack.distribucion.BloqueConsolidadoListo.v2";

/// A version of the `BloqueConsolidadoListo` contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContractVersion {
    /// Legacy: the event carries full order and line data.
    V1,
    /// Current: the event references pre-existing orders.
    V2,
}

impl ContractVersion {
    /// The version new deployments accept.
    pub const CURRENT: Self = Self::V2;

    /// The version-stamped type string.
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::V1 => BLOCK_READY_V1,
            Self::V2 => BLOCK_READY_V2,
        }
    }

    /// Map a type string to its version, if it is one we know.
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            BLOCK_READY_V1 => Some(Self::V1),
            BLOCK_READY_V2 => Some(Self::V2),
            _ => None,
        }
    }
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// Which contract versions a deployment projects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcceptedVersions {
    /// Only [`ContractVersion::CURRENT`].
    #[default]
    Current,
    /// Current and legacy.
    All,
}

impl AcceptedVersions {
    /// Whether `version` is projected.
    #[must_use]
    pub const fn accepts(self, version: ContractVersion) -> bool {
        match self {
            Self::Current => matches!(version, ContractVersion::V2),
            Self::All => true,
        }
    }

    /// Resolve the declared type of an envelope to an accepted version.
    ///
    /// # Errors
    ///
    /// [`ContractError::UnsupportedType`] when the type is missing, unknown,
    /// or a known version this deployment does not accept.
    pub fn resolve(self, event_type: Option<&str>) -> Result<ContractVersion, ContractError> {
        event_type
            .and_then(ContractVersion::from_event_type)
            .filter(|version| self.accepts(*version))
            .ok_or_else(|| ContractError::UnsupportedType(event_type.map(str::to_owned)))
    }
}

/// Error returned when parsing [`AcceptedVersions`] from configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown accepted-versions value {0:?} (expected `current` or `all`)")]
pub struct ParseAcceptedVersionsError(String);

impl FromStr for AcceptedVersions {
    type Err = ParseAcceptedVersionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "current" | "v2" => Ok(Self::Current),
            "all" | "v1,v2" => Ok(Self::All),
            other => Err(ParseAcceptedVersionsError(other.to_owned())),
        }
    }
}

impl fmt::Display for AcceptedVersions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::All => f.write_str("all"),
        }
    }
}

/// Inbound event envelope.
///
/// Only `id`, `type`, `dataschema` and `data` drive the projection; the
/// remaining CloudEvents attributes are carried along for logging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// CloudEvents spec version (`"1.0"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specversion: Option<String>,
    /// Event id; the idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Version-stamped type string.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Producer identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Production timestamp as sent by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Subject (usually the block id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Content type of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// URI of the schema `data` conforms to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    /// W3C trace context propagated by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    /// Payload.
    #[serde(default)]
    pub data: Value,
}

impl CloudEvent {
    /// Build an envelope from an already-decoded JSON document.
    ///
    /// # Errors
    ///
    /// [`ContractError::InvalidPayload`] when an attribute has the wrong JSON type.
    pub fn from_value(value: Value) -> Result<Self, ContractError> {
        serde_json::from_value(value)
            .map_err(|e| ContractError::InvalidPayload(format!("envelope: {e}")))
    }

    /// The event id, treating an empty string as absent.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}
