//! Typed views of the `data` member, one per contract version.
//!
//! Field names follow the wire contract (`bloque`, `fecha`, `chofer`, ...).
//! Ids are accepted as JSON strings or integers and normalized to strings.

use crate::error::ContractError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

/// Driver as referenced by both contract versions.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DriverPayload {
    /// Driver id.
    #[serde(deserialize_with = "required_id")]
    pub id: String,
    /// Driver name.
    #[serde(default)]
    pub nombre: String,
}

/// `data.bloque` of the current contract.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BlockDescriptor {
    /// Block id.
    #[serde(deserialize_with = "required_id")]
    pub id: String,
    /// Dispatch date, RFC 3339 or naive.
    pub fecha: String,
    /// Assigned driver.
    pub chofer: DriverPayload,
}

/// An entry of `data.ordenes` in the current contract.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OrderReference {
    /// Referenced order; entries without one are ignored.
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
}

/// Payload of `BloqueConsolidadoListo.v2`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BlockReadyV2 {
    /// The block.
    pub bloque: BlockDescriptor,
    /// Orders the block groups, referenced by id.
    #[serde(default)]
    pub ordenes: Vec<OrderReference>,
}

impl BlockReadyV2 {
    /// Map `data` onto the current contract.
    ///
    /// # Errors
    ///
    /// [`ContractError::InvalidPayload`] when a required member is missing or mistyped.
    pub fn from_data(data: &Value) -> Result<Self, ContractError> {
        Self::deserialize(data).map_err(|e| ContractError::InvalidPayload(format!("data: {e}")))
    }

    /// Referenced order ids, without duplicates, in first-seen order.
    #[must_use]
    pub fn order_ids(&self) -> Vec<String> {
        dedup_preserving_order(self.ordenes.iter().filter_map(|o| o.id.as_deref()))
    }
}

/// A product line of the legacy contract.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LegacyLine {
    /// Stock keeping unit.
    pub sku: String,
    /// Units.
    pub qty: u32,
    /// Weight.
    #[serde(default)]
    pub peso: f64,
    /// Volume.
    #[serde(default)]
    pub volumen: f64,
}

/// A full order of the legacy contract.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LegacyOrder {
    /// Order id.
    #[serde(deserialize_with = "required_id")]
    pub id: String,
    /// Merchant id.
    #[serde(deserialize_with = "required_id")]
    pub pyme_id: String,
    /// Origin distribution center id.
    #[serde(deserialize_with = "required_id")]
    pub origen_cd_id: String,
    /// Destination distribution center id.
    #[serde(deserialize_with = "required_id")]
    pub destino_cd_id: String,
    /// Product lines.
    #[serde(default)]
    pub productos: Vec<LegacyLine>,
}

/// Payload of `BloqueConsolidadoListo.v1`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct BlockReadyV1 {
    /// Block id.
    #[serde(deserialize_with = "required_id")]
    pub bloque_id: String,
    /// Dispatch date, RFC 3339 or naive.
    pub fecha_despacho: String,
    /// Assigned driver.
    pub chofer: DriverPayload,
    /// Orders with their lines.
    #[serde(default)]
    pub ordenes: Vec<LegacyOrder>,
}

impl BlockReadyV1 {
    /// Map `data` onto the legacy contract.
    ///
    /// # Errors
    ///
    /// [`ContractError::InvalidPayload`] when a required member is missing or mistyped.
    pub fn from_data(data: &Value) -> Result<Self, ContractError> {
        Self::deserialize(data).map_err(|e| ContractError::InvalidPayload(format!("data: {e}")))
    }
}

/// Parse a block date.
///
/// Accepts RFC 3339 with offset, naive `YYYY-MM-DDTHH:MM:SS[.f]` (or with a
/// space separator) and bare `YYYY-MM-DD`. Naive values are taken as UTC.
///
/// # Errors
///
/// [`ContractError::InvalidDate`] when no format matches.
pub fn parse_block_date(raw: &str) -> Result<DateTime<Utc>, ContractError> {
    let raw = raw.trim();
    let rfc3339 = match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => return Ok(parsed.with_timezone(&Utc)),
        Err(e) => e,
    };
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }
    Err(ContractError::InvalidDate {
        value: raw.to_owned(),
        reason: rfc3339.to_string(),
    })
}

fn dedup_preserving_order<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id))
        .map(str::to_owned)
        .collect()
}

fn id_from_value<E: de::Error>(value: Value) -> Result<Option<String>, E> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Some(n.to_string())),
        other => Err(E::custom(format!(
            "expected a string or integer id, found {other}"
        ))),
    }
}

fn required_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    id_from_value::<D::Error>(Value::deserialize(deserializer)?)?
        .ok_or_else(|| de::Error::custom("id must not be empty"))
}

fn optional_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    id_from_value(Value::deserialize(deserializer)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn v2_normalizes_ids_and_skips_blank_references() {
        let data = json!({
            "bloque": {"id": 77, "fecha": "2025-08-11", "chofer": {"id": 5, "nombre": "Ana"}},
            "ordenes": [{"id": "o-1"}, {"id": 2}, {}, {"id": null}, {"id": "o-1"}]
        });
        let payload = BlockReadyV2::from_data(&data).unwrap();
        assert_eq!(payload.bloque.id, "77");
        assert_eq!(payload.bloque.chofer.id, "5");
        assert_eq!(payload.order_ids(), vec!["o-1".to_owned(), "2".to_owned()]);
    }

    #[test]
    fn v2_without_block_is_invalid() {
        let err = BlockReadyV2::from_data(&json!({"ordenes": []})).unwrap_err();
        assert!(matches!(err, ContractError::InvalidPayload(_)));
    }

    #[test]
    fn fractional_ids_are_rejected() {
        let data = json!({
            "bloque": {"id": 1.5, "fecha": "2025-08-11", "chofer": {"id": "c", "nombre": "n"}}
        });
        assert!(BlockReadyV2::from_data(&data).is_err());
    }

    #[test]
    fn v1_reads_orders_and_lines() {
        let data = json!({
            "bloque_id": "b-9",
            "fecha_despacho": "2025-08-11T08:00:00",
            "chofer": {"id": "c-1", "nombre": "Luis"},
            "ordenes": [{
                "id": "o-1", "pyme_id": 10, "origen_cd_id": "cd-1", "destino_cd_id": "cd-2",
                "productos": [{"sku": "A", "qty": 2, "peso": 1.5, "volumen": 0.25}]
            }]
        });
        let payload = BlockReadyV1::from_data(&data).unwrap();
        assert_eq!(payload.ordenes[0].pyme_id, "10");
        assert_eq!(payload.ordenes[0].productos[0].qty, 2);
    }

    #[test]
    fn dates_accept_offsets_and_naive_forms() {
        let expected = Utc.with_ymd_and_hms(2025, 8, 11, 10, 0, 0).unwrap();
        assert_eq!(parse_block_date("2025-08-11T10:00:00Z").unwrap(), expected);
        assert_eq!(parse_block_date("2025-08-11T12:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_block_date("2025-08-11T10:00:00").unwrap(), expected);
        assert_eq!(parse_block_date("2025-08-11 10:00:00").unwrap(), expected);
        assert_eq!(
            parse_block_date("2025-08-11").unwrap(),
            Utc.with_ymd_and_hms(2025, 8, 11, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn garbage_dates_are_contract_errors() {
        let err = parse_block_date("next tuesday").unwrap_err();
        assert!(matches!(err, ContractError::InvalidDate { ref value, .. } if value == "next tuesday"));
    }
}
