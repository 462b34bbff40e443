//! Envelope fixtures.
//!
//! The builders produce envelopes that pass the bundled contracts unchanged;
//! tests then break exactly the attribute they are about.

#![allow(clippy::expect_used)] // Fixtures are built from literals

use distribution_projector_core::envelope::{BLOCK_READY_V1, BLOCK_READY_V2};
use distribution_projector_core::CloudEvent;
use serde_json::{json, Map, Value};

/// Namespace all contract URIs live under.
pub const SCHEMA_BASE: &str = "https://contracts.logistrack/schemas/";

/// Envelope schema.
pub const ENVELOPE_SCHEMA_URI: &str =
    "https://contracts.logistrack/schemas/BloqueConsolidadoListo/2.0/cloudevent.json";

/// Data schema of the current contract.
pub const BLOCK_READY_V2_SCHEMA_URI: &str =
    "https://contracts.logistrack/schemas/BloqueConsolidadoListo/1.2/schema.json";

/// Data schema of the legacy contract.
pub const BLOCK_READY_V1_SCHEMA_URI: &str =
    "https://contracts.logistrack/schemas/BloqueConsolidadoListo/1.0/schema.json";

/// Driver every fixture block is assigned to.
pub const FIXTURE_DRIVER_ID: &str = "c-1";

/// Name of [`FIXTURE_DRIVER_ID`].
pub const FIXTURE_DRIVER_NAME: &str = "Ana Pérez";

/// Builder for `BloqueConsolidadoListo` envelopes.
///
/// # Example
///
/// ```
/// use distribution_projector_testing::EnvelopeBuilder;
///
/// let envelope = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"])
///     .without("time")
///     .build();
/// assert_eq!(envelope["data"]["bloque"]["id"], "b-1");
/// assert!(envelope.get("time").is_none());
/// ```
#[derive(Clone, Debug)]
pub struct EnvelopeBuilder {
    envelope: Map<String, Value>,
}

impl EnvelopeBuilder {
    fn envelope(event_id: &str, event_type: &str, dataschema: &str, block_id: &str, data: Value) -> Self {
        let value = json!({
            "specversion": "1.0",
            "id": event_id,
            "type": event_type,
            "source": "ms-consolidacion",
            "time": "2025-08-11T10:00:00Z",
            "subject": block_id,
            "datacontenttype": "application/json",
            "dataschema": dataschema,
            "data": data,
        });
        let Value::Object(envelope) = value else {
            unreachable!("json! object literal")
        };
        Self { envelope }
    }

    /// Current-contract event referencing `order_ids`.
    #[must_use]
    pub fn block_ready_v2(event_id: &str, block_id: &str, order_ids: &[&str]) -> Self {
        let ordenes: Vec<Value> = order_ids
            .iter()
            .map(|id| json!({"id": id, "pyme_id": "pyme-1"}))
            .collect();
        Self::envelope(
            event_id,
            BLOCK_READY_V2,
            BLOCK_READY_V2_SCHEMA_URI,
            block_id,
            json!({
                "bloque": {
                    "id": block_id,
                    "fecha": "2025-08-11T10:00:00Z",
                    "chofer": {"id": FIXTURE_DRIVER_ID, "nombre": FIXTURE_DRIVER_NAME}
                },
                "ordenes": ordenes
            }),
        )
    }

    /// Legacy-contract event carrying full orders.
    ///
    /// Every order has two lines: `SKU-1` (qty 2, 1.5 kg, 0.5 m³) and `SKU-2`
    /// (qty 1, 0.25 kg, 0.125 m³).
    #[must_use]
    pub fn block_ready_v1(event_id: &str, block_id: &str, order_ids: &[&str]) -> Self {
        let ordenes: Vec<Value> = order_ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "pyme_id": "pyme-1",
                    "origen_cd_id": "cd-1",
                    "destino_cd_id": "cd-2",
                    "productos": [
                        {"sku": "SKU-1", "qty": 2, "peso": 1.5, "volumen": 0.5},
                        {"sku": "SKU-2", "qty": 1, "peso": 0.25, "volumen": 0.125}
                    ]
                })
            })
            .collect();
        Self::envelope(
            event_id,
            BLOCK_READY_V1,
            BLOCK_READY_V1_SCHEMA_URI,
            block_id,
            json!({
                "bloque_id": block_id,
                "fecha_despacho": "2025-08-11T10:00:00",
                "chofer": {"id": FIXTURE_DRIVER_ID, "nombre": FIXTURE_DRIVER_NAME},
                "ordenes": ordenes
            }),
        )
    }

    /// Override the `type` attribute.
    #[must_use]
    pub fn event_type(self, event_type: &str) -> Self {
        self.attribute("type", Value::from(event_type))
    }

    /// Set any attribute.
    #[must_use]
    pub fn attribute(mut self, name: &str, value: Value) -> Self {
        self.envelope.insert(name.to_owned(), value);
        self
    }

    /// Remove an attribute.
    #[must_use]
    pub fn without(mut self, name: &str) -> Self {
        self.envelope.remove(name);
        self
    }

    /// Replace `data`.
    #[must_use]
    pub fn data(self, data: Value) -> Self {
        self.attribute("data", data)
    }

    /// Replace a member of `data`.
    #[must_use]
    pub fn data_member(mut self, name: &str, value: Value) -> Self {
        if let Some(Value::Object(data)) = self.envelope.get_mut("data") {
            data.insert(name.to_owned(), value);
        }
        self
    }

    /// The envelope as JSON.
    #[must_use]
    pub fn build(self) -> Value {
        Value::Object(self.envelope)
    }

    /// The envelope serialized, as it travels in the stream's `data` field.
    #[must_use]
    pub fn to_json(&self) -> String {
        Value::Object(self.envelope.clone()).to_string()
    }

    /// The envelope decoded.
    ///
    /// # Panics
    ///
    /// If an attribute was overridden with a value of the wrong JSON type.
    #[must_use]
    pub fn cloud_event(&self) -> CloudEvent {
        CloudEvent::from_value(Value::Object(self.envelope.clone()))
            .expect("fixture envelope should decode")
    }
}
