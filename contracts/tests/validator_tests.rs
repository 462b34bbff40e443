//! Contract validation against the bundled schemas.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use distribution_projector_contracts::{ContractValidator, SchemaResolver, MAX_REPORTED_VIOLATIONS};
use distribution_projector_core::ContractError;
use distribution_projector_testing::fixtures::{
    BLOCK_READY_V1_SCHEMA_URI, BLOCK_READY_V2_SCHEMA_URI,
};
use distribution_projector_testing::EnvelopeBuilder;
use serde_json::json;
use std::fs;
use std::sync::Arc;

fn bundled() -> ContractValidator {
    ContractValidator::new(Arc::new(SchemaResolver::bundled_only()))
}

#[test]
fn current_fixture_passes() {
    let envelope = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1", "o-2"]).build();
    bundled().validate(&envelope).unwrap();
}

#[test]
fn legacy_fixture_passes() {
    let envelope = EnvelopeBuilder::block_ready_v1("e-1", "b-1", &["o-1"]).build();
    bundled().validate(&envelope).unwrap();
}

#[test]
fn integer_ids_are_accepted() {
    let envelope = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &[])
        .data_member(
            "bloque",
            json!({"id": 41, "fecha": "2025-08-11 10:00:00", "chofer": {"id": 7, "nombre": "Ana"}}),
        )
        .data_member("ordenes", json!([{"id": 1001}, {"id": "o-2"}]))
        .build();
    bundled().validate(&envelope).unwrap();
}

#[test]
fn envelope_without_id_is_a_violation() {
    let envelope = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &[]).without("id").build();

    let err = bundled().validate_envelope(&envelope).unwrap_err();

    let ContractError::SchemaViolation { uri, details } = err else {
        unreachable!("expected a violation, got {err:?}");
    };
    assert!(uri.ends_with("2.0/cloudevent.json"));
    assert!(details.contains("id"), "{details}");
}

#[test]
fn malformed_time_fails_format_check() {
    let envelope = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &[])
        .attribute("time", json!("yesterday"))
        .build();

    let err = bundled().validate_envelope(&envelope).unwrap_err();

    assert!(
        matches!(err, ContractError::SchemaViolation { ref details, .. } if details.starts_with("/time")),
        "{err}"
    );
}

#[test]
fn unresolvable_dataschema_is_a_contract_error() {
    let envelope = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &[])
        .attribute(
            "dataschema",
            json!("https://contracts.logistrack/schemas/BloqueConsolidadoListo/7.0/schema.json"),
        )
        .build();

    let err = bundled().validate_envelope(&envelope).unwrap_err();

    assert!(matches!(err, ContractError::SchemaUnavailable(ref m) if m.contains("7.0")), "{err}");
}

#[test]
fn foreign_dataschema_is_a_contract_error() {
    let envelope = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &[])
        .attribute("dataschema", json!("https://example.com/schema.json"))
        .build();

    assert!(matches!(
        bundled().validate_envelope(&envelope),
        Err(ContractError::SchemaUnavailable(_))
    ));
}

#[test]
fn missing_dataschema_fails_data_validation() {
    let err = bundled().validate_data(&json!({}), None).unwrap_err();
    assert_eq!(err, ContractError::MissingDataSchema);
}

#[test]
fn payload_violation_names_the_data_schema() {
    let data = json!({"bloque": {"id": "b-1", "fecha": "2025-08-11"}, "ordenes": []});

    let err = bundled()
        .validate_data(&data, Some(BLOCK_READY_V2_SCHEMA_URI))
        .unwrap_err();

    let ContractError::SchemaViolation { uri, details } = err else {
        unreachable!("expected a violation, got {err:?}");
    };
    assert_eq!(uri, BLOCK_READY_V2_SCHEMA_URI);
    assert!(details.contains("chofer"), "{details}");
}

#[test]
fn referenced_definitions_are_enforced() {
    let data = json!({
        "bloque": {"id": "b-1", "fecha": "11/08/2025", "chofer": {"id": "c-1", "nombre": ""}},
        "ordenes": []
    });

    let err = bundled()
        .validate_data(&data, Some(BLOCK_READY_V2_SCHEMA_URI))
        .unwrap_err();

    let ContractError::SchemaViolation { details, .. } = err else {
        unreachable!("expected a violation, got {err:?}");
    };
    assert!(details.contains("/bloque/fecha"), "{details}");
    assert!(details.contains("/bloque/chofer/nombre"), "{details}");
}

#[test]
fn legacy_lines_require_positive_quantities() {
    let envelope = EnvelopeBuilder::block_ready_v1("e-1", "b-1", &["o-1"]).build();
    let mut data = envelope["data"].clone();
    data["ordenes"][0]["productos"][0]["qty"] = json!(0);

    assert!(bundled()
        .validate_data(&data, Some(BLOCK_READY_V1_SCHEMA_URI))
        .is_err());
}

#[test]
fn violations_are_capped() {
    let orders: Vec<_> = (0..25).map(|_| json!({"pyme_id": "p"})).collect();
    let data = json!({
        "bloque": {"id": "b-1", "fecha": "2025-08-11", "chofer": {"id": "c-1", "nombre": "Ana"}},
        "ordenes": orders
    });

    let err = bundled()
        .validate_data(&data, Some(BLOCK_READY_V2_SCHEMA_URI))
        .unwrap_err();

    let ContractError::SchemaViolation { details, .. } = err else {
        unreachable!("expected a violation, got {err:?}");
    };
    assert_eq!(details.split("; ").count(), MAX_REPORTED_VIOLATIONS);
}

#[test]
fn override_schema_can_reference_bundled_definitions_and_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let relative = "Custom/1.0/schema.json";
    let uri = format!("https://contracts.logistrack/schemas/{relative}");
    let path = dir.path().join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": uri,
            "type": "object",
            "required": ["chofer"],
            "properties": {
                "chofer": {"$ref": "https://contracts.logistrack/schemas/common/1.0/defs.json#/$defs/driver"}
            }
        })
        .to_string(),
    )
    .unwrap();
    let resolver = SchemaResolver::builder()
        .override_dir(dir.path())
        .shared_dir(None)
        .build();
    let validator = ContractValidator::new(Arc::new(resolver));

    validator
        .validate_data(&json!({"chofer": {"id": "c-1", "nombre": "Ana"}}), Some(&uri))
        .unwrap();
    assert!(validator
        .validate_data(&json!({"chofer": {"id": "c-1"}}), Some(&uri))
        .is_err());

    fs::remove_file(&path).unwrap();
    validator
        .validate_data(&json!({"chofer": {"id": "c-2", "nombre": "Luis"}}), Some(&uri))
        .unwrap();
}

#[test]
fn warm_up_compiles_every_bundled_contract() {
    bundled()
        .warm_up(&[BLOCK_READY_V1_SCHEMA_URI, BLOCK_READY_V2_SCHEMA_URI])
        .unwrap();
}

#[test]
fn warm_up_fails_for_a_missing_envelope_schema() {
    let validator = bundled().with_envelope_schema(
        "https://contracts.logistrack/schemas/BloqueConsolidadoListo/9.0/cloudevent.json",
    );
    assert!(matches!(
        validator.warm_up(&[]),
        Err(ContractError::SchemaUnavailable(_))
    ));
}

#[test]
fn envelope_schema_can_reference_the_declared_dataschema() {
    let dir = tempfile::tempdir().unwrap();
    let relative = "Custom/1.0/cloudevent.json";
    let envelope_uri = format!("https://contracts.logistrack/schemas/{relative}");
    let path = dir.path().join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": envelope_uri,
            "type": "object",
            "required": ["id", "dataschema", "data"],
            "properties": {
                "dataschema": {"const": BLOCK_READY_V2_SCHEMA_URI},
                "data": {"$ref": BLOCK_READY_V2_SCHEMA_URI}
            }
        })
        .to_string(),
    )
    .unwrap();
    let resolver = SchemaResolver::builder()
        .override_dir(dir.path())
        .shared_dir(None)
        .build();
    let validator = ContractValidator::new(Arc::new(resolver)).with_envelope_schema(&envelope_uri);

    let conforming = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"]).build();
    validator.validate_envelope(&conforming).unwrap();

    let driverless = EnvelopeBuilder::block_ready_v2("e-2", "b-2", &[])
        .data_member("bloque", json!({"id": "b-2", "fecha": "2025-08-11"}))
        .build();
    let err = validator.validate_envelope(&driverless).unwrap_err();

    let ContractError::SchemaViolation { uri, details } = err else {
        unreachable!("expected a violation, got {err:?}");
    };
    assert_eq!(uri, envelope_uri);
    assert!(details.starts_with("/data"), "{details}");
    assert!(details.contains("chofer"), "{details}");
}

#[test]
fn dataschema_with_fragment_is_refused() {
    let envelope = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"]).build();
    let pointer = format!("{BLOCK_READY_V2_SCHEMA_URI}#/properties/bloque");

    let err = bundled()
        .validate_data(&envelope["data"], Some(&pointer))
        .unwrap_err();
    assert!(
        matches!(err, ContractError::SchemaUnavailable(ref m) if m.contains("fragment")),
        "{err}"
    );

    let declared = EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"])
        .attribute("dataschema", json!(pointer))
        .build();
    assert!(matches!(
        bundled().validate(&declared),
        Err(ContractError::SchemaUnavailable(_))
    ));
}
