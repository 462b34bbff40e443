//! Schemas compiled into the binary, the last resort of the resolver.

const BUNDLED: &[(&str, &str)] = &[
    (
        "BloqueConsolidadoListo/2.0/cloudevent.json",
        include_str!("../schemas/BloqueConsolidadoListo/2.0/cloudevent.json"),
    ),
    (
        "BloqueConsolidadoListo/1.2/schema.json",
        include_str!("../schemas/BloqueConsolidadoListo/1.2/schema.json"),
    ),
    (
        "BloqueConsolidadoListo/1.0/schema.json",
        include_str!("../schemas/BloqueConsolidadoListo/1.0/schema.json"),
    ),
    (
        "common/1.0/defs.json",
        include_str!("../schemas/common/1.0/defs.json"),
    ),
];

/// Raw text of a bundled schema, by path relative to the contract namespace.
#[must_use]
pub fn bundled_schema(relative_path: &str) -> Option<&'static str> {
    BUNDLED
        .iter()
        .find(|(path, _)| *path == relative_path)
        .map(|(_, text)| *text)
}

/// Relative paths of every bundled schema.
pub fn bundled_paths() -> impl Iterator<Item = &'static str> {
    BUNDLED.iter().map(|(path, _)| *path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_bundled_schema_is_json_with_matching_id() {
        for path in bundled_paths() {
            let text = bundled_schema(path).unwrap_or_default();
            let value: serde_json::Value =
                serde_json::from_str(text).unwrap_or(serde_json::Value::Null);
            let id = value.get("$id").and_then(serde_json::Value::as_str);
            assert_eq!(
                id,
                Some(format!("https://contracts.logistrack/schemas/{path}").as_str()),
                "{path}"
            );
        }
    }

    #[test]
    fn unknown_paths_are_not_bundled() {
        assert!(bundled_schema("BloqueConsolidadoListo/9.9/schema.json").is_none());
    }
}
