//! Contract validation with offline `$ref` resolution.

use crate::error::SchemaError;
use crate::resolver::{SchemaResolver, CONTRACTS_BASE_URI};
use distribution_projector_core::ContractError;
use jsonschema::{Draft, Retrieve, Uri, Validator};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Envelope schema used unless configured otherwise.
pub const DEFAULT_ENVELOPE_SCHEMA_URI: &str =
    "https://contracts.logistrack/schemas/BloqueConsolidadoListo/2.0/cloudevent.json";

/// Violations reported per failed validation; the rest are dropped.
pub const MAX_REPORTED_VIOLATIONS: usize = 10;

type EnvelopeKey = (String, Option<String>);

/// Validates envelopes and payloads against resolved contracts.
///
/// Compiled validators are cached: data validators per schema URI, envelope
/// validators per (envelope schema, declared dataschema) pair. Compiling
/// resolves every referenced contract up front, so validation itself never
/// performs I/O.
pub struct ContractValidator {
    resolver: Arc<SchemaResolver>,
    envelope_schema_uri: String,
    data_validators: RwLock<HashMap<String, Arc<Validator>>>,
    envelope_validators: RwLock<HashMap<EnvelopeKey, Arc<Validator>>>,
}

impl fmt::Debug for ContractValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractValidator")
            .field("resolver", &self.resolver)
            .field("envelope_schema_uri", &self.envelope_schema_uri)
            .finish_non_exhaustive()
    }
}

impl ContractValidator {
    /// Validator using [`DEFAULT_ENVELOPE_SCHEMA_URI`].
    #[must_use]
    pub fn new(resolver: Arc<SchemaResolver>) -> Self {
        Self {
            resolver,
            envelope_schema_uri: DEFAULT_ENVELOPE_SCHEMA_URI.to_owned(),
            data_validators: RwLock::new(HashMap::new()),
            envelope_validators: RwLock::new(HashMap::new()),
        }
    }

    /// Use a different envelope schema.
    #[must_use]
    pub fn with_envelope_schema(mut self, uri: impl Into<String>) -> Self {
        self.envelope_schema_uri = uri.into();
        self
    }

    /// The envelope schema in use.
    #[must_use]
    pub fn envelope_schema_uri(&self) -> &str {
        &self.envelope_schema_uri
    }

    /// Compile the envelope schema and the given data schemas now, so a
    /// broken contract setup fails at start-up rather than on the first message.
    ///
    /// # Errors
    ///
    /// [`ContractError::SchemaUnavailable`] if any schema cannot be resolved or compiled.
    pub fn warm_up(&self, data_schema_uris: &[&str]) -> Result<(), ContractError> {
        self.envelope_validator(None)?;
        for uri in data_schema_uris {
            self.data_validator(uri)?;
        }
        Ok(())
    }

    /// Validate an envelope, then its `data` against its declared `dataschema`.
    ///
    /// # Errors
    ///
    /// See [`validate_envelope`](Self::validate_envelope) and
    /// [`validate_data`](Self::validate_data).
    pub fn validate(&self, envelope: &Value) -> Result<(), ContractError> {
        self.validate_envelope(envelope)?;
        self.validate_data(
            envelope.get("data").unwrap_or(&Value::Null),
            envelope.get("dataschema").and_then(Value::as_str),
        )
    }

    /// Validate the envelope attributes.
    ///
    /// A declared `dataschema` is resolved and made available to the envelope
    /// schema's references.
    ///
    /// # Errors
    ///
    /// - [`ContractError::SchemaUnavailable`]: the envelope schema, one of its
    ///   references or the declared dataschema cannot be resolved
    /// - [`ContractError::SchemaViolation`]: the envelope does not conform
    pub fn validate_envelope(&self, envelope: &Value) -> Result<(), ContractError> {
        let dataschema = envelope.get("dataschema").and_then(Value::as_str);
        let validator = self.envelope_validator(dataschema)?;
        check(&validator, &self.envelope_schema_uri, envelope)
    }

    /// Validate a payload against `dataschema`.
    ///
    /// # Errors
    ///
    /// - [`ContractError::MissingDataSchema`]: no schema declared
    /// - [`ContractError::SchemaUnavailable`]: the schema cannot be resolved,
    ///   or the URI carries a fragment
    /// - [`ContractError::SchemaViolation`]: the payload does not conform
    pub fn validate_data(&self, data: &Value, dataschema: Option<&str>) -> Result<(), ContractError> {
        let uri = dataschema.ok_or(ContractError::MissingDataSchema)?;
        let validator = self.data_validator(uri)?;
        check(&validator, uri, data)
    }

    fn envelope_validator(&self, dataschema: Option<&str>) -> Result<Arc<Validator>, ContractError> {
        let key = (self.envelope_schema_uri.clone(), dataschema.map(str::to_owned));
        if let Some(validator) = self
            .envelope_validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(validator));
        }

        let injected = match dataschema {
            Some(uri) => {
                reject_fragment(uri)?;
                let schema = self.resolver.resolve(uri).map_err(|e| {
                    ContractError::SchemaUnavailable(format!("declared dataschema {uri}: {e}"))
                })?;
                Some((uri, schema))
            }
            None => None,
        };
        let validator = Arc::new(self.compile(&self.envelope_schema_uri, injected)?);
        self.envelope_validators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&validator));
        Ok(validator)
    }

    fn data_validator(&self, uri: &str) -> Result<Arc<Validator>, ContractError> {
        if let Some(validator) = self
            .data_validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
        {
            return Ok(Arc::clone(validator));
        }

        reject_fragment(uri)?;
        let validator = Arc::new(self.compile(uri, None)?);
        self.data_validators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.to_owned(), Arc::clone(&validator));
        Ok(validator)
    }

    fn compile(
        &self,
        uri: &str,
        injected: Option<(&str, Arc<Value>)>,
    ) -> Result<Validator, ContractError> {
        let root = self.resolver.resolve(uri)?;
        let mut store = HashMap::new();
        if let Some((injected_uri, schema)) = injected {
            self.collect_references(injected_uri, &schema, &mut store)?;
        }
        self.collect_references(uri, &root, &mut store)?;
        debug!(uri, references = store.len(), "compiling contract validator");

        jsonschema::options()
            .with_draft(Draft::Draft202012)
            .should_validate_formats(true)
            .with_retriever(StoreRetriever { store })
            .build(&root)
            .map_err(|e| {
                SchemaError::Compile {
                    uri: uri.to_owned(),
                    reason: e.to_string(),
                }
                .into()
            })
    }

    /// Put `schema` and everything it transitively references inside the
    /// contract namespace into `store`, keyed by URI without fragment.
    fn collect_references(
        &self,
        uri: &str,
        schema: &Value,
        store: &mut HashMap<String, Value>,
    ) -> Result<(), SchemaError> {
        let mut queue: VecDeque<(String, Value)> = VecDeque::new();
        queue.push_back((strip_fragment(uri).to_owned(), schema.clone()));

        while let Some((key, document)) = queue.pop_front() {
            if store.contains_key(&key) {
                continue;
            }
            let mut references = Vec::new();
            contract_references(&document, &mut references);
            store.insert(key, document);

            for reference in references {
                if !store.contains_key(&reference) {
                    let resolved = self.resolver.resolve(&reference)?;
                    queue.push_back((reference, Value::clone(&resolved)));
                }
            }
        }
        Ok(())
    }
}

fn strip_fragment(uri: &str) -> &str {
    uri.split('#').next().unwrap_or(uri)
}

/// Every `$ref` value pointing into the contract namespace, without fragment.
fn contract_references(node: &Value, out: &mut Vec<String>) {
    match node {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if reference.starts_with(CONTRACTS_BASE_URI) {
                    out.push(strip_fragment(reference).to_owned());
                }
            }
            for value in map.values() {
                contract_references(value, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                contract_references(item, out);
            }
        }
        _ => {}
    }
}

/// A dataschema names a whole document; `#...` pointers into one are refused.
fn reject_fragment(uri: &str) -> Result<(), ContractError> {
    if uri.contains('#') {
        return Err(ContractError::SchemaUnavailable(format!(
            "dataschema {uri} must not carry a fragment"
        )));
    }
    Ok(())
}

fn check(validator: &Validator, uri: &str, instance: &Value) -> Result<(), ContractError> {
    let violations: Vec<String> = validator
        .iter_errors(instance)
        .take(MAX_REPORTED_VIOLATIONS)
        .map(|error| {
            let path = error.instance_path.to_string();
            let path = if path.is_empty() { "/".to_owned() } else { path };
            format!("{path}: {error}")
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ContractError::SchemaViolation {
            uri: uri.to_owned(),
            details: violations.join("; "),
        })
    }
}

/// Serves pre-resolved documents to the schema compiler; never fetches.
struct StoreRetriever {
    store: HashMap<String, Value>,
}

impl Retrieve for StoreRetriever {
    fn retrieve(
        &self,
        uri: &Uri<&str>,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        let key = strip_fragment(uri.as_str());
        self.store
            .get(key)
            .cloned()
            .ok_or_else(|| format!("{key} is not available offline").into())
    }
}
