use distribution_projector_core::ContractError;
use thiserror::Error;

/// Errors resolving or compiling a schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// No source holds the schema, or the URI is outside the contract namespace.
    #[error("schema {uri} not found ({})", describe_tried(.tried))]
    NotFound {
        /// Requested URI
        uri: String,
        /// Every location tried, in order
        tried: Vec<String>,
    },

    /// A file exists but is not valid JSON.
    #[error("schema at {location} is not valid JSON: {reason}")]
    InvalidSchema {
        /// File path or bundled path
        location: String,
        /// Parser diagnostic
        reason: String,
    },

    /// A file exists but cannot be read.
    #[error("cannot read schema at {location}: {reason}")]
    Io {
        /// File path
        location: String,
        /// OS diagnostic
        reason: String,
    },

    /// The document is JSON but not a usable schema.
    #[error("schema {uri} does not compile: {reason}")]
    Compile {
        /// Schema URI
        uri: String,
        /// Compiler diagnostic
        reason: String,
    },
}

fn describe_tried(tried: &[String]) -> String {
    if tried.is_empty() {
        "outside the contract namespace".to_owned()
    } else {
        format!("tried {}", tried.join(", "))
    }
}

impl From<SchemaError> for ContractError {
    fn from(error: SchemaError) -> Self {
        Self::SchemaUnavailable(error.to_string())
    }
}
