//! # Distribution Projector Contracts
//!
//! Offline resolution of event contracts and validation against them.
//!
//! - [`SchemaResolver`] maps a contract URI to a schema document, searching an
//!   operator override directory, a shared contracts checkout and finally the
//!   schemas bundled into the binary. Never touches the network.
//! - [`ContractValidator`] validates envelopes and payloads, pre-resolving
//!   every `$ref` into the contract namespace before compiling a validator,
//!   and memoizes compiled validators per schema.
//!
//! ## Example
//!
//! ```
//! use distribution_projector_contracts::{ContractValidator, SchemaResolver};
//! use std::sync::Arc;
//!
//! let resolver = Arc::new(SchemaResolver::bundled_only());
//! let validator = ContractValidator::new(resolver);
//! assert!(validator.validate_envelope(&serde_json::json!({})).is_err());
//! ```

mod bundled;
mod error;
mod resolver;
mod validator;

pub use bundled::{bundled_paths, bundled_schema};
pub use error::SchemaError;
pub use resolver::{
    SchemaResolver, SchemaResolverBuilder, SchemaSource, CONTRACTS_BASE_URI,
    DEFAULT_SHARED_CONTRACTS_DIR,
};
pub use validator::{ContractValidator, DEFAULT_ENVELOPE_SCHEMA_URI, MAX_REPORTED_VIOLATIONS};
