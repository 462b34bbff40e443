//! Error taxonomy of the projector.
//!
//! Every failure of a message ends up in exactly one of three tiers, which is
//! also the tag written to the dead-letter stream:
//!
//! | Tier | Type | Dead-letter tag |
//! |---|---|---|
//! | contract | [`ContractError`] | `contract` |
//! | business | [`ProjectionError`] | `projection` |
//! | anything else | [`RepositoryError`] | `unexpected` |

use thiserror::Error;

/// How many missing order ids a [`ProjectionError::MissingOrders`] message lists.
pub const MISSING_ORDERS_PREVIEW: usize = 5;

/// The event does not honour its contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// The envelope carries no (or an empty) `id`.
    #[error("envelope without id")]
    MissingId,

    /// The declared `type` is absent, unknown, or not accepted by this deployment.
    #[error("unsupported event type: {}", .0.as_deref().unwrap_or("<none>"))]
    UnsupportedType(Option<String>),

    /// The envelope declares no `dataschema`, so its payload cannot be validated.
    #[error("envelope without dataschema")]
    MissingDataSchema,

    /// The envelope or its payload could not be mapped onto the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A date field could not be parsed.
    #[error("invalid date {value:?}: {reason}")]
    InvalidDate {
        /// Raw value from the payload
        value: String,
        /// Parser diagnostic
        reason: String,
    },

    /// A schema the contract needs could not be resolved or compiled.
    #[error("schema unavailable: {0}")]
    SchemaUnavailable(String),

    /// The instance violates the schema.
    #[error("schema violation ({uri}): {details}")]
    SchemaViolation {
        /// URI of the schema that rejected the instance
        uri: String,
        /// `instance_path: message` entries joined with `; `
        details: String,
    },
}

/// The event is well-formed but cannot be applied to the read model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// Strict mode: the block references orders the read model does not know.
    #[error(
        "block {block_id} references unknown orders: {}",
        preview_ids(.missing)
    )]
    MissingOrders {
        /// Block being projected
        block_id: String,
        /// Every missing order id, in payload order
        missing: Vec<String>,
    },
}

/// Storage failure reported by a repository adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// A query failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Opening, committing or rolling back a transaction failed.
    #[error("transaction error: {0}")]
    Transaction(String),
}

/// Any failure of the projection use case.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectorError {
    /// See [`ContractError`].
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// See [`ProjectionError`].
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// See [`RepositoryError`].
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ProjectorError {
    /// Tag prefixed to the dead-letter diagnostic (`<tag>:<message>`).
    #[must_use]
    pub const fn dead_letter_tag(&self) -> &'static str {
        match self {
            Self::Contract(_) => "contract",
            Self::Projection(_) => "projection",
            Self::Repository(_) => "unexpected",
        }
    }
}

fn preview_ids(ids: &[String]) -> String {
    let shown = ids
        .iter()
        .take(MISSING_ORDERS_PREVIEW)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if ids.len() > MISSING_ORDERS_PREVIEW {
        format!("[{shown}]…")
    } else {
        format!("[{shown}]")
    }
}
