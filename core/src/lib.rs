//! # Distribution Projector Core
//!
//! Domain types and ports for the distribution read-model projector.
//!
//! The projector consumes `BloqueConsolidadoListo` events (a driver's block of
//! orders is ready for dispatch) and materializes them into relational read
//! state. This crate holds everything that does not touch I/O:
//!
//! - **Envelope**: the CloudEvents-style wrapper and the accepted contract
//!   versions ([`envelope`])
//! - **Payloads**: typed views of the `data` member for each contract version
//!   ([`payload`])
//! - **Read model**: the entities the projection writes ([`read_model`])
//! - **Ports**: [`repository::ReadModelRepository`] /
//!   [`repository::ReadModelStore`] for persistence and
//!   [`stream::StreamConsumer`] for the message stream
//! - **Use case**: [`projection::BlockProjection`], the idempotent projection
//!   with version dispatch and the strict/lenient order policy
//!
//! Adapters live in sibling crates (`distribution-projector-postgres`,
//! `distribution-projector-redis`) and in-memory doubles in
//! `distribution-projector-testing`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod envelope;
pub mod error;
pub mod payload;
pub mod projection;
pub mod read_model;
pub mod repository;
pub mod stream;

pub use envelope::{AcceptedVersions, CloudEvent, ContractVersion};
pub use error::{ContractError, ProjectionError, ProjectorError, RepositoryError};
pub use projection::{BlockProjection, ProjectionOutcome, ProjectionPolicy};
pub use repository::{ReadModelRepository, ReadModelStore, ReadModelTransaction};
pub use stream::{ReadCursor, StreamConsumer, StreamError, StreamMessage};

/// Environment module - injected dependencies.
///
/// The projection never reads the wall clock directly; the processed-at
/// timestamp of the idempotency ledger comes from a [`Clock`](environment::Clock).
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use distribution_projector_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = chrono::Utc::now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock implementation used in production.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
        fn now(&self) -> DateTime<Utc> {
            (**self).now()
        }
    }
}
