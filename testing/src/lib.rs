//! # Distribution Projector Testing
//!
//! Test doubles and fixtures for the distribution projector.
//!
//! This crate provides:
//! - [`InMemoryReadModelStore`]: transactional in-memory read model with a
//!   call journal and failure injection
//! - [`InMemoryStream`]: consumer-group stream double with pending-entry
//!   bookkeeping and dead-letter capture
//! - [`EnvelopeBuilder`]: envelopes that pass the bundled contracts
//! - [`FixedClock`] / [`test_clock`]: deterministic time
//! - [`properties`]: proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use distribution_projector_testing::{EnvelopeBuilder, InMemoryReadModelStore, test_clock};
//!
//! #[tokio::test]
//! async fn links_known_order() {
//!     let store = InMemoryReadModelStore::with_orders(["o-1"]);
//!     let projection = BlockProjection::with_clock(ProjectionPolicy::default(), test_clock());
//!     let event = EnvelopeBuilder::block_ready_v2("e-ok", "b-1", &["o-1"]).cloud_event();
//!
//!     let mut tx = store.begin().await.unwrap();
//!     projection.project(&mut tx, &event).await.unwrap();
//!     tx.commit().await.unwrap();
//!
//!     assert_eq!(store.snapshot().linked_orders("b-1"), vec!["o-1"]);
//! }
//! ```

use chrono::{DateTime, Utc};
use distribution_projector_core::environment::Clock;

pub mod fixtures;
pub mod read_model;
pub mod stream;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use distribution_projector_testing::mocks::FixedClock;
    /// use distribution_projector_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::collection::vec;
    use proptest::prelude::*;

    /// Order ids drawn from a small alphabet, so that duplicates and overlaps
    /// between generated lists are common.
    pub fn order_id() -> impl Strategy<Value = String> {
        (0u8..12).prop_map(|n| format!("o-{n}"))
    }

    /// A list of up to `max` order ids, duplicates allowed.
    pub fn order_ids(max: usize) -> impl Strategy<Value = Vec<String>> {
        vec(order_id(), 0..=max)
    }
}

// Re-export commonly used items
pub use fixtures::EnvelopeBuilder;
pub use mocks::{FixedClock, test_clock};
pub use read_model::{InMemoryReadModelStore, InMemoryTransaction, Operation, ReadModelState};
pub use stream::{DeadLetterEntry, InMemoryStream};
