//! `PostgreSQL` adapter of the distribution read model.
//!
//! Implements the read-model ports of `distribution-projector-core` over sqlx:
//!
//! - [`PostgresReadModelStore`] owns the connection pool and opens transactions
//! - [`PostgresReadModelTransaction`] runs every repository operation inside
//!   one transaction, so one event's writes commit or roll back together
//!
//! Schema lives in `migrations/` and is applied with [`PostgresReadModelStore::migrate`].
//!
//! # Example
//!
//! ```no_run
//! use distribution_projector_core::{ReadModelStore, ReadModelTransaction};
//! use distribution_projector_postgres::PostgresReadModelStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresReadModelStore::connect("postgres://localhost/distribucion", 5).await?;
//! store.migrate().await?;
//!
//! let tx = store.begin().await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod store;

pub use store::{PostgresReadModelStore, PostgresReadModelTransaction};
