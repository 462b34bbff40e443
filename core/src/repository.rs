//! Read-model persistence ports.
//!
//! The projection use case only ever talks to a [`ReadModelRepository`]. The
//! worker opens one [`ReadModelTransaction`] per message through a
//! [`ReadModelStore`] and either commits it or lets it roll back, so every
//! write of one event is atomic.
//!
//! Adapters:
//! - `distribution-projector-postgres`: sqlx over `PostgreSQL`
//! - `distribution-projector-testing`: in-memory snapshot store

use crate::error::RepositoryError;
use crate::read_model::{BlockHeader, Driver, OrderLine, OrderRecord};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;

/// Operations the projection performs against the read model.
///
/// All methods take `&mut self`: an implementation is a unit of work bound to
/// one transaction, not a shared handle.
pub trait ReadModelRepository: Send {
    /// Whether the idempotency ledger already holds `event_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger cannot be read.
    fn event_already_processed(
        &mut self,
        event_id: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Append `event_id` to the idempotency ledger.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn mark_event_processed(
        &mut self,
        event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Insert or update a driver.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn upsert_driver(
        &mut self,
        driver: &Driver,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Insert or update a block's header (date, driver, driver name).
    ///
    /// A newly created block starts with zero orders and `INC`.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn upsert_block(
        &mut self,
        block: &BlockHeader,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Force the block's completeness state to `INC`.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn set_block_incomplete(
        &mut self,
        block_id: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// The subset of `order_ids` present in the read model, in one round trip.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn existing_order_ids(
        &mut self,
        order_ids: &[String],
    ) -> impl Future<Output = Result<HashSet<String>, RepositoryError>> + Send;

    /// Link orders to a block, ignoring pairs that are already linked.
    ///
    /// Returns the number of links newly created.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn bulk_link_block_orders(
        &mut self,
        block_id: &str,
        order_ids: &[String],
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Recompute the block's order count from its links and persist it.
    ///
    /// Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn update_block_total_orders(
        &mut self,
        block_id: &str,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Insert or update an order and its lines (legacy contract only).
    ///
    /// Lines are upserted per (order, sku); lines absent from `lines` are kept.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn upsert_order(
        &mut self,
        order: &OrderRecord,
        lines: &[OrderLine],
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

/// A repository bound to an open transaction.
///
/// Dropping a transaction without calling [`commit`](Self::commit) discards
/// its writes.
pub trait ReadModelTransaction: ReadModelRepository + Sized {
    /// Make every write of this transaction visible.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails; nothing is persisted in that case.
    fn commit(self) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Discard every write of this transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the backend reports a failure while rolling back.
    fn rollback(self) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

/// Opens transactions against the read model.
pub trait ReadModelStore: Send + Sync {
    /// Transaction type handed to the projection.
    type Transaction: ReadModelTransaction;

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if no connection is available.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, RepositoryError>> + Send;
}
