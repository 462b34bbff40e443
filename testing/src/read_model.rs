//! In-memory read model for fast, deterministic projection tests.
//!
//! [`InMemoryReadModelStore`] hands out [`InMemoryTransaction`]s that work on
//! a private copy of the committed state; [`commit`](ReadModelTransaction::commit)
//! swaps the copy in, dropping or rolling back discards it. Every repository
//! call is appended to a journal (committed or not), and any operation can be
//! made to fail.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only mutex poisoning panics

use chrono::{DateTime, Utc};
use distribution_projector_core::read_model::{
    BlockHeader, CompletenessState, Driver, OrderLine, OrderRecord, PreparationState,
};
use distribution_projector_core::repository::{
    ReadModelRepository, ReadModelStore, ReadModelTransaction,
};
use distribution_projector_core::RepositoryError;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// A repository operation, as recorded in the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`ReadModelRepository::event_already_processed`]
    EventAlreadyProcessed,
    /// [`ReadModelRepository::mark_event_processed`]
    MarkEventProcessed,
    /// [`ReadModelRepository::upsert_driver`]
    UpsertDriver,
    /// [`ReadModelRepository::upsert_block`]
    UpsertBlock,
    /// [`ReadModelRepository::set_block_incomplete`]
    SetBlockIncomplete,
    /// [`ReadModelRepository::existing_order_ids`]
    ExistingOrderIds,
    /// [`ReadModelRepository::bulk_link_block_orders`]
    BulkLinkBlockOrders,
    /// [`ReadModelRepository::update_block_total_orders`]
    UpdateBlockTotalOrders,
    /// [`ReadModelRepository::upsert_order`]
    UpsertOrder,
    /// [`ReadModelStore::begin`]
    Begin,
    /// [`ReadModelTransaction::commit`]
    Commit,
}

impl Operation {
    /// Whether the operation mutates the read model.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            Self::MarkEventProcessed
                | Self::UpsertDriver
                | Self::UpsertBlock
                | Self::SetBlockIncomplete
                | Self::BulkLinkBlockOrders
                | Self::UpdateBlockTotalOrders
                | Self::UpsertOrder
        )
    }
}

/// A block as stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRow {
    /// Header written by the projection.
    pub header: BlockHeader,
    /// Derived order count.
    pub total_orders: u64,
    /// Completeness state.
    pub completeness: CompletenessState,
}

/// The whole read model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadModelState {
    /// Drivers by id.
    pub drivers: BTreeMap<String, Driver>,
    /// Blocks by id.
    pub blocks: BTreeMap<String, BlockRow>,
    /// Orders by id.
    pub orders: BTreeMap<String, OrderRecord>,
    /// Lines by (order id, sku).
    pub order_lines: BTreeMap<(String, String), OrderLine>,
    /// (block id, order id) links.
    pub links: BTreeSet<(String, String)>,
    /// Idempotency ledger.
    pub processed_events: BTreeMap<String, DateTime<Utc>>,
}

impl ReadModelState {
    /// Order ids linked to `block_id`, sorted.
    #[must_use]
    pub fn linked_orders(&self, block_id: &str) -> Vec<String> {
        self.links
            .iter()
            .filter(|(block, _)| block == block_id)
            .map(|(_, order)| order.clone())
            .collect()
    }

    /// A stored block.
    #[must_use]
    pub fn block(&self, block_id: &str) -> Option<&BlockRow> {
        self.blocks.get(block_id)
    }

    /// Lines of `order_id`.
    #[must_use]
    pub fn lines_of(&self, order_id: &str) -> Vec<&OrderLine> {
        self.order_lines
            .iter()
            .filter(|((order, _), _)| order == order_id)
            .map(|(_, line)| line)
            .collect()
    }
}

/// An order as it would exist before any block references it.
#[must_use]
pub fn seeded_order(id: &str) -> OrderRecord {
    OrderRecord {
        id: id.to_owned(),
        pyme_id: "pyme-seed".to_owned(),
        origin_center_id: "cd-origin".to_owned(),
        destination_center_id: "cd-destination".to_owned(),
        dispatch_date: DateTime::<Utc>::UNIX_EPOCH,
        preparation: PreparationState::Pending,
        total_weight: 0.0,
        total_volume: 0.0,
        driver_id: None,
    }
}

#[derive(Debug, Default)]
struct Shared {
    committed: ReadModelState,
    journal: Vec<(Operation, String)>,
    failing: HashSet<Operation>,
    commits: usize,
    rollbacks: usize,
}

/// In-memory [`ReadModelStore`].
///
/// Clones share state, so a test can keep a handle while the worker owns
/// another. Concurrent transactions are not isolated from each other: the
/// last commit wins.
///
/// # Example
///
/// ```
/// use distribution_projector_core::repository::{ReadModelRepository, ReadModelStore, ReadModelTransaction};
/// use distribution_projector_testing::InMemoryReadModelStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryReadModelStore::with_orders(["o-1"]);
///
/// let mut tx = store.begin().await?;
/// tx.bulk_link_block_orders("b-1", &["o-1".to_owned()]).await?;
/// drop(tx); // not committed
///
/// assert!(store.snapshot().links.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryReadModelStore {
    shared: Arc<Mutex<Shared>>,
}

impl InMemoryReadModelStore {
    /// Empty read model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read model pre-populated with the given orders.
    #[must_use]
    pub fn with_orders<I, S>(order_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        for id in order_ids {
            store.insert_order(id.as_ref());
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    /// Add an order outside of any projection.
    pub fn insert_order(&self, order_id: &str) {
        self.lock()
            .committed
            .orders
            .insert(order_id.to_owned(), seeded_order(order_id));
    }

    /// Mark a block complete, as the downstream completeness process would.
    pub fn complete_block(&self, block_id: &str) {
        if let Some(block) = self.lock().committed.blocks.get_mut(block_id) {
            block.completeness = CompletenessState::Complete;
        }
    }

    /// Copy of the committed state.
    #[must_use]
    pub fn snapshot(&self) -> ReadModelState {
        self.lock().committed.clone()
    }

    /// Every call made so far, with its main key (event, block, order or driver id).
    #[must_use]
    pub fn journal(&self) -> Vec<(Operation, String)> {
        self.lock().journal.clone()
    }

    /// Operations recorded so far, without keys.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().journal.iter().map(|(op, _)| *op).collect()
    }

    /// Forget the journal.
    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Make every subsequent `operation` fail with a storage error.
    pub fn fail_on(&self, operation: Operation) {
        self.lock().failing.insert(operation);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    /// Number of explicit rollbacks.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    fn record(&self, operation: Operation, key: &str) -> Result<(), RepositoryError> {
        let mut shared = self.lock();
        shared.journal.push((operation, key.to_owned()));
        if shared.failing.contains(&operation) {
            return Err(RepositoryError::Storage(format!(
                "injected failure on {operation:?}"
            )));
        }
        Ok(())
    }
}

impl ReadModelStore for InMemoryReadModelStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, RepositoryError> {
        self.record(Operation::Begin, "")
            .map_err(|e| RepositoryError::Transaction(e.to_string()))?;
        Ok(InMemoryTransaction {
            store: self.clone(),
            working: self.snapshot(),
        })
    }
}

/// A unit of work over a private copy of the read model.
#[derive(Debug)]
pub struct InMemoryTransaction {
    store: InMemoryReadModelStore,
    working: ReadModelState,
}

impl InMemoryTransaction {
    /// The state as this transaction sees it.
    #[must_use]
    pub const fn state(&self) -> &ReadModelState {
        &self.working
    }

    fn block_mut(&mut self, block_id: &str) -> Result<&mut BlockRow, RepositoryError> {
        self.working
            .blocks
            .get_mut(block_id)
            .ok_or_else(|| RepositoryError::Storage(format!("block {block_id} does not exist")))
    }
}

impl ReadModelRepository for InMemoryTransaction {
    async fn event_already_processed(&mut self, event_id: &str) -> Result<bool, RepositoryError> {
        self.store.record(Operation::EventAlreadyProcessed, event_id)?;
        Ok(self.working.processed_events.contains_key(event_id))
    }

    async fn mark_event_processed(
        &mut self,
        event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.store.record(Operation::MarkEventProcessed, event_id)?;
        self.working
            .processed_events
            .entry(event_id.to_owned())
            .or_insert(processed_at);
        Ok(())
    }

    async fn upsert_driver(&mut self, driver: &Driver) -> Result<(), RepositoryError> {
        self.store.record(Operation::UpsertDriver, &driver.id)?;
        self.working
            .drivers
            .insert(driver.id.clone(), driver.clone());
        Ok(())
    }

    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), RepositoryError> {
        self.store.record(Operation::UpsertBlock, &block.id)?;
        self.working
            .blocks
            .entry(block.id.clone())
            .and_modify(|row| row.header = block.clone())
            .or_insert_with(|| BlockRow {
                header: block.clone(),
                total_orders: 0,
                completeness: CompletenessState::Incomplete,
            });
        Ok(())
    }

    async fn set_block_incomplete(&mut self, block_id: &str) -> Result<(), RepositoryError> {
        self.store.record(Operation::SetBlockIncomplete, block_id)?;
        self.block_mut(block_id)?.completeness = CompletenessState::Incomplete;
        Ok(())
    }

    async fn existing_order_ids(
        &mut self,
        order_ids: &[String],
    ) -> Result<HashSet<String>, RepositoryError> {
        self.store
            .record(Operation::ExistingOrderIds, &order_ids.join(","))?;
        Ok(order_ids
            .iter()
            .filter(|id| self.working.orders.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn bulk_link_block_orders(
        &mut self,
        block_id: &str,
        order_ids: &[String],
    ) -> Result<u64, RepositoryError> {
        self.store.record(Operation::BulkLinkBlockOrders, block_id)?;
        let mut created = 0;
        for order_id in order_ids {
            if self
                .working
                .links
                .insert((block_id.to_owned(), order_id.clone()))
            {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn update_block_total_orders(&mut self, block_id: &str) -> Result<u64, RepositoryError> {
        self.store.record(Operation::UpdateBlockTotalOrders, block_id)?;
        let total = self.working.linked_orders(block_id).len() as u64;
        self.block_mut(block_id)?.total_orders = total;
        Ok(total)
    }

    async fn upsert_order(
        &mut self,
        order: &OrderRecord,
        lines: &[OrderLine],
    ) -> Result<(), RepositoryError> {
        self.store.record(Operation::UpsertOrder, &order.id)?;
        self.working.orders.insert(order.id.clone(), order.clone());
        for line in lines {
            self.working
                .order_lines
                .insert((order.id.clone(), line.sku.clone()), line.clone());
        }
        Ok(())
    }
}

impl ReadModelTransaction for InMemoryTransaction {
    async fn commit(self) -> Result<(), RepositoryError> {
        self.store
            .record(Operation::Commit, "")
            .map_err(|e| RepositoryError::Transaction(e.to_string()))?;
        let mut shared = self.store.lock();
        shared.committed = self.working;
        shared.commits += 1;
        Ok(())
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        self.store.lock().rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = InMemoryReadModelStore::with_orders(["o-1"]);
        let mut tx = store.begin().await.unwrap();
        tx.bulk_link_block_orders("b-1", &["o-1".to_owned()])
            .await
            .unwrap();
        assert_eq!(tx.state().linked_orders("b-1"), vec!["o-1"]);
        tx.rollback().await.unwrap();

        assert!(store.snapshot().links.is_empty());
        assert_eq!(store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn commit_publishes_writes() {
        let store = InMemoryReadModelStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.mark_event_processed("e-1", Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.snapshot().processed_events.contains_key("e-1"));
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_storage_errors() {
        let store = InMemoryReadModelStore::new();
        store.fail_on(Operation::UpsertDriver);
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .upsert_driver(&Driver {
                id: "c-1".into(),
                name: "Ana".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Storage(_)));
        assert_eq!(
            store.journal().last(),
            Some(&(Operation::UpsertDriver, "c-1".to_owned()))
        );
    }

    #[tokio::test]
    async fn recount_requires_existing_block() {
        let store = InMemoryReadModelStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(tx.update_block_total_orders("nope").await.is_err());
    }
}
