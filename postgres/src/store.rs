//! sqlx implementation of the read-model ports.
//!
//! All statements of a [`PostgresReadModelTransaction`] run on one
//! `Transaction<'static, Postgres>`; set semantics (links, ledger) are
//! enforced with `ON CONFLICT` rather than read-then-write.

use distribution_projector_core::read_model::{BlockHeader, Driver, OrderLine, OrderRecord};
use distribution_projector_core::{
    DateTime, ReadModelRepository, ReadModelStore, ReadModelTransaction, RepositoryError, Utc,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::debug;

fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |e| RepositoryError::Storage(format!("Failed to {context}: {e}"))
}

/// Connection pool over the read-model database.
#[derive(Clone, Debug)]
pub struct PostgresReadModelStore {
    pool: PgPool,
}

impl PostgresReadModelStore {
    /// Connect to `database_url` with a pool of at most `max_connections`.
    ///
    /// The worker holds one connection per in-flight message, so a small pool
    /// is enough.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Storage`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(storage("connect"))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the read-model migrations.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepositoryError::Storage(format!("Migration failed: {e}")))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ReadModelStore for PostgresReadModelStore {
    type Transaction = PostgresReadModelTransaction;

    async fn begin(&self) -> Result<Self::Transaction, RepositoryError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryError::Transaction(format!("Failed to begin: {e}")))?;
        Ok(PostgresReadModelTransaction { tx })
    }
}

/// Repository bound to one open transaction.
///
/// Dropping it without [`commit`](ReadModelTransaction::commit) rolls back.
pub struct PostgresReadModelTransaction {
    tx: Transaction<'static, Postgres>,
}

impl ReadModelRepository for PostgresReadModelTransaction {
    async fn event_already_processed(&mut self, event_id: &str) -> Result<bool, RepositoryError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage("read idempotency ledger"))?;
        Ok(exists)
    }

    async fn mark_event_processed(
        &mut self,
        event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO processed_events (event_id, processed_at)
             VALUES ($1, $2)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("append to idempotency ledger"))?;
        Ok(())
    }

    async fn upsert_driver(&mut self, driver: &Driver) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO drivers (id, name)
             VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name, updated_at = now()",
        )
        .bind(&driver.id)
        .bind(&driver.name)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("upsert driver"))?;
        Ok(())
    }

    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO blocks (id, date, driver_id, driver_name)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE
             SET date = EXCLUDED.date,
                 driver_id = EXCLUDED.driver_id,
                 driver_name = EXCLUDED.driver_name,
                 updated_at = now()",
        )
        .bind(&block.id)
        .bind(block.date)
        .bind(&block.driver_id)
        .bind(&block.driver_name)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("upsert block"))?;
        Ok(())
    }

    async fn set_block_incomplete(&mut self, block_id: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE blocks SET completeness = 'INC', updated_at = now() WHERE id = $1")
            .bind(block_id)
            .execute(&mut *self.tx)
            .await
            .map_err(storage("reset block completeness"))?;
        Ok(())
    }

    async fn existing_order_ids(
        &mut self,
        order_ids: &[String],
    ) -> Result<HashSet<String>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM orders WHERE id = ANY($1)")
            .bind(order_ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("look up orders"))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn bulk_link_block_orders(
        &mut self,
        block_id: &str,
        order_ids: &[String],
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO block_orders (block_id, order_id)
             SELECT $1, order_id FROM UNNEST($2::text[]) AS linked(order_id)
             ON CONFLICT (block_id, order_id) DO NOTHING",
        )
        .bind(block_id)
        .bind(order_ids)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("link orders"))?;
        debug!(block_id, requested = order_ids.len(), created = result.rows_affected(), "orders linked");
        Ok(result.rows_affected())
    }

    async fn update_block_total_orders(&mut self, block_id: &str) -> Result<u64, RepositoryError> {
        let total: Option<(i32,)> = sqlx::query_as(
            "UPDATE blocks
             SET total_orders = (SELECT COUNT(*) FROM block_orders WHERE block_id = $1),
                 updated_at = now()
             WHERE id = $1
             RETURNING total_orders",
        )
        .bind(block_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage("recount block orders"))?;

        let (total,) =
            total.ok_or_else(|| RepositoryError::Storage(format!("block {block_id} does not exist")))?;
        u64::try_from(total)
            .map_err(|_| RepositoryError::Storage(format!("negative order count for block {block_id}")))
    }

    async fn upsert_order(
        &mut self,
        order: &OrderRecord,
        lines: &[OrderLine],
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO orders (
                 id, pyme_id, origin_center_id, destination_center_id, dispatch_date,
                 preparation, total_weight, total_volume, driver_id
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE
             SET pyme_id = EXCLUDED.pyme_id,
                 origin_center_id = EXCLUDED.origin_center_id,
                 destination_center_id = EXCLUDED.destination_center_id,
                 dispatch_date = EXCLUDED.dispatch_date,
                 preparation = EXCLUDED.preparation,
                 total_weight = EXCLUDED.total_weight,
                 total_volume = EXCLUDED.total_volume,
                 driver_id = EXCLUDED.driver_id,
                 updated_at = now()",
        )
        .bind(&order.id)
        .bind(&order.pyme_id)
        .bind(&order.origin_center_id)
        .bind(&order.destination_center_id)
        .bind(order.dispatch_date)
        .bind(order.preparation.code())
        .bind(order.total_weight)
        .bind(order.total_volume)
        .bind(order.driver_id.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(storage("upsert order"))?;

        if lines.is_empty() {
            return Ok(());
        }
        let columns = LineColumns::from_lines(&order.id, lines)?;
        sqlx::query(
            "INSERT INTO order_lines (order_id, sku, qty, weight, volume)
             SELECT $1, * FROM UNNEST($2::text[], $3::int4[], $4::float8[], $5::float8[])
             ON CONFLICT (order_id, sku) DO UPDATE
             SET qty = EXCLUDED.qty, weight = EXCLUDED.weight, volume = EXCLUDED.volume",
        )
        .bind(&order.id)
        .bind(&columns.skus)
        .bind(&columns.quantities)
        .bind(&columns.weights)
        .bind(&columns.volumes)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("upsert order lines"))?;
        Ok(())
    }
}

impl ReadModelTransaction for PostgresReadModelTransaction {
    async fn commit(self) -> Result<(), RepositoryError> {
        self.tx
            .commit()
            .await
            .map_err(|e| RepositoryError::Transaction(format!("Failed to commit: {e}")))
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| RepositoryError::Transaction(format!("Failed to roll back: {e}")))
    }
}

/// Order lines as parallel arrays for `UNNEST`, one entry per sku.
///
/// A sku repeated within one order keeps its last line; a single
/// `ON CONFLICT DO UPDATE` statement cannot touch the same row twice.
#[derive(Debug, Default, PartialEq)]
struct LineColumns {
    skus: Vec<String>,
    quantities: Vec<i32>,
    weights: Vec<f64>,
    volumes: Vec<f64>,
}

impl LineColumns {
    fn from_lines(order_id: &str, lines: &[OrderLine]) -> Result<Self, RepositoryError> {
        let mut columns = Self::default();
        let mut positions: HashMap<&str, usize> = HashMap::with_capacity(lines.len());
        for line in lines {
            let qty = i32::try_from(line.qty).map_err(|_| {
                RepositoryError::Storage(format!(
                    "quantity {} of {order_id}/{} out of range",
                    line.qty, line.sku
                ))
            })?;
            if let Some(&at) = positions.get(line.sku.as_str()) {
                columns.quantities[at] = qty;
                columns.weights[at] = line.weight;
                columns.volumes[at] = line.volume;
            } else {
                positions.insert(&line.sku, columns.skus.len());
                columns.skus.push(line.sku.clone());
                columns.quantities.push(qty);
                columns.weights.push(line.weight);
                columns.volumes.push(line.volume);
            }
        }
        Ok(columns)
    }
}
