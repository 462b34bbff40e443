//! The block projection use case.
//!
//! # Overview
//!
//! [`BlockProjection::project`] applies one `BloqueConsolidadoListo` event to
//! the read model through a [`ReadModelRepository`]. Each step gates the next:
//!
//! ```text
//! id present? ─► already processed? ─► accepted type? ─► parse block
//!   (contract)     (duplicate: stop)     (contract)       (contract)
//!
//! upsert driver ─► upsert block ─► block := INC ─► resolve orders
//!
//! missing + strict? ─► link orders ─► recount ─► mark processed
//!   (projection)        (new links)
//! ```
//!
//! The ledger write is the last step, so an event whose projection failed is
//! never recorded as processed. Atomicity across the steps is the caller's
//! transaction: the worker runs `project` inside a
//! [`ReadModelTransaction`](crate::repository::ReadModelTransaction) and
//! commits only on success.
//!
//! ## Versions
//!
//! - **v2** (current): orders are referenced by id and must already exist
//!   under the strict policy; the lenient policy links the existing subset.
//! - **v1** (legacy, opt-in via [`AcceptedVersions::All`]): the event carries
//!   full orders and lines, which are upserted and then linked.
//!
//! ## Example
//!
//! ```ignore
//! let projection = BlockProjection::new(ProjectionPolicy::default());
//! let mut tx = store.begin().await?;
//! match projection.project(&mut tx, &event).await {
//!     Ok(outcome) => tx.commit().await?,
//!     Err(e) => tx.rollback().await?,
//! }
//! ```

use crate::envelope::{AcceptedVersions, CloudEvent, ContractVersion};
use crate::environment::{Clock, SystemClock};
use crate::error::{ContractError, ProjectionError, ProjectorError};
use crate::payload::{parse_block_date, BlockReadyV1, BlockReadyV2, DriverPayload};
use crate::read_model::{BlockHeader, Driver, OrderLine, OrderRecord, PreparationState};
use crate::repository::ReadModelRepository;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Behavioural switches of the projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProjectionPolicy {
    /// Reject events referencing unknown orders (default) instead of linking
    /// the known subset.
    pub strict_orders: bool,
    /// Contract versions that are projected.
    pub accepted_versions: AcceptedVersions,
}

impl Default for ProjectionPolicy {
    fn default() -> Self {
        Self {
            strict_orders: true,
            accepted_versions: AcceptedVersions::Current,
        }
    }
}

impl ProjectionPolicy {
    /// Link existing orders and report the rest as missing.
    #[must_use]
    pub const fn lenient(mut self) -> Self {
        self.strict_orders = false;
        self
    }

    /// Set the accepted contract versions.
    #[must_use]
    pub const fn with_accepted_versions(mut self, accepted: AcceptedVersions) -> Self {
        self.accepted_versions = accepted;
        self
    }
}

/// Result of a projection.
///
/// Serializes to the shape operators see in logs:
/// `{"status":"projected","id":..,"bloque_id":..,"linked":..,"missing":..}` or
/// `{"status":"duplicate","id":..}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProjectionOutcome {
    /// The event was applied.
    Projected {
        /// Event id
        id: String,
        /// Projected block
        #[serde(rename = "bloque_id")]
        block_id: String,
        /// Links created by this event
        linked: u64,
        /// Referenced orders that were not linked (lenient mode only)
        missing: usize,
    },
    /// The event id was already in the ledger; nothing was written.
    Duplicate {
        /// Event id
        id: String,
    },
}

impl ProjectionOutcome {
    /// Id of the event this outcome belongs to.
    #[must_use]
    pub fn event_id(&self) -> &str {
        match self {
            Self::Projected { id, .. } | Self::Duplicate { id } => id,
        }
    }
}

struct Linked {
    block_id: String,
    linked: u64,
    missing: usize,
}

/// Projects `BloqueConsolidadoListo` events into the read model.
#[derive(Clone, Debug)]
pub struct BlockProjection<C = SystemClock> {
    policy: ProjectionPolicy,
    clock: C,
}

impl BlockProjection<SystemClock> {
    /// Projection stamping the ledger with wall-clock time.
    #[must_use]
    pub const fn new(policy: ProjectionPolicy) -> Self {
        Self {
            policy,
            clock: SystemClock,
        }
    }
}

impl<C: Clock> BlockProjection<C> {
    /// Projection stamping the ledger with `clock`.
    pub const fn with_clock(policy: ProjectionPolicy, clock: C) -> Self {
        Self { policy, clock }
    }

    /// Active policy.
    pub const fn policy(&self) -> ProjectionPolicy {
        self.policy
    }

    /// Apply `event` to the read model.
    ///
    /// # Errors
    ///
    /// - [`ProjectorError::Contract`]: no id, type not accepted, payload or
    ///   date not parseable
    /// - [`ProjectorError::Projection`]: strict mode and some referenced
    ///   orders do not exist; nothing has been linked at that point
    /// - [`ProjectorError::Repository`]: any storage failure
    ///
    /// Writes performed before an error are not undone here; the caller's
    /// transaction discards them.
    pub async fn project<R: ReadModelRepository>(
        &self,
        repo: &mut R,
        event: &CloudEvent,
    ) -> Result<ProjectionOutcome, ProjectorError> {
        let event_id = event.event_id().ok_or(ContractError::MissingId)?;

        if repo.event_already_processed(event_id).await? {
            debug!(event_id, "event already processed, skipping");
            return Ok(ProjectionOutcome::Duplicate {
                id: event_id.to_owned(),
            });
        }

        let version = self
            .policy
            .accepted_versions
            .resolve(event.event_type.as_deref())?;
        debug!(event_id, %version, "projecting event");

        let Linked {
            block_id,
            linked,
            missing,
        } = match version {
            ContractVersion::V2 => self.link_referenced_orders(repo, &event.data).await?,
            ContractVersion::V1 => upsert_and_link_orders(repo, &event.data).await?,
        };

        let total_orders = repo.update_block_total_orders(&block_id).await?;
        repo.mark_event_processed(event_id, self.clock.now()).await?;

        info!(
            event_id,
            block_id = %block_id,
            linked,
            missing,
            total_orders,
            "block projected"
        );

        Ok(ProjectionOutcome::Projected {
            id: event_id.to_owned(),
            block_id,
            linked,
            missing,
        })
    }

    async fn link_referenced_orders<R: ReadModelRepository>(
        &self,
        repo: &mut R,
        data: &Value,
    ) -> Result<Linked, ProjectorError> {
        let payload = BlockReadyV2::from_data(data)?;
        let header = block_header(&payload.bloque.id, &payload.bloque.fecha, &payload.bloque.chofer)?;
        write_block(repo, &header).await?;

        let order_ids = payload.order_ids();
        let existing = if order_ids.is_empty() {
            Default::default()
        } else {
            repo.existing_order_ids(&order_ids).await?
        };
        let (present, missing): (Vec<String>, Vec<String>) =
            order_ids.into_iter().partition(|id| existing.contains(id));

        if !missing.is_empty() {
            if self.policy.strict_orders {
                return Err(ProjectionError::MissingOrders {
                    block_id: header.id,
                    missing,
                }
                .into());
            }
            warn!(
                block_id = %header.id,
                missing = missing.len(),
                "linking block without unknown orders"
            );
        }

        let linked = link(repo, &header.id, &present).await?;
        Ok(Linked {
            block_id: header.id,
            linked,
            missing: missing.len(),
        })
    }
}

async fn upsert_and_link_orders<R: ReadModelRepository>(
    repo: &mut R,
    data: &Value,
) -> Result<Linked, ProjectorError> {
    let payload = BlockReadyV1::from_data(data)?;
    let header = block_header(&payload.bloque_id, &payload.fecha_despacho, &payload.chofer)?;
    write_block(repo, &header).await?;

    let mut order_ids: Vec<String> = Vec::with_capacity(payload.ordenes.len());
    for order in &payload.ordenes {
        let lines: Vec<OrderLine> = order
            .productos
            .iter()
            .map(|line| OrderLine {
                sku: line.sku.clone(),
                qty: line.qty,
                weight: line.peso,
                volume: line.volumen,
            })
            .collect();
        let record = OrderRecord {
            id: order.id.clone(),
            pyme_id: order.pyme_id.clone(),
            origin_center_id: order.origen_cd_id.clone(),
            destination_center_id: order.destino_cd_id.clone(),
            dispatch_date: header.date,
            preparation: PreparationState::Pending,
            total_weight: lines.iter().map(|l| l.weight).sum(),
            total_volume: lines.iter().map(|l| l.volume).sum(),
            driver_id: Some(header.driver_id.clone()),
        };
        debug!(order_id = %record.id, lines = lines.len(), "upserting order");
        repo.upsert_order(&record, &lines).await?;
        if !order_ids.contains(&record.id) {
            order_ids.push(record.id);
        }
    }

    let linked = link(repo, &header.id, &order_ids).await?;
    Ok(Linked {
        block_id: header.id,
        linked,
        missing: 0,
    })
}

fn block_header(id: &str, date: &str, driver: &DriverPayload) -> Result<BlockHeader, ContractError> {
    Ok(BlockHeader {
        id: id.to_owned(),
        date: parse_block_date(date)?,
        driver_id: driver.id.clone(),
        driver_name: driver.nombre.clone(),
    })
}

async fn write_block<R: ReadModelRepository>(
    repo: &mut R,
    header: &BlockHeader,
) -> Result<(), ProjectorError> {
    debug!(driver_id = %header.driver_id, "upserting driver");
    repo.upsert_driver(&Driver {
        id: header.driver_id.clone(),
        name: header.driver_name.clone(),
    })
    .await?;
    debug!(block_id = %header.id, "upserting block");
    repo.upsert_block(header).await?;
    repo.set_block_incomplete(&header.id).await?;
    Ok(())
}

async fn link<R: ReadModelRepository>(
    repo: &mut R,
    block_id: &str,
    order_ids: &[String],
) -> Result<u64, ProjectorError> {
    if order_ids.is_empty() {
        return Ok(0);
    }
    let linked = repo.bulk_link_block_orders(block_id, order_ids).await?;
    debug!(block_id, requested = order_ids.len(), linked, "orders linked");
    Ok(linked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_strict_current_only() {
        let policy = ProjectionPolicy::default();
        assert!(policy.strict_orders);
        assert_eq!(policy.accepted_versions, AcceptedVersions::Current);
        assert!(!policy.lenient().strict_orders);
    }

    #[test]
    fn outcome_serializes_with_wire_names() {
        let outcome = ProjectionOutcome::Projected {
            id: "e-ok".into(),
            block_id: "b-1".into(),
            linked: 1,
            missing: 0,
        };
        assert_eq!(
            serde_json::to_value(&outcome).ok(),
            Some(serde_json::json!({
                "status": "projected",
                "id": "e-ok",
                "bloque_id": "b-1",
                "linked": 1,
                "missing": 0
            }))
        );
        assert_eq!(
            serde_json::to_value(ProjectionOutcome::Duplicate { id: "e".into() }).ok(),
            Some(serde_json::json!({"status": "duplicate", "id": "e"}))
        );
    }
}
