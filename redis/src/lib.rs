//! Redis Streams adapter for the distribution projector.
//!
//! This crate implements the [`StreamConsumer`] port from
//! `distribution-projector-core` over Redis Streams consumer groups, and
//! provides the tooling to move dead-lettered entries back onto the stream.
//!
//! # Architecture
//!
//! ```text
//!  producer ──XADD──▶ ┌──────────────────────┐
//!                     │ distribucion.bloques │
//!                     └──────────┬───────────┘
//!                                │ XREADGROUP (group, consumer)
//!                                ▼
//!                     ┌──────────────────────┐
//!                     │  RedisStreamConsumer │──XACK──▶ done
//!                     └──────────┬───────────┘
//!                                │ XADD {data, error}
//!                                ▼
//!                     ┌──────────────────────┐
//!                     │ distribucion.bloques │
//!                     │        .dlq          │◀── DeadLetterReplayer
//!                     └──────────────────────┘     (XADD back + XDEL)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with explicit acknowledgement:
//! - An entry stays in the consumer's pending list until acknowledged
//! - After a crash, reading with [`ReadCursor::Backlog`] re-delivers it
//! - The projection is idempotent, so re-delivery is harmless
//!
//! # Example
//!
//! ```no_run
//! use distribution_projector_core::{ReadCursor, StreamConsumer};
//! use distribution_projector_redis::RedisStreamConsumer;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut consumer = RedisStreamConsumer::builder()
//!     .redis_url("redis://127.0.0.1:6379/0")
//!     .consumer("ms-distribucion-1")
//!     .connect()
//!     .await?;
//!
//! for message in consumer.read(ReadCursor::New, 100, Duration::from_secs(5)).await? {
//!     consumer.acknowledge(&message.id).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`StreamConsumer`]: distribution_projector_core::StreamConsumer
//! [`ReadCursor::Backlog`]: distribution_projector_core::ReadCursor::Backlog

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod consumer;
mod replay;

pub use consumer::{
    DEFAULT_REDIS_URL, RedisStreamConsumer, RedisStreamConsumerBuilder, StreamConfig,
};
pub use replay::{DeadLetterEntry, DeadLetterReplayer, ReplaySummary};

/// Stream the projector reads unless configured otherwise.
pub const DEFAULT_STREAM: &str = "distribucion.bloques";

/// Consumer group unless configured otherwise.
pub const DEFAULT_GROUP: &str = "grp.distribucion";

/// Consumer name unless configured otherwise.
pub const DEFAULT_CONSUMER: &str = "ms-distribucion-1";

/// Field holding the envelope JSON in every entry.
pub const DATA_FIELD: &str = "data";

/// Field holding the diagnostic in dead-letter entries.
pub const ERROR_FIELD: &str = "error";

/// Dead-letter stream paired with `stream`: `<stream>.dlq`.
#[must_use]
pub fn default_dead_letter_stream(stream: &str) -> String {
    format!("{stream}.dlq")
}
