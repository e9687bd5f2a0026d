//! # sqlite-cdc
//!
//! Change-data-capture ingestion core for SQLite.
//!
//! Row-level changes on watched tables are captured through SQLite hooks,
//! normalised into [`ChangeEvent`]s, buffered by a [`BatchAccumulator`] and
//! handed to a caller-supplied [`Sink`] in batches. A batch is due when it
//! reaches `max_batch_size` events or when the `max_batch_age` timer fires,
//! whichever comes first. A batch the sink rejects is requeued whole, ahead of
//! newer events, and retried on the next trigger.
//!
//! Rows changed while nobody was listening can be replayed from the table
//! itself with the [`CatchUpReader`], bounded by per-table [`Watermarks`].
//!
//! Delivery is at-least-once. Buffered events live in memory only, so sinks
//! should write idempotently (by primary key, operation and source commit
//! time) and a crash loses whatever was not delivered yet.

mod accumulator;
mod batch;
mod catchup;
mod config;
mod delivery;
mod error;
mod event;
mod lifecycle;
mod registry;
mod status;
mod timestamp;
mod watermark;

pub use accumulator::BatchAccumulator;
pub use batch::{Batch, BatchCounts};
pub use catchup::CatchUpReader;
pub use config::{CdcConfig, TableConfig, TimestampEncoding};
pub use delivery::{DeliveryPipeline, Sink};
pub use error::{Error, Result, SinkError};
pub use event::{ChangeEvent, Record};
pub use lifecycle::Pipeline;
pub use registry::{Subscription, SubscriptionRegistry, SubscriptionStatus};
pub use status::{LifecycleState, PipelineStatus};
pub use watermark::Watermarks;

pub use sqlx_sqlite_cdc_conn::{ConnectionManager, ConnectionState, SqliteDatabaseConfig};
pub use sqlx_sqlite_cdc_transport::{
   ChangeHandler, ChangeOperation, ChangeTransport, ChannelEvent, ChannelHandle, ColumnValue,
   HookTransport, ObservedWriter, RawChange,
};
