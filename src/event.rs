//! Normalized representation of a single row mutation.

use indexmap::IndexMap;
use serde::Serialize;
use sqlx_sqlite_cdc_transport::{ChangeOperation, ColumnValue};
use time::OffsetDateTime;

/// A row image: column name to value, in schema order.
pub type Record = IndexMap<String, ColumnValue>;

/// One row-level change on a watched table.
///
/// For DELETE, `record` holds the last known state of the row even though the row
/// no longer exists. Events are idempotent by primary key, operation and
/// `source_commit_time`, which lets a sink de-duplicate redelivered batches.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
   pub table: String,
   pub operation: ChangeOperation,
   /// Post-image; the pre-image for DELETE.
   pub record: Record,
   /// Pre-image for UPDATE and DELETE, when available.
   #[serde(skip_serializing_if = "Option::is_none")]
   pub previous_record: Option<Record>,
   /// Local wall-clock time the event was received.
   #[serde(with = "time::serde::rfc3339")]
   pub observed_at: OffsetDateTime,
   /// Upstream commit time; drives the catch-up watermark.
   #[serde(with = "time::serde::rfc3339::option")]
   pub source_commit_time: Option<OffsetDateTime>,
}

impl ChangeEvent {
   /// Creates an event observed now, with no pre-image and no commit time.
   pub fn new(table: impl Into<String>, operation: ChangeOperation, record: Record) -> Self {
      Self {
         table: table.into(),
         operation,
         record,
         previous_record: None,
         observed_at: OffsetDateTime::now_utc(),
         source_commit_time: None,
      }
   }

   pub fn with_previous_record(mut self, previous: Record) -> Self {
      self.previous_record = Some(previous);
      self
   }

   pub fn with_source_commit_time(mut self, commit_time: OffsetDateTime) -> Self {
      self.source_commit_time = Some(commit_time);
      self
   }

   /// Returns a column of the record.
   pub fn get(&self, column: &str) -> Option<&ColumnValue> {
      self.record.get(column)
   }
}
