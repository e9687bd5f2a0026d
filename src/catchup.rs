//! Reconstructs change events from rows modified since a watermark.
//!
//! The historical store only holds current row state, so the operation is
//! inferred from timestamps: a row created after the watermark is an INSERT,
//! any other modified row is an UPDATE. Deleted rows are gone and cannot be
//! recovered this way; catch-up never yields DELETE events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteRow, SqliteValueRef};
use sqlx::{Column, Row, TypeInfo, Value, ValueRef};
use sqlx_sqlite_cdc_conn::ConnectionManager;
use sqlx_sqlite_cdc_transport::{ChangeOperation, ColumnValue};
use time::OffsetDateTime;
use tracing::debug;

use crate::config::{CdcConfig, TableConfig, TimestampEncoding, is_valid_identifier};
use crate::error::{Error, Result};
use crate::event::{ChangeEvent, Record};
use crate::timestamp::{StoredTimestamp, encode_timestamp, parse_timestamp};

/// Reads historical rows through the shared query pool.
#[derive(Debug, Clone)]
pub struct CatchUpReader {
   connections: Arc<ConnectionManager>,
   tables: HashMap<String, TableConfig>,
   initial_lookback: Duration,
   limit: usize,
}

impl CatchUpReader {
   pub fn new(connections: Arc<ConnectionManager>, config: &CdcConfig) -> Self {
      Self {
         connections,
         tables: config
            .tables
            .iter()
            .map(|table| (table.name.clone(), table.clone()))
            .collect(),
         initial_lookback: config.initial_lookback(),
         limit: config.catch_up_limit,
      }
   }

   pub fn initial_lookback(&self) -> Duration {
      self.initial_lookback
   }

   pub fn limit(&self) -> usize {
      self.limit
   }

   /// Streams rows of `table` modified after `watermark`, oldest first, at most `limit`.
   ///
   /// The stream is lazy: nothing is queried until it is first polled. The
   /// query runs on one pooled connection that is returned to the pool before
   /// the first event is yielded. Calling again with the same watermark reads
   /// the same rows, barring concurrent writes.
   pub fn read_since(
      &self,
      table: &str,
      watermark: OffsetDateTime,
      limit: usize,
   ) -> Result<BoxStream<'static, Result<ChangeEvent>>> {
      let config = self
         .tables
         .get(table)
         .ok_or_else(|| Error::UnwatchedTable(table.to_string()))?
         .clone();
      for identifier in [&config.name, &config.modified_column] {
         if !is_valid_identifier(identifier) {
            return Err(Error::InvalidConfig(format!("invalid identifier '{identifier}'")));
         }
      }

      let pool = self.connections.query_pool()?;
      let modified = format!("\"{}\"", config.modified_column);
      let (column, bound_param) = match config.timestamp_encoding {
         // Text values may mix SQLite datetimes and RFC 3339 with offsets, so both
         // sides are normalised to UTC `YYYY-MM-DD HH:MM:SS.SSS` before comparing
         TimestampEncoding::Text => (utc_text(&modified), utc_text("?1")),
         TimestampEncoding::UnixMillis | TimestampEncoding::UnixSeconds => (modified, "?1".to_string()),
      };
      let sql = format!(
         "SELECT * FROM \"{table}\" WHERE {column} > {bound_param} ORDER BY {column} ASC LIMIT ?2",
         table = config.name,
      );
      let bound = encode_timestamp(watermark, config.timestamp_encoding);
      let limit = i64::try_from(limit).unwrap_or(i64::MAX);

      let rows = stream::once(async move {
         let query = sqlx::query(&sql);
         let query = match bound {
            StoredTimestamp::Integer(value) => query.bind(value),
            StoredTimestamp::Text(value) => query.bind(value),
         };
         let rows = query
            .bind(limit)
            .fetch_all(&pool)
            .await
            .map_err(|e| Error::CatchUp {
               table: config.name.clone(),
               reason: e.to_string(),
            })?;

         debug!(table = %config.name, rows = rows.len(), watermark = %watermark, "Catch-up read");
         let events: Vec<Result<ChangeEvent>> = rows
            .iter()
            .map(|row| Ok(row_to_event(&config, watermark, row)))
            .collect();
         Ok::<_, Error>(stream::iter(events))
      });

      Ok(rows.try_flatten().boxed())
   }

   /// Cold-start read. Without a prior sync time, reads back over the
   /// configured lookback window rather than the whole table.
   pub fn perform_initial_sync(
      &self,
      table: &str,
      last_sync_time: Option<OffsetDateTime>,
   ) -> Result<BoxStream<'static, Result<ChangeEvent>>> {
      let watermark = last_sync_time.unwrap_or_else(|| OffsetDateTime::now_utc() - self.initial_lookback);
      self.read_since(table, watermark, self.limit)
   }
}

/// Renders a text timestamp expression in UTC with milliseconds. Values SQLite
/// cannot parse become NULL and never match.
fn utc_text(expr: &str) -> String {
   format!("strftime('%Y-%m-%d %H:%M:%f', {expr})")
}

fn row_to_event(config: &TableConfig, watermark: OffsetDateTime, row: &SqliteRow) -> ChangeEvent {
   let mut record = Record::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      let value = match row.try_get_raw(i) {
         Ok(raw) => decode_column(raw),
         Err(_) => ColumnValue::Null,
      };
      record.insert(column.name().to_string(), value);
   }

   let created = record
      .get(&config.created_column)
      .and_then(|value| parse_timestamp(value, config.timestamp_encoding));
   let operation = match created {
      Some(created) if created > watermark => ChangeOperation::Insert,
      _ => ChangeOperation::Update,
   };
   let modified = record
      .get(&config.modified_column)
      .and_then(|value| parse_timestamp(value, config.timestamp_encoding));

   let event = ChangeEvent::new(config.name.clone(), operation, record);
   match modified {
      Some(modified) => event.with_source_commit_time(modified),
      None => event,
   }
}

/// Converts a SQLite value to a [`ColumnValue`] by its storage class.
fn decode_column(value: SqliteValueRef<'_>) -> ColumnValue {
   if value.is_null() {
      return ColumnValue::Null;
   }

   let owned = ValueRef::to_owned(&value);
   let decoded = match value.type_info().name() {
      "INTEGER" | "NUMERIC" | "BOOLEAN" => owned.try_decode::<i64>().map(ColumnValue::Integer),
      "REAL" => owned.try_decode::<f64>().map(ColumnValue::Real),
      "BLOB" => owned.try_decode::<Vec<u8>>().map(ColumnValue::Blob),
      // TEXT, DATE, TIME, DATETIME and unknown declared types
      _ => owned.try_decode::<String>().map(ColumnValue::Text),
   };
   decoded.unwrap_or(ColumnValue::Null)
}
