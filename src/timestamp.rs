//! Conversions between column values and timestamps.

use sqlx_sqlite_cdc_transport::ColumnValue;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::config::TimestampEncoding;

const SQLITE_DATETIME: &[BorrowedFormatItem<'static>] =
   format_description!("[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]");

const SQLITE_DATETIME_MILLIS: &[BorrowedFormatItem<'static>] =
   format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");

/// A timestamp in the shape a table stores it, ready to bind to a query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StoredTimestamp {
   Integer(i64),
   Text(String),
}

/// Reads a timestamp out of a column value. Returns `None` if it does not parse.
pub(crate) fn parse_timestamp(
   value: &ColumnValue,
   encoding: TimestampEncoding,
) -> Option<OffsetDateTime> {
   match (encoding, value) {
      (TimestampEncoding::Text, ColumnValue::Text(text)) => parse_text(text),
      (TimestampEncoding::UnixMillis, ColumnValue::Integer(millis)) => from_millis(*millis),
      (TimestampEncoding::UnixMillis, ColumnValue::Text(text)) => {
         text.trim().parse().ok().and_then(from_millis)
      }
      (TimestampEncoding::UnixSeconds, ColumnValue::Integer(secs)) => {
         OffsetDateTime::from_unix_timestamp(*secs).ok()
      }
      (TimestampEncoding::UnixSeconds, ColumnValue::Text(text)) => text
         .trim()
         .parse()
         .ok()
         .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok()),
      _ => None,
   }
}

/// Encodes a timestamp the way a table with `encoding` stores it.
///
/// Text timestamps are rendered in UTC with millisecond precision so that they
/// compare lexicographically against `CURRENT_TIMESTAMP` values.
pub(crate) fn encode_timestamp(
   value: OffsetDateTime,
   encoding: TimestampEncoding,
) -> StoredTimestamp {
   match encoding {
      TimestampEncoding::Text => {
         let utc = value.to_offset(UtcOffset::UTC);
         // Formatting a UTC datetime with a fixed description cannot fail for in-range years
         let text = utc
            .format(SQLITE_DATETIME_MILLIS)
            .unwrap_or_else(|_| utc.to_string());
         StoredTimestamp::Text(text)
      }
      TimestampEncoding::UnixMillis => {
         StoredTimestamp::Integer((value.unix_timestamp_nanos() / 1_000_000) as i64)
      }
      TimestampEncoding::UnixSeconds => StoredTimestamp::Integer(value.unix_timestamp()),
   }
}

fn parse_text(text: &str) -> Option<OffsetDateTime> {
   let text = text.trim();
   if let Ok(parsed) = OffsetDateTime::parse(text, &Rfc3339) {
      return Some(parsed);
   }
   let normalized = text.replacen('T', " ", 1);
   PrimitiveDateTime::parse(&normalized, SQLITE_DATETIME)
      .ok()
      .map(PrimitiveDateTime::assume_utc)
}

fn from_millis(millis: i64) -> Option<OffsetDateTime> {
   OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()
}
