use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
   Insert,
   Update,
   Delete,
}

impl fmt::Display for ChangeOperation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         ChangeOperation::Insert => f.write_str("INSERT"),
         ChangeOperation::Update => f.write_str("UPDATE"),
         ChangeOperation::Delete => f.write_str("DELETE"),
      }
   }
}

/// Typed column value from SQLite.
///
/// Serializes to the closest JSON shape: integers and reals as numbers, text as
/// strings, blobs as base64-encoded strings.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl ColumnValue {
   /// Returns true if this value is null.
   pub fn is_null(&self) -> bool {
      matches!(self, ColumnValue::Null)
   }

   /// Attempts to get this value as an integer.
   pub fn as_integer(&self) -> Option<i64> {
      match self {
         ColumnValue::Integer(i) => Some(*i),
         _ => None,
      }
   }

   /// Attempts to get this value as a float.
   pub fn as_real(&self) -> Option<f64> {
      match self {
         ColumnValue::Real(r) => Some(*r),
         _ => None,
      }
   }

   /// Attempts to get this value as a string reference.
   pub fn as_text(&self) -> Option<&str> {
      match self {
         ColumnValue::Text(s) => Some(s),
         _ => None,
      }
   }

   /// Attempts to get this value as a blob reference.
   pub fn as_blob(&self) -> Option<&[u8]> {
      match self {
         ColumnValue::Blob(b) => Some(b),
         _ => None,
      }
   }
}

impl Serialize for ColumnValue {
   fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      match self {
         ColumnValue::Null => serializer.serialize_unit(),
         ColumnValue::Integer(i) => serializer.serialize_i64(*i),
         ColumnValue::Real(r) => serializer.serialize_f64(*r),
         ColumnValue::Text(s) => serializer.serialize_str(s),
         ColumnValue::Blob(b) => {
            use base64::Engine;
            serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
         }
      }
   }
}

/// A committed row change, as delivered by a transport.
///
/// Values are ordered by column index as defined in the table schema; `columns`
/// holds the matching column names. No validation has happened yet: consumers are
/// expected to check that the value vectors line up with `columns`.
#[derive(Debug, Clone)]
pub struct RawChange {
   pub table: String,
   pub operation: ChangeOperation,
   pub rowid: Option<i64>,
   pub columns: Arc<[String]>,
   /// Column values before the change (UPDATE and DELETE).
   pub old_values: Option<Vec<ColumnValue>>,
   /// Column values after the change (INSERT and UPDATE).
   pub new_values: Option<Vec<ColumnValue>>,
   /// Wall-clock time at which the owning transaction committed.
   pub committed_at: OffsetDateTime,
}

/// What a channel handler receives.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
   /// A committed change on the channel's table.
   Change(RawChange),
   /// The channel died after being established. No further events follow.
   Failed(String),
}

/// Opaque, connection-scoped handle for an open channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
   id: u64,
   table: String,
}

impl ChannelHandle {
   pub fn new(id: u64, table: impl Into<String>) -> Self {
      Self {
         id,
         table: table.into(),
      }
   }

   pub fn id(&self) -> u64 {
      self.id
   }

   pub fn table(&self) -> &str {
      &self.table
   }
}
