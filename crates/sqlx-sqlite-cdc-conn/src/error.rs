//! Error types for sqlx-sqlite-cdc-conn

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which of the two managed connections an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
   /// The single read-write connection that carries realtime change hooks
   Control,
   /// The read-only pool used for historical reads and connectivity checks
   Query,
}

impl fmt::Display for ConnectionRole {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         ConnectionRole::Control => f.write_str("control"),
         ConnectionRole::Query => f.write_str("query"),
      }
   }
}

/// Errors that may occur while managing CDC connections
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// A connection could be opened but failed its validation round-trip
   #[error("{role} connection failed validation: {source}")]
   Validation {
      role: ConnectionRole,
      #[source]
      source: sqlx::Error,
   },

   /// A bounded disconnect gave up waiting for checked-out connections
   #[error("Connections not returned within {0:?}")]
   CloseTimeout(Duration),

   /// The manager is not connected (never connected, or disconnected)
   #[error("Not connected")]
   NotConnected,
}
