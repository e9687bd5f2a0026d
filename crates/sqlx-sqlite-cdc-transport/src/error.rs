//! Error types for the sqlx-sqlite-cdc-transport crate.

/// Errors that can occur while opening channels or registering hooks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Failed to register SQLite hooks.
   #[error("Hook registration failed: {0}")]
   HookRegistration(String),

   /// Low-level database failure outside of sqlx's own error type.
   #[error("Database error: {0}")]
   Database(String),

   /// Error from sqlx while resolving table schema.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// The connection manager could not provide a connection.
   #[error(transparent)]
   Connection(#[from] sqlx_sqlite_cdc_conn::Error),

   /// The table does not exist (no columns could be resolved).
   #[error("Table not found: {0}")]
   TableNotFound(String),

   /// A channel is already open for the table.
   #[error("Channel already open for table: {0}")]
   ChannelAlreadyOpen(String),
}
