use serde::{Serialize, Serializer};

/// Result type alias for CDC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by a [`Sink`](crate::Sink).
pub type SinkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structured error response for status and health consumers.
#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

/// Error types for the CDC ingestion core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Control or query connection unusable.
   #[error(transparent)]
   Connection(#[from] sqlx_sqlite_cdc_conn::Error),

   /// Realtime transport failure outside a subscription, e.g. acquiring the observed writer.
   #[error(transparent)]
   Transport(#[from] sqlx_sqlite_cdc_transport::Error),

   /// A table's channel failed to open or died after being established.
   #[error("subscription for table '{table}' failed: {reason}")]
   Subscription { table: String, reason: String },

   /// A raw notification could not be turned into a change event.
   #[error("malformed change notification for table '{table}': {reason}")]
   Translation { table: String, reason: String },

   /// The sink rejected a batch. The batch has been requeued.
   #[error("delivery of batch {sequence} ({events} events) failed: {source}")]
   Delivery {
      sequence: u64,
      events: usize,
      #[source]
      source: SinkError,
   },

   /// `start()` failed; the controller is left `Errored`.
   #[error("startup failed: {0}")]
   Startup(#[source] Box<Error>),

   /// The final disconnect during `stop()` failed.
   #[error("shutdown failed: {0}")]
   Shutdown(#[source] Box<Error>),

   /// The requested operation is not legal in the current lifecycle state.
   #[error("invalid lifecycle state: expected {expected}, found {actual}")]
   InvalidState {
      expected: &'static str,
      actual: String,
   },

   /// Configuration rejected by validation.
   #[error("invalid configuration: {0}")]
   InvalidConfig(String),

   /// The table is not in the configured watch list.
   #[error("table '{0}' is not watched")]
   UnwatchedTable(String),

   /// Historical read failed.
   #[error("catch-up read for table '{table}' failed: {reason}")]
   CatchUp { table: String, reason: String },

   /// The operation was cancelled by `stop()`.
   #[error("operation cancelled by shutdown")]
   Cancelled,

   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Connection(_) => "CONNECTION_ERROR".to_string(),
         Error::Transport(_) => "TRANSPORT_ERROR".to_string(),
         Error::Subscription { .. } => "SUBSCRIPTION_ERROR".to_string(),
         Error::Translation { .. } => "TRANSLATION_ERROR".to_string(),
         Error::Delivery { .. } => "DELIVERY_ERROR".to_string(),
         Error::Startup(_) => "STARTUP_ERROR".to_string(),
         Error::Shutdown(_) => "SHUTDOWN_ERROR".to_string(),
         Error::InvalidState { .. } => "INVALID_STATE".to_string(),
         Error::InvalidConfig(_) => "INVALID_CONFIG".to_string(),
         Error::UnwatchedTable(_) => "UNWATCHED_TABLE".to_string(),
         Error::CatchUp { .. } => "CATCH_UP_ERROR".to_string(),
         Error::Cancelled => "CANCELLED".to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
      }
   }

   pub(crate) fn subscription(table: &str, reason: impl ToString) -> Self {
      Error::Subscription {
         table: table.to_string(),
         reason: reason.to_string(),
      }
   }
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let response = ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      };
      response.serialize(serializer)
   }
}
