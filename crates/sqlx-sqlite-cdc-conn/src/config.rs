//! Configuration for the CDC connection pools

use serde::{Deserialize, Serialize};

/// Pool settings used by [`ConnectionManager`](crate::ConnectionManager)
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_cdc_conn::SqliteDatabaseConfig;
///
/// // Override just one field
/// let config = SqliteDatabaseConfig {
///     max_read_connections: 3,
///     ..Default::default()
/// };
/// assert_eq!(config.idle_timeout_secs, 30);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteDatabaseConfig {
   /// Maximum number of connections in the read-only query pool
   ///
   /// The query pool is shared between catch-up reads and connectivity checks.
   ///
   /// Default: 6
   pub max_read_connections: u32,

   /// Idle timeout for both the query pool and the control connection (in seconds)
   ///
   /// Default: 30
   pub idle_timeout_secs: u64,
}

impl Default for SqliteDatabaseConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         idle_timeout_secs: 30,
      }
   }
}

impl SqliteDatabaseConfig {
   pub(crate) fn idle_timeout(&self) -> std::time::Duration {
      std::time::Duration::from_secs(self.idle_timeout_secs)
   }
}
