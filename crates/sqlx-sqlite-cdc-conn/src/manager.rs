//! Control connection and query pool lifecycle

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::SqliteDatabaseConfig;
use crate::error::{ConnectionRole, Error};

/// Observable connection state.
///
/// The lifecycle layer reads this to decide whether a restart is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
   Disconnected,
   Connected,
   /// The last `connect()` failed; holds the reason.
   Failed(String),
}

struct Pools {
   query: Pool<Sqlite>,
   control: Pool<Sqlite>,
}

/// Manages the control connection and the read-only query pool for one SQLite database.
///
/// Nothing is opened until [`connect`](Self::connect) is called. Both connections are
/// validated with a trivial round-trip query before the manager reports itself connected.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_cdc_conn::ConnectionManager;
///
/// # async fn example() -> Result<(), sqlx_sqlite_cdc_conn::Error> {
/// let manager = ConnectionManager::new("test.db", None)?;
/// manager.connect().await?;
///
/// let mut control = manager.acquire_control().await?;
/// sqlx::query("INSERT INTO users (name) VALUES (?)")
///     .bind("Alice")
///     .execute(&mut *control)
///     .await?;
/// drop(control);
///
/// manager.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
   path: PathBuf,
   config: SqliteDatabaseConfig,
   pools: RwLock<Option<Pools>>,
   state: RwLock<ConnectionState>,
   /// Serialises connect/disconnect so they never interleave
   transition: Mutex<()>,
   /// Tracks if WAL mode has been initialized (set on first control checkout)
   wal_initialized: AtomicBool,
}

impl ConnectionManager {
   /// Creates a manager for the database at `path`.
   ///
   /// Pass `None` for `custom_config` to use the defaults (6 read connections, 30 second
   /// idle timeout). In-memory databases are rejected because the query pool and the
   /// control connection would each see a different database.
   pub fn new(path: impl AsRef<Path>, custom_config: Option<SqliteDatabaseConfig>) -> Result<Self> {
      let path = path.as_ref();

      if path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Database path cannot be empty",
         )));
      }

      if is_memory_database(path) {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "In-memory databases cannot be shared between the control connection and query pool",
         )));
      }

      Ok(Self {
         path: path.to_path_buf(),
         config: custom_config.unwrap_or_default(),
         pools: RwLock::new(None),
         state: RwLock::new(ConnectionState::Disconnected),
         transition: Mutex::new(()),
         wal_initialized: AtomicBool::new(false),
      })
   }

   /// Opens and validates both the query pool and the control connection.
   ///
   /// Calling this while already connected is a no-op. If either connection cannot be
   /// opened or fails its `SELECT 1` round-trip, anything opened so far is closed again,
   /// the state becomes [`ConnectionState::Failed`], and the error names the failing role.
   pub async fn connect(&self) -> Result<()> {
      let _transition = self.transition.lock().await;

      if self.pools.read().is_some() {
         debug!(path = %self.path.display(), "Already connected");
         return Ok(());
      }

      match self.open_pools().await {
         Ok(pools) => {
            *self.pools.write() = Some(pools);
            *self.state.write() = ConnectionState::Connected;
            info!(path = %self.path.display(), "Connected");
            Ok(())
         }
         Err(e) => {
            warn!(path = %self.path.display(), error = %e, "Connect failed");
            *self.state.write() = ConnectionState::Failed(e.to_string());
            Err(e)
         }
      }
   }

   async fn open_pools(&self) -> Result<Pools> {
      // The query pool is read-only and cannot create the file, so make sure it exists
      // before opening it.
      if !self.path.exists() {
         let conn = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .read_only(false)
            .connect()
            .await?;
         drop(conn);
      }

      let query_options = SqliteConnectOptions::new()
         .filename(&self.path)
         .read_only(true);

      let query = SqlitePoolOptions::new()
         .max_connections(self.config.max_read_connections)
         .min_connections(0)
         .idle_timeout(Some(self.config.idle_timeout()))
         .connect_with(query_options)
         .await
         .map_err(|source| Error::Validation {
            role: ConnectionRole::Query,
            source,
         })?;

      if let Err(source) = validate(&query).await {
         query.close().await;
         return Err(Error::Validation {
            role: ConnectionRole::Query,
            source,
         });
      }

      let control_options = SqliteConnectOptions::new()
         .filename(&self.path)
         .read_only(false);

      let control = match SqlitePoolOptions::new()
         .max_connections(1)
         .min_connections(0)
         .idle_timeout(Some(self.config.idle_timeout()))
         .connect_with(control_options)
         .await
      {
         Ok(pool) => pool,
         Err(source) => {
            query.close().await;
            return Err(Error::Validation {
               role: ConnectionRole::Control,
               source,
            });
         }
      };

      if let Err(source) = validate(&control).await {
         control.close().await;
         query.close().await;
         return Err(Error::Validation {
            role: ConnectionRole::Control,
            source,
         });
      }

      Ok(Pools { query, control })
   }

   /// Closes both connections.
   ///
   /// Safe to call when never connected or after a partially failed `connect()`. The pools
   /// are always closed; an error is returned only if the final WAL checkpoint fails.
   /// Waits for every checked-out connection to be returned.
   pub async fn disconnect(&self) -> Result<()> {
      self.close(None).await
   }

   /// Like [`disconnect`](Self::disconnect), but stops waiting for checked-out
   /// connections after `limit`.
   ///
   /// On timeout the manager is already disconnected: no new connection can be checked
   /// out, and the pools finish closing in the background once the outstanding
   /// connections are returned. Returns [`Error::CloseTimeout`].
   pub async fn disconnect_within(&self, limit: Duration) -> Result<()> {
      self.close(Some(limit)).await
   }

   async fn close(&self, limit: Option<Duration>) -> Result<()> {
      let _transition = self.transition.lock().await;

      let pools = self.pools.write().take();
      let mut result = Ok(());

      if let Some(pools) = pools {
         result = match limit {
            None => self.close_pools(&pools).await,
            Some(limit) => {
               let closed = timeout(limit, self.close_pools(&pools)).await;
               match closed {
                  Ok(closed) => closed,
                  Err(_) => {
                     warn!(
                        path = %self.path.display(),
                        limit_ms = limit.as_millis() as u64,
                        "Connections still checked out, closing in background"
                     );
                     tokio::spawn(async move {
                        pools.query.close().await;
                        pools.control.close().await;
                     });
                     Err(Error::CloseTimeout(limit))
                  }
               }
            }
         };
         info!(path = %self.path.display(), "Disconnected");
      }

      self.wal_initialized.store(false, Ordering::SeqCst);
      *self.state.write() = ConnectionState::Disconnected;
      result
   }

   async fn close_pools(&self, pools: &Pools) -> Result<()> {
      let mut result = Ok(());

      // This will await all readers to be returned
      pools.query.close().await;

      // Checkpoint WAL before closing the control connection to flush changes and
      // truncate the WAL file. Only attempted if the control connection was used.
      if self.wal_initialized.load(Ordering::SeqCst)
         && let Ok(mut conn) = pools.control.acquire().await
         && let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut *conn)
            .await
      {
         warn!(error = %e, "WAL checkpoint failed during disconnect");
         result = Err(Error::Sqlx(e));
      }

      pools.control.close().await;
      result
   }

   /// Returns the current connection state.
   pub fn state(&self) -> ConnectionState {
      self.state.read().clone()
   }

   /// Returns true if both connections are open.
   pub fn is_connected(&self) -> bool {
      self.pools.read().is_some()
   }

   /// Returns a handle to the read-only query pool.
   ///
   /// The pool handle is cheap to clone; connections are checked out per query and
   /// returned to the pool on every exit path.
   pub fn query_pool(&self) -> Result<Pool<Sqlite>> {
      self
         .pools
         .read()
         .as_ref()
         .map(|pools| pools.query.clone())
         .ok_or(Error::NotConnected)
   }

   /// Checks out the control connection.
   ///
   /// Only one control connection exists, so this waits until any previous checkout is
   /// returned. On the first checkout WAL mode is enabled.
   pub async fn acquire_control(&self) -> Result<PoolConnection<Sqlite>> {
      let control = self
         .pools
         .read()
         .as_ref()
         .map(|pools| pools.control.clone())
         .ok_or(Error::NotConnected)?;

      let mut conn = control.acquire().await?;

      if !self.wal_initialized.load(Ordering::SeqCst) {
         sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;

         // https://www.sqlite.org/wal.html#performance_considerations
         sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&mut *conn)
            .await?;

         self.wal_initialized.store(true, Ordering::SeqCst);
      }

      Ok(conn)
   }

   /// Runs a connectivity check against the query pool.
   pub async fn ping(&self) -> Result<()> {
      let query = self.query_pool()?;
      validate(&query).await.map_err(|source| Error::Validation {
         role: ConnectionRole::Query,
         source,
      })
   }

   /// Path of the managed database file.
   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Pool configuration in use.
   pub fn config(&self) -> &SqliteDatabaseConfig {
      &self.config
   }
}

impl std::fmt::Debug for ConnectionManager {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConnectionManager")
         .field("path", &self.path)
         .field("state", &*self.state.read())
         .finish()
   }
}

async fn validate(pool: &Pool<Sqlite>) -> std::result::Result<(), sqlx::Error> {
   let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
   if one != 1 {
      return Err(sqlx::Error::Protocol(format!(
         "validation query returned {one}"
      )));
   }
   Ok(())
}

fn is_memory_database(path: &Path) -> bool {
   let path = path.to_string_lossy();
   path == ":memory:" || path.starts_with("file::memory:") || path.contains("mode=memory")
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_rejects_empty_path() {
      let result = ConnectionManager::new("", None);
      assert!(matches!(result, Err(Error::Io(_))));
   }

   #[test]
   fn test_rejects_memory_database() {
      assert!(ConnectionManager::new(":memory:", None).is_err());
      assert!(ConnectionManager::new("file::memory:?cache=shared", None).is_err());
   }

   #[test]
   fn test_starts_disconnected() {
      let manager = ConnectionManager::new("never_opened.db", None).unwrap();
      assert_eq!(manager.state(), ConnectionState::Disconnected);
      assert!(!manager.is_connected());
      assert!(matches!(manager.query_pool(), Err(Error::NotConnected)));
   }
}
