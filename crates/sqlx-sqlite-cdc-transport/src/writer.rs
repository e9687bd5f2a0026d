//! Control-connection writer with change hooks registered.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use libsqlite3_sys::sqlite3;
use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use tracing::trace;

use crate::Result;
use crate::dispatch::HookDispatcher;
use crate::hooks;

/// Exclusive writer on the control connection whose changes are captured.
///
/// Every INSERT, UPDATE and DELETE executed through this writer on a table with an
/// open channel is delivered to that channel once its transaction commits. Hooks
/// are removed when the writer is dropped and the connection returns to the pool.
///
/// Derefs to `SqliteConnection`, so it can be passed to sqlx queries as `&mut *writer`.
pub struct ObservedWriter {
   conn: PoolConnection<Sqlite>,
   /// Raw sqlite3 pointer cached at registration so Drop can unregister
   /// synchronously without the async lock_handle.
   raw_db: *mut sqlite3,
}

// SAFETY: raw_db is only used for hook unregistration by the single owner of this
// writer. The underlying connection is already Send via sqlx's PoolConnection.
unsafe impl Send for ObservedWriter {}

impl ObservedWriter {
   pub(crate) async fn register(
      mut conn: PoolConnection<Sqlite>,
      dispatcher: Arc<HookDispatcher>,
   ) -> Result<Self> {
      let mut handle = conn
         .lock_handle()
         .await
         .map_err(|e| crate::Error::Database(format!("Failed to lock connection handle: {}", e)))?;

      let db: *mut sqlite3 = handle.as_raw_handle().as_ptr();

      // SAFETY: db stays valid for as long as we own `conn`; unregistered in Drop.
      unsafe {
         hooks::register_hooks(db, dispatcher)?;
      }
      drop(handle);

      Ok(Self { conn, raw_db: db })
   }
}

impl Drop for ObservedWriter {
   fn drop(&mut self) {
      // SAFETY: raw_db was obtained in register and is still valid because we still
      // own the PoolConnection; no statement can be running on it now.
      unsafe {
         hooks::unregister_hooks(self.raw_db);
      }
      trace!("ObservedWriter dropped, hooks unregistered");
   }
}

impl Deref for ObservedWriter {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &*self.conn
   }
}

impl DerefMut for ObservedWriter {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut *self.conn
   }
}
