//! [`ChangeTransport`] implementation over SQLite's native hooks.

use std::sync::Arc;

use sqlx_sqlite_cdc_conn::ConnectionManager;
use tracing::debug;

use crate::Result;
use crate::change::ChannelHandle;
use crate::dispatch::HookDispatcher;
use crate::error::Error;
use crate::schema::table_columns;
use crate::transport::{ChangeHandler, ChangeTransport};
use crate::writer::ObservedWriter;

/// Realtime transport backed by SQLite's preupdate/commit/rollback hooks.
///
/// Channels are opened per table; the table's column names are resolved from the
/// schema at open time. Writes must go through [`acquire_writer`](Self::acquire_writer)
/// to be observed.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use sqlx_sqlite_cdc_conn::ConnectionManager;
/// use sqlx_sqlite_cdc_transport::{ChangeTransport, ChannelEvent, HookTransport};
///
/// # async fn example() -> Result<(), sqlx_sqlite_cdc_transport::Error> {
/// let manager = Arc::new(ConnectionManager::new("app.db", None)?);
/// manager.connect().await?;
///
/// let transport = HookTransport::new(Arc::clone(&manager));
/// let channel = transport
///     .open_channel("users", Arc::new(|event: ChannelEvent| println!("{event:?}")))
///     .await?;
///
/// let mut writer = transport.acquire_writer().await?;
/// sqlx::query("INSERT INTO users (name) VALUES ('Alice')")
///     .execute(&mut *writer)
///     .await?;
///
/// transport.close_channel(&channel)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HookTransport {
   connections: Arc<ConnectionManager>,
   dispatcher: Arc<HookDispatcher>,
}

impl HookTransport {
   pub fn new(connections: Arc<ConnectionManager>) -> Self {
      Self {
         connections,
         dispatcher: HookDispatcher::new(),
      }
   }

   /// Checks out the control connection with change hooks registered.
   pub async fn acquire_writer(&self) -> Result<ObservedWriter> {
      let conn = self.connections.acquire_control().await?;
      let writer = ObservedWriter::register(conn, Arc::clone(&self.dispatcher)).await?;
      debug!("Acquired observed writer");
      Ok(writer)
   }

   /// Returns the tables that currently have an open channel.
   pub fn routed_tables(&self) -> Vec<String> {
      self.dispatcher.routed_tables()
   }

   pub fn connections(&self) -> &Arc<ConnectionManager> {
      &self.connections
   }
}

impl ChangeTransport for HookTransport {
   async fn open_channel(&self, table: &str, handler: ChangeHandler) -> Result<ChannelHandle> {
      let pool = self.connections.query_pool()?;
      let columns = table_columns(&pool, table).await?;

      if columns.is_empty() {
         return Err(Error::TableNotFound(table.to_string()));
      }

      debug!(table = %table, columns = ?columns, "Opening channel");
      self.dispatcher.route(table, columns, handler)
   }

   fn close_channel(&self, handle: &ChannelHandle) -> Result<()> {
      if !self.dispatcher.unroute(handle) {
         debug!(table = %handle.table(), "Channel already closed");
      }
      Ok(())
   }
}
