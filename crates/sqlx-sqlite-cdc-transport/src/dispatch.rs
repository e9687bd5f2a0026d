//! Transaction-aware dispatch of hook events to channel handlers.
//!
//! Changes captured by the preupdate hook are buffered until the transaction
//! (explicit or implicit) completes. On commit they are routed to the handler of
//! the channel open for their table; on rollback they are discarded.
//!
//! ```text
//! preupdate_hook ──► pending (Vec<PendingChange>)
//!                          │
//!               ┌──────────┴──────────┐
//!            COMMIT               ROLLBACK
//!               │                     │
//!   route by table, check schema   clear()
//!               │
//!        handler(ChannelEvent)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, trace, warn};

use crate::change::{ChangeOperation, ChannelEvent, ChannelHandle, ColumnValue, RawChange};
use crate::error::Error;
use crate::transport::ChangeHandler;

/// Raw change captured by the preupdate hook before the commit decision.
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
   pub table: String,
   pub operation: ChangeOperation,
   pub old_rowid: i64,
   pub new_rowid: i64,
   pub old_values: Option<Vec<ColumnValue>>,
   pub new_values: Option<Vec<ColumnValue>>,
}

struct Route {
   channel_id: u64,
   columns: Arc<[String]>,
   handler: ChangeHandler,
}

/// Buffers hook events per transaction and routes committed changes to channels.
///
/// One dispatcher is shared by every connection the hooks are registered on.
pub struct HookDispatcher {
   pending: Mutex<Vec<PendingChange>>,
   routes: RwLock<HashMap<String, Route>>,
   next_channel_id: AtomicU64,
}

impl HookDispatcher {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         pending: Mutex::new(Vec::new()),
         routes: RwLock::new(HashMap::new()),
         next_channel_id: AtomicU64::new(1),
      })
   }

   /// Checks if a channel is open for a table.
   pub fn is_routed(&self, table: &str) -> bool {
      self.routes.read().contains_key(table)
   }

   /// Returns the tables that currently have an open channel.
   pub fn routed_tables(&self) -> Vec<String> {
      self.routes.read().keys().cloned().collect()
   }

   /// Opens a channel for `table`, delivering to `handler`.
   ///
   /// `columns` is the table's column list at open time; changes whose value count
   /// no longer matches it fail the channel.
   pub(crate) fn route(
      &self,
      table: &str,
      columns: Vec<String>,
      handler: ChangeHandler,
   ) -> crate::Result<ChannelHandle> {
      let mut routes = self.routes.write();
      if routes.contains_key(table) {
         return Err(Error::ChannelAlreadyOpen(table.to_string()));
      }

      let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
      trace!(table = %table, channel_id, columns = columns.len(), "Routing table");
      routes.insert(
         table.to_string(),
         Route {
            channel_id,
            columns: columns.into(),
            handler,
         },
      );

      Ok(ChannelHandle::new(channel_id, table))
   }

   /// Closes the channel identified by `handle`.
   ///
   /// Returns false if the channel was already gone (closed, failed, or replaced).
   pub(crate) fn unroute(&self, handle: &ChannelHandle) -> bool {
      let mut routes = self.routes.write();
      match routes.get(handle.table()) {
         Some(route) if route.channel_id == handle.id() => {
            routes.remove(handle.table());
            trace!(table = %handle.table(), channel_id = handle.id(), "Unrouted table");
            true
         }
         _ => false,
      }
   }

   /// Called by preupdate_hook - buffers the change until commit or rollback.
   pub(crate) fn on_preupdate(&self, change: PendingChange) {
      trace!(
         table = %change.table,
         operation = ?change.operation,
         "Buffering preupdate change"
      );
      self.pending.lock().push(change);
   }

   /// Called by commit_hook - routes buffered changes to their channel handlers.
   ///
   /// Handlers run after every lock is released, so a handler may safely call back
   /// into the dispatcher.
   pub(crate) fn on_commit(&self) {
      let changes = std::mem::take(&mut *self.pending.lock());

      if changes.is_empty() {
         return;
      }

      debug!(count = changes.len(), "Dispatching buffered changes on commit");

      let committed_at = OffsetDateTime::now_utc();
      let mut deliveries: Vec<(ChangeHandler, ChannelEvent)> = Vec::with_capacity(changes.len());

      for change in changes {
         let Some((handler, columns)) = self
            .routes
            .read()
            .get(&change.table)
            .map(|route| (Arc::clone(&route.handler), Arc::clone(&route.columns)))
         else {
            // Channel closed between preupdate and commit
            continue;
         };

         let image_len = change
            .new_values
            .as_ref()
            .or(change.old_values.as_ref())
            .map(Vec::len)
            .unwrap_or(0);

         if image_len != columns.len() {
            let reason = format!(
               "schema of table '{}' changed: expected {} columns, got {}",
               change.table,
               columns.len(),
               image_len
            );
            warn!(table = %change.table, reason = %reason, "Failing channel");
            self.routes.write().remove(&change.table);
            deliveries.push((handler, ChannelEvent::Failed(reason)));
            continue;
         }

         let rowid = match change.operation {
            ChangeOperation::Insert | ChangeOperation::Update => change.new_rowid,
            ChangeOperation::Delete => change.old_rowid,
         };

         deliveries.push((
            handler,
            ChannelEvent::Change(RawChange {
               table: change.table,
               operation: change.operation,
               rowid: Some(rowid),
               columns,
               old_values: change.old_values,
               new_values: change.new_values,
               committed_at,
            }),
         ));
      }

      for (handler, event) in deliveries {
         handler(event);
      }
   }

   /// Called by rollback_hook - discards all buffered changes.
   pub(crate) fn on_rollback(&self) {
      let count = {
         let mut pending = self.pending.lock();
         let count = pending.len();
         pending.clear();
         count
      };

      if count > 0 {
         debug!(count, "Discarding buffered changes on rollback");
      }
   }
}

impl std::fmt::Debug for HookDispatcher {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("HookDispatcher")
         .field("pending", &self.pending.lock().len())
         .field("routes", &self.routes.read().len())
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn recording_handler() -> (ChangeHandler, Arc<Mutex<Vec<ChannelEvent>>>) {
      let seen = Arc::new(Mutex::new(Vec::new()));
      let sink = Arc::clone(&seen);
      let handler: ChangeHandler = Arc::new(move |event| sink.lock().push(event));
      (handler, seen)
   }

   fn insert(table: &str, values: Vec<ColumnValue>) -> PendingChange {
      PendingChange {
         table: table.to_string(),
         operation: ChangeOperation::Insert,
         old_rowid: 0,
         new_rowid: 1,
         old_values: None,
         new_values: Some(values),
      }
   }

   fn columns() -> Vec<String> {
      vec!["id".to_string(), "name".to_string()]
   }

   #[test]
   fn test_commit_routes_to_handler() {
      let dispatcher = HookDispatcher::new();
      let (handler, seen) = recording_handler();
      dispatcher.route("users", columns(), handler).unwrap();

      dispatcher.on_preupdate(insert(
         "users",
         vec![ColumnValue::Integer(1), ColumnValue::Text("Alice".into())],
      ));
      assert!(seen.lock().is_empty(), "nothing is published before commit");

      dispatcher.on_commit();

      let seen = seen.lock();
      assert_eq!(seen.len(), 1);
      match &seen[0] {
         ChannelEvent::Change(change) => {
            assert_eq!(change.table, "users");
            assert_eq!(change.rowid, Some(1));
            assert_eq!(&*change.columns, &["id".to_string(), "name".to_string()]);
         }
         other => panic!("unexpected event {other:?}"),
      }
   }

   #[test]
   fn test_rollback_discards() {
      let dispatcher = HookDispatcher::new();
      let (handler, seen) = recording_handler();
      dispatcher.route("users", columns(), handler).unwrap();

      dispatcher.on_preupdate(insert(
         "users",
         vec![ColumnValue::Integer(1), ColumnValue::Null],
      ));
      dispatcher.on_rollback();
      dispatcher.on_commit();

      assert!(seen.lock().is_empty());
   }

   #[test]
   fn test_duplicate_route_rejected() {
      let dispatcher = HookDispatcher::new();
      let (handler, _) = recording_handler();
      dispatcher.route("users", columns(), Arc::clone(&handler)).unwrap();

      let err = dispatcher.route("users", columns(), handler).unwrap_err();
      assert!(matches!(err, Error::ChannelAlreadyOpen(t) if t == "users"));
   }

   #[test]
   fn test_stale_handle_does_not_unroute_new_channel() {
      let dispatcher = HookDispatcher::new();
      let (handler, _) = recording_handler();
      let first = dispatcher.route("users", columns(), Arc::clone(&handler)).unwrap();
      assert!(dispatcher.unroute(&first));
      let second = dispatcher.route("users", columns(), handler).unwrap();

      assert!(!dispatcher.unroute(&first));
      assert!(dispatcher.is_routed("users"));
      assert!(dispatcher.unroute(&second));
      assert!(!dispatcher.is_routed("users"));
   }

   #[test]
   fn test_schema_drift_fails_channel() {
      let dispatcher = HookDispatcher::new();
      let (handler, seen) = recording_handler();
      dispatcher.route("users", columns(), handler).unwrap();

      dispatcher.on_preupdate(insert(
         "users",
         vec![
            ColumnValue::Integer(1),
            ColumnValue::Null,
            ColumnValue::Text("extra".into()),
         ],
      ));
      dispatcher.on_commit();

      assert!(matches!(seen.lock()[0], ChannelEvent::Failed(_)));
      assert!(!dispatcher.is_routed("users"));
   }
}
