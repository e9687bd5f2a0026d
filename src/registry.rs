//! One live subscription per watched table, and translation of raw transport
//! notifications into [`ChangeEvent`]s.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use sqlx_sqlite_cdc_transport::{
   ChangeHandler, ChangeOperation, ChangeTransport, ChannelEvent, ChannelHandle, ColumnValue,
   RawChange,
};
use time::OffsetDateTime;
use tracing::{debug, info, trace, warn};

use crate::accumulator::BatchAccumulator;
use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::event::{ChangeEvent, Record};
use crate::timestamp::parse_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionStatus {
   /// Channel is being opened.
   Pending,
   Active,
   /// Channel died after being established. Not retried automatically.
   Errored,
   Closed,
}

impl SubscriptionStatus {
   fn is_live(self) -> bool {
      matches!(self, SubscriptionStatus::Pending | SubscriptionStatus::Active)
   }
}

impl fmt::Display for SubscriptionStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         SubscriptionStatus::Pending => f.write_str("pending"),
         SubscriptionStatus::Active => f.write_str("active"),
         SubscriptionStatus::Errored => f.write_str("errored"),
         SubscriptionStatus::Closed => f.write_str("closed"),
      }
   }
}

/// A table's subscription as tracked by the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
   pub table: String,
   pub status: SubscriptionStatus,
   #[serde(skip)]
   pub channel: Option<ChannelHandle>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub last_error: Option<String>,
}

impl Subscription {
   fn pending(table: &str) -> Self {
      Self {
         table: table.to_string(),
         status: SubscriptionStatus::Pending,
         channel: None,
         last_error: None,
      }
   }
}

struct RegistryInner {
   tables: HashMap<String, TableConfig>,
   accumulator: Arc<BatchAccumulator>,
   subscriptions: RwLock<HashMap<String, Subscription>>,
}

/// Tracks one subscription per watched table on a [`ChangeTransport`].
///
/// Every change the transport reports on an open channel is translated and
/// pushed into the accumulator from the transport's own calling context.
pub struct SubscriptionRegistry<T> {
   transport: Arc<T>,
   inner: Arc<RegistryInner>,
}

impl<T: ChangeTransport> SubscriptionRegistry<T> {
   pub fn new(
      transport: Arc<T>,
      tables: impl IntoIterator<Item = TableConfig>,
      accumulator: Arc<BatchAccumulator>,
   ) -> Self {
      let tables = tables
         .into_iter()
         .map(|table| (table.name.clone(), table))
         .collect();
      Self {
         transport,
         inner: Arc::new(RegistryInner {
            tables,
            accumulator,
            subscriptions: RwLock::new(HashMap::new()),
         }),
      }
   }

   pub fn transport(&self) -> &Arc<T> {
      &self.transport
   }

   /// Opens a channel for `table` and starts feeding its changes to the accumulator.
   ///
   /// Fails if the table is not watched, if a live subscription for it already
   /// exists, or if the transport cannot open the channel. An `Errored` or
   /// `Closed` subscription may be subscribed again.
   pub async fn subscribe(&self, table: &str) -> Result<()> {
      if !self.inner.tables.contains_key(table) {
         return Err(Error::UnwatchedTable(table.to_string()));
      }

      let stale = {
         let mut subs = self.inner.subscriptions.write();
         if let Some(existing) = subs.get(table)
            && existing.status.is_live()
         {
            return Err(Error::subscription(
               table,
               format!("already subscribed ({})", existing.status),
            ));
         }
         subs
            .insert(table.to_string(), Subscription::pending(table))
            .and_then(|previous| previous.channel)
      };

      // An errored subscription may still hold its channel
      if let Some(handle) = stale
         && let Err(e) = self.transport.close_channel(&handle)
      {
         debug!(table = %table, error = %e, "Failed to close stale channel");
      }

      let handler = self.handler(table);
      let handle = match self.transport.open_channel(table, handler).await {
         Ok(handle) => handle,
         Err(e) => {
            self.inner.subscriptions.write().remove(table);
            warn!(table = %table, error = %e, "Failed to open channel");
            return Err(Error::subscription(table, e));
         }
      };

      let activated = {
         let mut subs = self.inner.subscriptions.write();
         match subs.get_mut(table) {
            Some(sub) if sub.status == SubscriptionStatus::Pending => {
               sub.status = SubscriptionStatus::Active;
               sub.channel = Some(handle.clone());
               true
            }
            _ => false,
         }
      };

      if !activated {
         let _ = self.transport.close_channel(&handle);
         return Err(Error::subscription(table, "channel closed while opening"));
      }

      info!(table = %table, channel = handle.id(), "Subscribed");
      Ok(())
   }

   /// Releases the channel for `table`. No-op if the table is not subscribed.
   ///
   /// The subscription is marked `Closed` even if the transport fails to close
   /// the channel; the failure is returned for logging.
   pub fn unsubscribe(&self, table: &str) -> Result<()> {
      let channel = {
         let mut subs = self.inner.subscriptions.write();
         match subs.get_mut(table) {
            Some(sub) if sub.status != SubscriptionStatus::Closed => {
               sub.status = SubscriptionStatus::Closed;
               sub.channel.take()
            }
            _ => return Ok(()),
         }
      };

      debug!(table = %table, "Unsubscribed");
      match channel {
         Some(handle) => self
            .transport
            .close_channel(&handle)
            .map_err(|e| Error::subscription(table, e)),
         None => Ok(()),
      }
   }

   /// Unsubscribes every table, best-effort. Returns the failures.
   pub fn unsubscribe_all(&self) -> Vec<Error> {
      let tables: Vec<String> = self.inner.subscriptions.read().keys().cloned().collect();
      let mut failures = Vec::new();
      for table in tables {
         if let Err(e) = self.unsubscribe(&table) {
            warn!(table = %table, error = %e, "Unsubscribe failed");
            failures.push(e);
         }
      }
      failures
   }

   /// Tables with an `Active` subscription, sorted.
   pub fn subscribed_tables(&self) -> Vec<String> {
      let mut tables: Vec<String> = self
         .inner
         .subscriptions
         .read()
         .values()
         .filter(|sub| sub.status == SubscriptionStatus::Active)
         .map(|sub| sub.table.clone())
         .collect();
      tables.sort();
      tables
   }

   pub fn status(&self, table: &str) -> Option<SubscriptionStatus> {
      self.inner.subscriptions.read().get(table).map(|sub| sub.status)
   }

   /// Snapshot of every tracked subscription.
   pub fn subscriptions(&self) -> Vec<Subscription> {
      let mut subs: Vec<Subscription> = self.inner.subscriptions.read().values().cloned().collect();
      subs.sort_by(|a, b| a.table.cmp(&b.table));
      subs
   }

   /// Translates a raw change without pushing it anywhere.
   pub fn translate(&self, change: &RawChange) -> Result<ChangeEvent> {
      let table = self
         .inner
         .tables
         .get(&change.table)
         .ok_or_else(|| Error::UnwatchedTable(change.table.clone()))?;
      translate(table, change)
   }

   /// Handles a notification as if the transport had delivered it on `table`'s channel.
   pub fn on_event(&self, table: &str, event: ChannelEvent) {
      self.inner.on_channel_event(table, event);
   }

   fn handler(&self, table: &str) -> ChangeHandler {
      let inner = Arc::clone(&self.inner);
      let table = table.to_string();
      Arc::new(move |event| inner.on_channel_event(&table, event))
   }
}

impl RegistryInner {
   fn on_channel_event(&self, table: &str, event: ChannelEvent) {
      match event {
         ChannelEvent::Change(change) => self.on_change(change),
         ChannelEvent::Failed(reason) => {
            let mut subs = self.subscriptions.write();
            if let Some(sub) = subs.get_mut(table)
               && sub.status.is_live()
            {
               warn!(table = %table, reason = %reason, "Subscription errored");
               sub.status = SubscriptionStatus::Errored;
               sub.last_error = Some(reason);
            }
         }
      }
   }

   fn on_change(&self, change: RawChange) {
      let Some(table) = self.tables.get(&change.table) else {
         trace!(table = %change.table, "Dropping change for unwatched table");
         return;
      };

      let live = self
         .subscriptions
         .read()
         .get(&change.table)
         .is_some_and(|sub| sub.status.is_live());
      if !live {
         trace!(table = %change.table, "Dropping change for closed subscription");
         return;
      }

      match translate(table, &change) {
         Ok(event) => {
            self.accumulator.push(event);
         }
         Err(e) => warn!(error = %e, "Dropping malformed change"),
      }
   }
}

fn translate(table: &TableConfig, change: &RawChange) -> Result<ChangeEvent> {
   let image = |values: &Option<Vec<ColumnValue>>, which: &str| -> Result<Option<Record>> {
      match values {
         None => Ok(None),
         Some(values) if values.len() != change.columns.len() => Err(Error::Translation {
            table: change.table.clone(),
            reason: format!(
               "{which} image has {} values for {} columns",
               values.len(),
               change.columns.len()
            ),
         }),
         Some(values) => Ok(Some(
            change
               .columns
               .iter()
               .cloned()
               .zip(values.iter().cloned())
               .collect(),
         )),
      }
   };
   let missing = |which: &str| Error::Translation {
      table: change.table.clone(),
      reason: format!("{} without {which} image", change.operation),
   };

   let old = image(&change.old_values, "old")?;
   let new = image(&change.new_values, "new")?;

   let (record, previous_record) = match change.operation {
      ChangeOperation::Insert => (new.ok_or_else(|| missing("new"))?, None),
      ChangeOperation::Update => (new.ok_or_else(|| missing("new"))?, old),
      ChangeOperation::Delete => {
         let old = old.ok_or_else(|| missing("old"))?;
         (old.clone(), Some(old))
      }
   };

   let source_commit_time = record
      .get(&table.modified_column)
      .and_then(|value| parse_timestamp(value, table.timestamp_encoding))
      .unwrap_or(change.committed_at);

   Ok(ChangeEvent {
      table: change.table.clone(),
      operation: change.operation,
      record,
      previous_record,
      observed_at: OffsetDateTime::now_utc(),
      source_commit_time: Some(source_commit_time),
   })
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::time::Duration;
   use time::macros::datetime;

   fn raw(
      operation: ChangeOperation,
      old: Option<Vec<ColumnValue>>,
      new: Option<Vec<ColumnValue>>,
   ) -> RawChange {
      RawChange {
         table: "foo".into(),
         operation,
         rowid: Some(1),
         columns: vec!["id".to_string(), "name".to_string(), "updated_at".to_string()].into(),
         old_values: old,
         new_values: new,
         committed_at: datetime!(2024-05-01 09:00 UTC),
      }
   }

   fn row(id: i64, name: &str, updated_at: &str) -> Vec<ColumnValue> {
      vec![
         ColumnValue::Integer(id),
         ColumnValue::Text(name.into()),
         ColumnValue::Text(updated_at.into()),
      ]
   }

   #[test]
   fn test_translate_update_uses_modified_column() {
      let change = raw(
         ChangeOperation::Update,
         Some(row(1, "a", "2024-04-01 00:00:00")),
         Some(row(1, "b", "2024-04-02 08:30:00")),
      );

      let event = translate(&TableConfig::new("foo"), &change).unwrap();
      assert_eq!(event.operation, ChangeOperation::Update);
      assert_eq!(event.record["name"], ColumnValue::Text("b".into()));
      assert_eq!(
         event.previous_record.as_ref().unwrap()["name"],
         ColumnValue::Text("a".into())
      );
      assert_eq!(event.source_commit_time, Some(datetime!(2024-04-02 08:30 UTC)));
      let columns: Vec<&str> = event.record.keys().map(String::as_str).collect();
      assert_eq!(columns, vec!["id", "name", "updated_at"]);
   }

   #[test]
   fn test_translate_delete_keeps_last_known_state() {
      let change = raw(
         ChangeOperation::Delete,
         Some(row(2, "gone", "not a timestamp")),
         None,
      );

      let event = translate(&TableConfig::new("foo"), &change).unwrap();
      assert_eq!(event.record["id"], ColumnValue::Integer(2));
      assert_eq!(event.previous_record.as_ref(), Some(&event.record));
      // Falls back to the commit time when the column does not parse
      assert_eq!(event.source_commit_time, Some(datetime!(2024-05-01 09:00 UTC)));
   }

   #[test]
   fn test_translate_rejects_malformed() {
      let table = TableConfig::new("foo");

      let short = raw(ChangeOperation::Insert, None, Some(vec![ColumnValue::Null]));
      assert!(matches!(
         translate(&table, &short),
         Err(Error::Translation { .. })
      ));

      let no_image = raw(ChangeOperation::Delete, None, Some(row(1, "a", "")));
      let err = translate(&table, &no_image).unwrap_err();
      assert_eq!(
         err.to_string(),
         "malformed change notification for table 'foo': DELETE without old image"
      );
   }

   #[test]
   fn test_on_event_requires_live_subscription() {
      struct NoTransport;
      impl ChangeTransport for NoTransport {
         async fn open_channel(
            &self,
            table: &str,
            _handler: ChangeHandler,
         ) -> sqlx_sqlite_cdc_transport::Result<ChannelHandle> {
            Ok(ChannelHandle::new(1, table))
         }

         fn close_channel(&self, _handle: &ChannelHandle) -> sqlx_sqlite_cdc_transport::Result<()> {
            Ok(())
         }
      }

      let accumulator = Arc::new(BatchAccumulator::new(10, Duration::from_secs(5)));
      let registry = SubscriptionRegistry::new(
         Arc::new(NoTransport),
         [TableConfig::new("foo")],
         Arc::clone(&accumulator),
      );

      let change = raw(ChangeOperation::Insert, None, Some(row(1, "a", "")));

      // Not subscribed yet
      registry.on_event("foo", ChannelEvent::Change(change.clone()));
      assert!(accumulator.is_empty());

      let mut other = change.clone();
      other.table = "bar".into();
      registry.on_event("bar", ChannelEvent::Change(other));
      assert!(accumulator.is_empty());
   }
}
