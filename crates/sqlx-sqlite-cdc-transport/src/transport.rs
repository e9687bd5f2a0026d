//! The narrow contract a realtime change provider has to satisfy.

use std::future::Future;
use std::sync::Arc;

use crate::Result;
use crate::change::{ChannelEvent, ChannelHandle};

/// Callback invoked by a transport for every event on an open channel.
///
/// Called on the transport's own execution context (for SQLite hooks, the thread
/// executing the statement), so implementations must not block.
pub type ChangeHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// A provider of row-level change notifications.
///
/// "Subscribe to row changes on table X, receive a callback with the operation and
/// the before/after row images."
pub trait ChangeTransport: Send + Sync + 'static {
   /// Opens a channel delivering INSERT, UPDATE and DELETE changes for `table`.
   fn open_channel(
      &self,
      table: &str,
      handler: ChangeHandler,
   ) -> impl Future<Output = Result<ChannelHandle>> + Send;

   /// Closes a channel. Closing an unknown or already-closed channel is not an error.
   fn close_channel(&self, handle: &ChannelHandle) -> Result<()>;
}
