//! Realtime row-change transport for SQLite change-data-capture.
//!
//! [`ChangeTransport`] is the narrow contract a CDC pipeline is written against:
//! open a channel for a table and receive a callback with the operation and the
//! before/after row images of every committed change.
//!
//! [`HookTransport`] implements it with SQLite's native hooks (`preupdate_hook`,
//! `commit_hook`, `rollback_hook`). Notifications are **transaction-safe**: changes are
//! buffered while a transaction is open and only delivered after it commits.
//!
//! # SQLite Requirements
//!
//! Requires SQLite compiled with `SQLITE_ENABLE_PREUPDATE_HOOK`. The default `bundled`
//! feature compiles SQLite from source with it enabled. When linking your own SQLite,
//! use [`is_preupdate_hook_enabled()`] to verify at runtime.

pub mod change;
pub mod dispatch;
pub mod error;
pub mod hook_transport;
pub mod hooks;
mod schema;
pub mod transport;
pub mod writer;

pub use change::{ChangeOperation, ChannelEvent, ChannelHandle, ColumnValue, RawChange};
pub use dispatch::HookDispatcher;
pub use error::Error;
pub use hook_transport::HookTransport;
pub use hooks::is_preupdate_hook_enabled;
pub use transport::{ChangeHandler, ChangeTransport};
pub use writer::ObservedWriter;

pub type Result<T> = std::result::Result<T, Error>;
