//! # sqlx-sqlite-cdc-conn
//!
//! Owns the two connections a SQLite change-data-capture pipeline needs:
//!
//! - **Control connection**: a single read-write connection. Change hooks are registered on
//!   it, so writes made through it are observed in realtime.
//! - **Query pool**: read-only connections used for historical (catch-up) reads and
//!   connectivity checks.
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_sqlite_cdc_conn::{ConnectionManager, ConnectionState};
//!
//! #[tokio::main]
//! async fn main() -> sqlx_sqlite_cdc_conn::Result<()> {
//!     let manager = ConnectionManager::new("app.db", None)?;
//!
//!     manager.connect().await?;
//!     // Connecting again is a no-op
//!     manager.connect().await?;
//!     assert_eq!(manager.state(), ConnectionState::Connected);
//!
//!     let rows = sqlx::query("SELECT * FROM users")
//!         .fetch_all(&manager.query_pool()?)
//!         .await?;
//!
//!     manager.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
mod config;
mod error;
mod manager;

pub use config::SqliteDatabaseConfig;
pub use error::{ConnectionRole, Error};
pub use manager::{ConnectionManager, ConnectionState};

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
