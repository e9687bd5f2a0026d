//! Configuration surface consumed by the CDC pipeline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx_sqlite_cdc_conn::SqliteDatabaseConfig;

use crate::error::{Error, Result};

/// How a table stores its creation and modification timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampEncoding {
   /// `YYYY-MM-DD HH:MM:SS[.SSS]` (SQLite `CURRENT_TIMESTAMP`) or RFC 3339, UTC.
   #[default]
   Text,
   /// Integer milliseconds since the Unix epoch.
   UnixMillis,
   /// Integer seconds since the Unix epoch.
   UnixSeconds,
}

/// A watched table and the columns catch-up reads rely on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
   pub name: String,

   /// Column holding the last modification time. Default: `updated_at`.
   #[serde(default = "default_modified_column")]
   pub modified_column: String,

   /// Column holding the creation time. Default: `created_at`.
   #[serde(default = "default_created_column")]
   pub created_column: String,

   #[serde(default)]
   pub timestamp_encoding: TimestampEncoding,
}

fn default_modified_column() -> String {
   "updated_at".to_string()
}

fn default_created_column() -> String {
   "created_at".to_string()
}

impl TableConfig {
   pub fn new(name: impl Into<String>) -> Self {
      Self {
         name: name.into(),
         modified_column: default_modified_column(),
         created_column: default_created_column(),
         timestamp_encoding: TimestampEncoding::default(),
      }
   }

   pub fn with_modified_column(mut self, column: impl Into<String>) -> Self {
      self.modified_column = column.into();
      self
   }

   pub fn with_created_column(mut self, column: impl Into<String>) -> Self {
      self.created_column = column.into();
      self
   }

   pub fn with_timestamp_encoding(mut self, encoding: TimestampEncoding) -> Self {
      self.timestamp_encoding = encoding;
      self
   }
}

impl From<&str> for TableConfig {
   fn from(name: &str) -> Self {
      TableConfig::new(name)
   }
}

impl From<String> for TableConfig {
   fn from(name: String) -> Self {
      TableConfig::new(name)
   }
}

/// Configuration for a [`Pipeline`](crate::Pipeline).
///
/// # Examples
///
/// ```
/// use sqlite_cdc::{CdcConfig, TableConfig, TimestampEncoding};
///
/// let config = CdcConfig::new("app.db")
///     .with_tables(["orders"])
///     .with_table(TableConfig::new("events").with_timestamp_encoding(TimestampEncoding::UnixMillis))
///     .with_max_batch_size(500);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_batch_age().as_secs(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdcConfig {
   /// Path to the SQLite database file.
   pub database_path: PathBuf,

   /// Pool settings for the query pool and control connection.
   pub database: SqliteDatabaseConfig,

   /// Tables to capture. Changes on any other table are dropped.
   pub tables: Vec<TableConfig>,

   /// Buffered event count that triggers an immediate flush.
   ///
   /// Default: 100
   pub max_batch_size: usize,

   /// Period of the time-triggered flush (in milliseconds).
   ///
   /// Default: 5000
   pub max_batch_age_ms: u64,

   /// How far back a cold-start catch-up reads when no watermark is known (in seconds).
   ///
   /// Default: 86400 (24 hours)
   pub initial_lookback_secs: u64,

   /// Maximum rows returned by one catch-up read.
   ///
   /// Default: 10000
   pub catch_up_limit: usize,

   /// Upper bound for the final drain during `stop()` (in milliseconds).
   ///
   /// Default: 10000
   pub shutdown_timeout_ms: u64,
}

impl Default for CdcConfig {
   fn default() -> Self {
      Self {
         database_path: PathBuf::new(),
         database: SqliteDatabaseConfig::default(),
         tables: Vec::new(),
         max_batch_size: 100,
         max_batch_age_ms: 5_000,
         initial_lookback_secs: 24 * 60 * 60,
         catch_up_limit: 10_000,
         shutdown_timeout_ms: 10_000,
      }
   }
}

impl CdcConfig {
   /// Creates a configuration for the database at `path` with default settings.
   pub fn new(database_path: impl Into<PathBuf>) -> Self {
      Self {
         database_path: database_path.into(),
         ..Self::default()
      }
   }

   /// Parses a configuration from JSON. Missing fields take their defaults.
   pub fn from_json(json: &str) -> Result<Self> {
      serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))
   }

   /// Adds tables with default timestamp columns.
   pub fn with_tables<I, S>(mut self, tables: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self
         .tables
         .extend(tables.into_iter().map(TableConfig::new));
      self
   }

   /// Adds a single table with explicit settings.
   pub fn with_table(mut self, table: TableConfig) -> Self {
      self.tables.push(table);
      self
   }

   pub fn with_max_batch_size(mut self, size: usize) -> Self {
      self.max_batch_size = size;
      self
   }

   pub fn with_max_batch_age(mut self, age: Duration) -> Self {
      self.max_batch_age_ms = age.as_millis() as u64;
      self
   }

   pub fn with_initial_lookback(mut self, lookback: Duration) -> Self {
      self.initial_lookback_secs = lookback.as_secs();
      self
   }

   pub fn with_catch_up_limit(mut self, limit: usize) -> Self {
      self.catch_up_limit = limit;
      self
   }

   pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
      self.shutdown_timeout_ms = timeout.as_millis() as u64;
      self
   }

   pub fn with_database_config(mut self, database: SqliteDatabaseConfig) -> Self {
      self.database = database;
      self
   }

   pub fn max_batch_age(&self) -> Duration {
      Duration::from_millis(self.max_batch_age_ms)
   }

   pub fn initial_lookback(&self) -> Duration {
      Duration::from_secs(self.initial_lookback_secs)
   }

   pub fn shutdown_timeout(&self) -> Duration {
      Duration::from_millis(self.shutdown_timeout_ms)
   }

   /// Looks up a watched table by name.
   pub fn table(&self, name: &str) -> Option<&TableConfig> {
      self.tables.iter().find(|table| table.name == name)
   }

   /// Names of all watched tables, in configuration order.
   pub fn table_names(&self) -> Vec<String> {
      self.tables.iter().map(|table| table.name.clone()).collect()
   }

   /// Checks every constraint the pipeline relies on.
   pub fn validate(&self) -> Result<()> {
      if self.database_path.as_os_str().is_empty() {
         return Err(Error::InvalidConfig("database_path cannot be empty".into()));
      }
      if self.max_batch_size == 0 {
         return Err(Error::InvalidConfig("max_batch_size must be positive".into()));
      }
      if self.max_batch_age_ms == 0 {
         return Err(Error::InvalidConfig("max_batch_age_ms must be positive".into()));
      }
      if self.shutdown_timeout_ms == 0 {
         return Err(Error::InvalidConfig(
            "shutdown_timeout_ms must be positive".into(),
         ));
      }
      if self.catch_up_limit == 0 {
         return Err(Error::InvalidConfig("catch_up_limit must be positive".into()));
      }
      if self.tables.is_empty() {
         return Err(Error::InvalidConfig(
            "at least one table must be watched".into(),
         ));
      }

      let mut seen = HashSet::new();
      for table in &self.tables {
         for identifier in [&table.name, &table.modified_column, &table.created_column] {
            if !is_valid_identifier(identifier) {
               return Err(Error::InvalidConfig(format!(
                  "invalid identifier '{identifier}': must contain only alphanumeric characters and underscores, and cannot start with a digit"
               )));
            }
         }
         if !seen.insert(table.name.as_str()) {
            return Err(Error::InvalidConfig(format!(
               "table '{}' is listed more than once",
               table.name
            )));
         }
      }

      Ok(())
   }
}

/// Identifiers are interpolated into SQL, so only plain names are accepted.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
   let mut chars = name.chars();
   match chars.next() {
      Some(first) if first.is_ascii_alphabetic() || first == '_' => {
         chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
      }
      _ => false,
   }
}
