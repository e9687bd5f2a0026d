use std::time::Duration;

use sqlx_sqlite_cdc_conn::{ConnectionManager, ConnectionRole, ConnectionState, Error};
use tempfile::TempDir;

fn manager_in(dir: &TempDir) -> ConnectionManager {
   ConnectionManager::new(dir.path().join("cdc.db"), None).unwrap()
}

#[tokio::test]
async fn test_connect_creates_database_and_validates() {
   let dir = TempDir::new().unwrap();
   let manager = manager_in(&dir);

   manager.connect().await.unwrap();

   assert!(dir.path().join("cdc.db").exists());
   assert_eq!(manager.state(), ConnectionState::Connected);
   manager.ping().await.unwrap();

   manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connect_is_idempotent() {
   let dir = TempDir::new().unwrap();
   let manager = manager_in(&dir);

   manager.connect().await.unwrap();
   let pool = manager.query_pool().unwrap();
   manager.connect().await.unwrap();

   // Same underlying pool, nothing was reopened
   assert_eq!(pool.size(), manager.query_pool().unwrap().size());
   assert_eq!(manager.state(), ConnectionState::Connected);

   manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_reports_role() {
   let dir = TempDir::new().unwrap();
   // Parent directory does not exist, so the file cannot be created
   let manager =
      ConnectionManager::new(dir.path().join("missing").join("cdc.db"), None).unwrap();

   let err = manager.connect().await.unwrap_err();

   assert!(
      matches!(err, Error::Sqlx(_) | Error::Validation { .. }),
      "unexpected error: {err:?}"
   );
   assert!(matches!(manager.state(), ConnectionState::Failed(_)));
   assert!(!manager.is_connected());

   // Disconnect after a failed connect is safe
   manager.disconnect().await.unwrap();
   assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn test_validation_error_names_role() {
   let err = Error::Validation {
      role: ConnectionRole::Control,
      source: sqlx::Error::PoolClosed,
   };
   assert!(err.to_string().starts_with("control connection failed validation"));
}

#[tokio::test]
async fn test_disconnect_without_connect_is_noop() {
   let dir = TempDir::new().unwrap();
   let manager = manager_in(&dir);

   manager.disconnect().await.unwrap();
   manager.disconnect().await.unwrap();

   assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_bounded_disconnect_does_not_wait_for_held_connection() {
   let dir = TempDir::new().unwrap();
   let manager = manager_in(&dir);
   manager.connect().await.unwrap();

   let control = manager.acquire_control().await.unwrap();
   let started = std::time::Instant::now();
   let err = manager
      .disconnect_within(Duration::from_millis(100))
      .await
      .unwrap_err();

   assert!(matches!(err, Error::CloseTimeout(_)));
   assert!(started.elapsed() < Duration::from_secs(5));
   assert_eq!(manager.state(), ConnectionState::Disconnected);
   assert!(!manager.is_connected());
   drop(control);

   manager.connect().await.unwrap();
   manager
      .disconnect_within(Duration::from_secs(5))
      .await
      .unwrap();
}

#[tokio::test]
async fn test_query_pool_unavailable_after_disconnect() {
   let dir = TempDir::new().unwrap();
   let manager = manager_in(&dir);

   manager.connect().await.unwrap();
   manager.disconnect().await.unwrap();

   assert!(matches!(manager.query_pool(), Err(Error::NotConnected)));
   assert!(matches!(
      manager.acquire_control().await,
      Err(Error::NotConnected)
   ));
   assert!(matches!(manager.ping().await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_control_writes_visible_to_query_pool() {
   let dir = TempDir::new().unwrap();
   let manager = manager_in(&dir);
   manager.connect().await.unwrap();

   {
      let mut control = manager.acquire_control().await.unwrap();
      sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)")
         .execute(&mut *control)
         .await
         .unwrap();
      sqlx::query("INSERT INTO items (name) VALUES ('a'), ('b')")
         .execute(&mut *control)
         .await
         .unwrap();
   }

   let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
      .fetch_one(&manager.query_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(count, 2);

   // WAL was enabled on first control checkout
   let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
      .fetch_one(&manager.query_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(mode.to_lowercase(), "wal");

   manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
   let dir = TempDir::new().unwrap();
   let manager = manager_in(&dir);

   manager.connect().await.unwrap();
   manager.disconnect().await.unwrap();
   manager.connect().await.unwrap();

   assert_eq!(manager.state(), ConnectionState::Connected);
   manager.ping().await.unwrap();
   manager.disconnect().await.unwrap();
}
