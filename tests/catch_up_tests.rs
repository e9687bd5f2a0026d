//! Catch-up reads against an on-disk database.
//!
//! Rows are written with a plain pool, outside change capture, the way another
//! process would write them while nobody is listening.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use sqlite_cdc::{
   CatchUpReader, CdcConfig, ChangeEvent, ChangeOperation, ColumnValue, ConnectionManager,
   TableConfig, TimestampEncoding,
};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tempfile::TempDir;
use time::OffsetDateTime;
use time::macros::datetime;

async fn setup(config: CdcConfig, schema: &[&str]) -> (TempDir, SqlitePool, CatchUpReader) {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("history.db");

   let pool = SqlitePool::connect_with(
      SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(true),
   )
   .await
   .unwrap();
   for statement in schema {
      sqlx::query(statement).execute(&pool).await.unwrap();
   }

   let config = CdcConfig {
      database_path: path.clone(),
      ..config
   };
   let manager = Arc::new(ConnectionManager::new(&path, None).unwrap());
   manager.connect().await.unwrap();

   (dir, pool, CatchUpReader::new(manager, &config))
}

const FOO: &str = "CREATE TABLE foo (
   id INTEGER PRIMARY KEY,
   name TEXT NOT NULL,
   created_at TEXT NOT NULL,
   updated_at TEXT NOT NULL
)";

async fn insert_foo(pool: &SqlitePool, id: i64, created: &str, updated: &str) {
   sqlx::query(&format!(
      "INSERT INTO foo (id, name, created_at, updated_at)
       VALUES (?1, ?2, datetime('now', '{created}'), datetime('now', '{updated}'))"
   ))
   .bind(id)
   .bind(format!("row {id}"))
   .execute(pool)
   .await
   .unwrap();
}

fn summary(events: &[ChangeEvent]) -> Vec<(ChangeOperation, i64)> {
   events
      .iter()
      .map(|e| (e.operation, e.get("id").and_then(ColumnValue::as_integer).unwrap()))
      .collect()
}

#[tokio::test]
async fn test_initial_sync_uses_lookback_and_classifies() {
   let (_dir, pool, reader) = setup(CdcConfig::default().with_tables(["foo"]), &[FOO]).await;

   insert_foo(&pool, 1, "-1 hour", "-1 hour").await;
   insert_foo(&pool, 2, "-2 days", "-2 hours").await;
   insert_foo(&pool, 3, "-3 days", "-3 days").await;
   insert_foo(&pool, 4, "-30 minutes", "-10 minutes").await;

   assert_eq!(reader.initial_lookback(), Duration::from_secs(24 * 60 * 60));

   let events: Vec<ChangeEvent> = reader
      .perform_initial_sync("foo", None)
      .unwrap()
      .try_collect()
      .await
      .unwrap();

   assert_eq!(
      summary(&events),
      vec![
         (ChangeOperation::Update, 2),
         (ChangeOperation::Insert, 1),
         (ChangeOperation::Insert, 4),
      ]
   );

   let event = &events[0];
   assert_eq!(event.table, "foo");
   assert_eq!(event.record["name"], ColumnValue::Text("row 2".into()));
   assert!(event.previous_record.is_none());
   let commit_times: Vec<OffsetDateTime> =
      events.iter().map(|e| e.source_commit_time.unwrap()).collect();
   assert!(commit_times.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_read_since_is_restartable_and_limited() {
   let (_dir, pool, reader) = setup(CdcConfig::default().with_tables(["foo"]), &[FOO]).await;

   for (id, age) in [(1, "-5 hours"), (2, "-4 hours"), (3, "-3 hours"), (4, "-2 hours")] {
      insert_foo(&pool, id, "-10 days", age).await;
   }

   let watermark = OffsetDateTime::now_utc() - Duration::from_secs(6 * 60 * 60);
   let first: Vec<ChangeEvent> = reader
      .read_since("foo", watermark, 2)
      .unwrap()
      .try_collect()
      .await
      .unwrap();
   let again: Vec<ChangeEvent> = reader
      .read_since("foo", watermark, 2)
      .unwrap()
      .try_collect()
      .await
      .unwrap();

   assert_eq!(summary(&first), vec![(ChangeOperation::Update, 1), (ChangeOperation::Update, 2)]);
   assert_eq!(summary(&first), summary(&again));

   // Resume from the last delivered commit time
   let resume_from = first[1].source_commit_time.unwrap();
   let rest: Vec<ChangeEvent> = reader
      .read_since("foo", resume_from, 10)
      .unwrap()
      .try_collect()
      .await
      .unwrap();
   assert_eq!(summary(&rest), vec![(ChangeOperation::Update, 3), (ChangeOperation::Update, 4)]);
}

#[tokio::test]
async fn test_text_timestamps_compare_in_utc() {
   let (_dir, pool, reader) = setup(CdcConfig::default().with_tables(["foo"]), &[FOO]).await;

   for (id, updated) in [
      (1, "2024-03-01T08:00:00Z"),
      (2, "2024-03-01T14:30:00+02:00"),
      (3, "2024-03-01 12:15:00"),
      (4, "2024-03-01T13:00:00+05:00"),
   ] {
      sqlx::query(
         "INSERT INTO foo (id, name, created_at, updated_at)
          VALUES (?1, 'row', '2024-01-01 00:00:00', ?2)",
      )
      .bind(id)
      .bind(updated)
      .execute(&pool)
      .await
      .unwrap();
   }

   let events: Vec<ChangeEvent> = reader
      .read_since("foo", datetime!(2024-03-01 12:00 UTC), 10)
      .unwrap()
      .try_collect()
      .await
      .unwrap();

   assert_eq!(
      summary(&events),
      vec![(ChangeOperation::Update, 3), (ChangeOperation::Update, 2)]
   );
   assert_eq!(events[1].source_commit_time, Some(datetime!(2024-03-01 12:30 UTC)));
}

#[tokio::test]
async fn test_unix_millis_columns() {
   let config = CdcConfig::default().with_table(
      TableConfig::new("events")
         .with_created_column("created_ms")
         .with_modified_column("modified_ms")
         .with_timestamp_encoding(TimestampEncoding::UnixMillis),
   );
   let (_dir, pool, reader) = setup(
      config,
      &["CREATE TABLE events (id INTEGER PRIMARY KEY, payload BLOB, created_ms INTEGER, modified_ms INTEGER)"],
   )
   .await;

   let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
   let hour_ms = 60 * 60 * 1000;
   for (id, created, modified) in [
      (1, now_ms - 48 * hour_ms, now_ms - hour_ms),
      (2, now_ms - 2 * hour_ms, now_ms - 2 * hour_ms),
      (3, now_ms - 72 * hour_ms, now_ms - 30 * hour_ms),
   ] {
      sqlx::query("INSERT INTO events (id, payload, created_ms, modified_ms) VALUES (?1, ?2, ?3, ?4)")
         .bind(id)
         .bind(vec![0u8, 1, 2])
         .bind(created)
         .bind(modified)
         .execute(&pool)
         .await
         .unwrap();
   }

   let events: Vec<ChangeEvent> = reader
      .perform_initial_sync("events", None)
      .unwrap()
      .try_collect()
      .await
      .unwrap();

   assert_eq!(
      summary(&events),
      vec![(ChangeOperation::Insert, 2), (ChangeOperation::Update, 1)]
   );
   assert_eq!(events[0].record["payload"], ColumnValue::Blob(vec![0, 1, 2]));
   assert_eq!(
      events[1].source_commit_time.map(|t| (t.unix_timestamp_nanos() / 1_000_000) as i64),
      Some(now_ms - hour_ms)
   );
}

#[tokio::test]
async fn test_read_is_lazy() {
   // `bar` is watched but was never created
   let (_dir, _pool, reader) =
      setup(CdcConfig::default().with_tables(["foo", "bar"]), &[FOO]).await;

   let stream = reader
      .read_since("bar", OffsetDateTime::now_utc(), 10)
      .expect("building the stream does not query");

   let err = stream.try_collect::<Vec<_>>().await.unwrap_err();
   assert_eq!(err.error_code(), "CATCH_UP_ERROR");
}

#[tokio::test]
async fn test_unwatched_table_is_rejected() {
   let (_dir, _pool, reader) = setup(CdcConfig::default().with_tables(["foo"]), &[FOO]).await;

   let err = reader
      .perform_initial_sync("users", None)
      .err()
      .expect("unwatched table");
   assert_eq!(err.error_code(), "UNWATCHED_TABLE");
}
