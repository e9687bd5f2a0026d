use sqlx::{Pool, Sqlite};

use crate::Result;

/// Returns the column names of `table` ordered by column index.
///
/// An empty result means the table does not exist.
pub(crate) async fn table_columns(pool: &Pool<Sqlite>, table: &str) -> Result<Vec<String>> {
   let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
      .bind(table)
      .fetch_all(pool)
      .await?;

   Ok(rows.into_iter().map(|(name,)| name).collect())
}
