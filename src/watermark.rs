//! Per-table "last processed" timestamps bounding catch-up reads.

use std::collections::HashMap;

use parking_lot::RwLock;
use time::OffsetDateTime;
use tracing::trace;

/// Tracks the latest source commit time successfully delivered per table.
///
/// Watermarks only move forward. They live in memory; callers that want them to
/// survive a restart persist [`snapshot`](Self::snapshot) and restore it with
/// [`seed`](Self::seed).
#[derive(Debug, Default)]
pub struct Watermarks {
   inner: RwLock<HashMap<String, OffsetDateTime>>,
}

impl Watermarks {
   pub fn new() -> Self {
      Self::default()
   }

   /// Returns the watermark for `table`, if one is known.
   pub fn get(&self, table: &str) -> Option<OffsetDateTime> {
      self.inner.read().get(table).copied()
   }

   /// Moves the watermark for `table` to `to` if that is later than the current one.
   ///
   /// Returns true if the watermark changed.
   pub fn advance(&self, table: &str, to: OffsetDateTime) -> bool {
      let mut inner = self.inner.write();
      match inner.get_mut(table) {
         Some(current) if *current >= to => false,
         Some(current) => {
            *current = to;
            trace!(table = %table, watermark = %to, "Watermark advanced");
            true
         }
         None => {
            inner.insert(table.to_string(), to);
            trace!(table = %table, watermark = %to, "Watermark initialised");
            true
         }
      }
   }

   /// Copy of all known watermarks.
   pub fn snapshot(&self) -> HashMap<String, OffsetDateTime> {
      self.inner.read().clone()
   }

   /// Restores previously persisted watermarks. Existing later values win.
   pub fn seed<I, S>(&self, watermarks: I)
   where
      I: IntoIterator<Item = (S, OffsetDateTime)>,
      S: AsRef<str>,
   {
      for (table, at) in watermarks {
         self.advance(table.as_ref(), at);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use time::macros::datetime;

   #[test]
   fn test_advance_is_monotonic() {
      let watermarks = Watermarks::new();
      assert!(watermarks.get("foo").is_none());

      assert!(watermarks.advance("foo", datetime!(2024-01-01 12:00 UTC)));
      assert!(!watermarks.advance("foo", datetime!(2024-01-01 11:00 UTC)));
      assert!(!watermarks.advance("foo", datetime!(2024-01-01 12:00 UTC)));
      assert_eq!(watermarks.get("foo"), Some(datetime!(2024-01-01 12:00 UTC)));

      assert!(watermarks.advance("foo", datetime!(2024-01-01 13:00 UTC)));
      assert_eq!(watermarks.get("foo"), Some(datetime!(2024-01-01 13:00 UTC)));
   }

   #[test]
   fn test_seed_and_snapshot() {
      let watermarks = Watermarks::new();
      watermarks.advance("foo", datetime!(2024-06-01 00:00 UTC));
      watermarks.seed([
         ("foo", datetime!(2024-01-01 00:00 UTC)),
         ("bar", datetime!(2024-02-01 00:00 UTC)),
      ]);

      let snapshot = watermarks.snapshot();
      assert_eq!(snapshot.len(), 2);
      assert_eq!(snapshot["foo"], datetime!(2024-06-01 00:00 UTC));
      assert_eq!(snapshot["bar"], datetime!(2024-02-01 00:00 UTC));
   }
}
