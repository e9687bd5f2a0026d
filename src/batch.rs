//! Ordered groups of change events handed to a sink as one unit.

use std::collections::HashMap;

use serde::Serialize;
use sqlx_sqlite_cdc_transport::ChangeOperation;
use time::OffsetDateTime;

use crate::event::ChangeEvent;

/// A bounded, ordered group of change events.
///
/// Events are in arrival order. A batch is never split or merged after it is
/// sealed: a failed batch is retried whole, with the same `sequence`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
   /// Monotonic per accumulator, assigned when the batch is sealed.
   pub sequence: u64,
   pub events: Vec<ChangeEvent>,
   /// Number of failed delivery attempts so far.
   pub attempts: u32,
}

impl Batch {
   pub(crate) fn new(sequence: u64, events: Vec<ChangeEvent>) -> Self {
      Self {
         sequence,
         events,
         attempts: 0,
      }
   }

   /// Number of events in batch.
   #[inline]
   pub fn len(&self) -> usize {
      self.events.len()
   }

   /// Check if batch is empty.
   #[inline]
   pub fn is_empty(&self) -> bool {
      self.events.is_empty()
   }

   /// Count events by operation type.
   pub fn counts(&self) -> BatchCounts {
      let mut counts = BatchCounts::default();
      for event in &self.events {
         match event.operation {
            ChangeOperation::Insert => counts.inserts += 1,
            ChangeOperation::Update => counts.updates += 1,
            ChangeOperation::Delete => counts.deletes += 1,
         }
      }
      counts
   }

   /// Latest `source_commit_time` per table, over events that carry one.
   pub fn max_commit_times(&self) -> HashMap<&str, OffsetDateTime> {
      let mut latest: HashMap<&str, OffsetDateTime> = HashMap::new();
      for event in &self.events {
         let Some(commit_time) = event.source_commit_time else {
            continue;
         };
         latest
            .entry(event.table.as_str())
            .and_modify(|current| {
               if commit_time > *current {
                  *current = commit_time;
               }
            })
            .or_insert(commit_time);
      }
      latest
   }
}

/// Counts of events by operation type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCounts {
   pub inserts: usize,
   pub updates: usize,
   pub deletes: usize,
}

impl BatchCounts {
   pub fn total(&self) -> usize {
      self.inserts + self.updates + self.deletes
   }
}
