//! Dual-threshold event buffer.
//!
//! Events are appended to an open buffer. When the buffer reaches
//! `max_batch_size` it is sealed into a [`Batch`] synchronously inside
//! [`push`](BatchAccumulator::push) and the delivery worker is woken. The
//! delivery worker also cuts whatever is left in the open buffer every
//! `max_batch_age`. Sealed batches wait in a FIFO queue until they are
//! delivered; a batch whose delivery failed is put back at the front of that
//! queue, ahead of anything that arrived while it was in flight.

use std::collections::VecDeque;
use std::mem;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, trace};

use crate::batch::Batch;
use crate::event::ChangeEvent;

#[derive(Debug)]
struct BufferState {
   open: Vec<ChangeEvent>,
   sealed: VecDeque<Batch>,
   next_sequence: u64,
   timer_enabled: bool,
}

impl BufferState {
   fn seal(&mut self, capacity: usize) -> u64 {
      let events = mem::replace(&mut self.open, Vec::with_capacity(capacity));
      let sequence = self.next_sequence;
      self.next_sequence += 1;
      self.sealed.push_back(Batch::new(sequence, events));
      sequence
   }
}

/// Buffers change events and decides when a batch is due.
///
/// All buffer mutation happens under one short-lived lock; no await point or
/// sink call is ever made while it is held, so `push` stays O(1) and never
/// blocks on delivery.
#[derive(Debug)]
pub struct BatchAccumulator {
   state: Mutex<BufferState>,
   ready: Notify,
   max_batch_size: usize,
   max_batch_age: Duration,
}

impl BatchAccumulator {
   /// Creates an accumulator. `max_batch_size` is clamped to at least one.
   pub fn new(max_batch_size: usize, max_batch_age: Duration) -> Self {
      let max_batch_size = max_batch_size.max(1);
      Self {
         state: Mutex::new(BufferState {
            open: Vec::with_capacity(max_batch_size),
            sealed: VecDeque::new(),
            next_sequence: 1,
            timer_enabled: true,
         }),
         ready: Notify::new(),
         max_batch_size,
         max_batch_age,
      }
   }

   pub fn max_batch_size(&self) -> usize {
      self.max_batch_size
   }

   pub fn max_batch_age(&self) -> Duration {
      self.max_batch_age
   }

   /// Appends an event. Seals the open buffer if it reached `max_batch_size`.
   ///
   /// Returns true if this push sealed a batch.
   pub fn push(&self, event: ChangeEvent) -> bool {
      let sealed = {
         let mut state = self.state.lock();
         state.open.push(event);
         if state.open.len() >= self.max_batch_size {
            Some(state.seal(self.max_batch_size))
         } else {
            None
         }
      };

      match sealed {
         Some(sequence) => {
            trace!(sequence, size = self.max_batch_size, "Batch sealed by size");
            self.ready.notify_one();
            true
         }
         None => false,
      }
   }

   /// Resolves when a batch has been sealed since the last call.
   pub fn ready(&self) -> Notified<'_> {
      self.ready.notified()
   }

   /// Takes every sealed batch, oldest first. Leaves the open buffer alone.
   pub fn take_sealed(&self) -> Vec<Batch> {
      self.state.lock().sealed.drain(..).collect()
   }

   /// Timer flush: takes every sealed batch and then cuts the open buffer into
   /// one more batch if it is non-empty. Does nothing to the open buffer once
   /// the timer has been disabled by [`drain`](Self::drain).
   pub fn take_due(&self) -> Vec<Batch> {
      let mut state = self.state.lock();
      if state.timer_enabled && !state.open.is_empty() {
         let sequence = state.seal(self.max_batch_size);
         trace!(sequence, "Batch sealed by age");
      }
      state.sealed.drain(..).collect()
   }

   /// Puts batches whose delivery failed back at the front of the queue, in the
   /// order given, and counts the failed attempt on the first of them.
   pub fn requeue(&self, mut batches: Vec<Batch>) {
      if let Some(failed) = batches.first_mut() {
         failed.attempts += 1;
      }
      let mut state = self.state.lock();
      for batch in batches.into_iter().rev() {
         debug!(sequence = batch.sequence, attempts = batch.attempts, "Batch requeued");
         state.sealed.push_front(batch);
      }
   }

   /// Shutdown flush: disables the age trigger and takes everything left.
   ///
   /// Sealed batches come first. The open buffer is cut into batches of at most
   /// `max_batch_size`, so fewer than `max_batch_size` buffered events always
   /// yield exactly one final batch.
   pub fn drain(&self) -> Vec<Batch> {
      let mut state = self.state.lock();
      state.timer_enabled = false;
      if !state.open.is_empty() {
         let mut events = mem::take(&mut state.open);
         while !events.is_empty() {
            let rest = events.split_off(events.len().min(self.max_batch_size));
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.sealed.push_back(Batch::new(sequence, events));
            events = rest;
         }
      }
      let batches: Vec<Batch> = state.sealed.drain(..).collect();
      debug!(batches = batches.len(), "Accumulator drained");
      batches
   }

   /// Re-enables the age trigger after a drain.
   pub fn resume(&self) {
      self.state.lock().timer_enabled = true;
   }

   /// Whether the age trigger is active.
   pub fn is_timer_enabled(&self) -> bool {
      self.state.lock().timer_enabled
   }

   /// Number of events held, sealed or not.
   pub fn len(&self) -> usize {
      let state = self.state.lock();
      state.open.len() + state.sealed.iter().map(Batch::len).sum::<usize>()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::event::Record;
   use sqlx_sqlite_cdc_transport::{ChangeOperation, ColumnValue};

   fn event(id: i64) -> ChangeEvent {
      let mut record = Record::new();
      record.insert("id".into(), ColumnValue::Integer(id));
      ChangeEvent::new("foo", ChangeOperation::Insert, record)
   }

   fn ids(batch: &Batch) -> Vec<i64> {
      batch
         .events
         .iter()
         .filter_map(|e| e.get("id").and_then(ColumnValue::as_integer))
         .collect()
   }

   #[test]
   fn test_push_seals_at_max_size() {
      let acc = BatchAccumulator::new(3, Duration::from_secs(5));

      assert!(!acc.push(event(1)));
      assert!(!acc.push(event(2)));
      assert!(acc.take_sealed().is_empty());
      assert!(acc.push(event(3)));

      let batches = acc.take_sealed();
      assert_eq!(batches.len(), 1);
      assert_eq!(ids(&batches[0]), vec![1, 2, 3]);
      assert!(acc.is_empty());
   }

   #[test]
   fn test_batches_cover_push_order() {
      let acc = BatchAccumulator::new(4, Duration::from_secs(5));
      let mut delivered = Vec::new();

      for id in 1..=10 {
         acc.push(event(id));
         if id % 3 == 0 {
            delivered.extend(acc.take_due());
         }
      }
      delivered.extend(acc.take_due());

      let all: Vec<i64> = delivered.iter().flat_map(ids).collect();
      assert_eq!(all, (1..=10).collect::<Vec<_>>());
      assert!(delivered.iter().all(|b| b.len() <= 4));

      let sequences: Vec<u64> = delivered.iter().map(|b| b.sequence).collect();
      assert!(sequences.windows(2).all(|w| w[0] < w[1]));
   }

   #[test]
   fn test_take_due_cuts_partial_buffer() {
      let acc = BatchAccumulator::new(10, Duration::from_secs(5));
      assert!(acc.take_due().is_empty());

      acc.push(event(1));
      acc.push(event(2));
      let batches = acc.take_due();
      assert_eq!(batches.len(), 1);
      assert_eq!(ids(&batches[0]), vec![1, 2]);
      assert!(acc.is_empty());
   }

   #[test]
   fn test_requeue_goes_ahead_of_new_events() {
      let acc = BatchAccumulator::new(2, Duration::from_secs(5));
      acc.push(event(1));
      acc.push(event(2));
      let failed = acc.take_sealed();

      // Arrive while the failed batch is in flight
      acc.push(event(3));
      acc.push(event(4));
      acc.push(event(5));

      acc.requeue(failed);
      let batches = acc.take_due();
      assert_eq!(batches.len(), 3);
      assert_eq!(ids(&batches[0]), vec![1, 2]);
      assert_eq!(batches[0].attempts, 1);
      assert_eq!(batches[0].sequence, 1);
      assert_eq!(ids(&batches[1]), vec![3, 4]);
      assert_eq!(ids(&batches[2]), vec![5]);
   }

   #[test]
   fn test_requeue_keeps_order_of_undelivered_tail() {
      let acc = BatchAccumulator::new(1, Duration::from_secs(5));
      acc.push(event(1));
      acc.push(event(2));
      acc.push(event(3));

      let mut batches = acc.take_sealed();
      batches.remove(0);
      acc.requeue(batches);

      let retried = acc.take_sealed();
      assert_eq!(retried.iter().flat_map(ids).collect::<Vec<_>>(), vec![2, 3]);
      assert_eq!(retried[0].attempts, 1);
      assert_eq!(retried[1].attempts, 0);
   }

   #[test]
   fn test_drain_yields_single_partial_batch() {
      let acc = BatchAccumulator::new(5, Duration::from_secs(5));
      acc.push(event(1));
      acc.push(event(2));

      let batches = acc.drain();
      assert_eq!(batches.len(), 1);
      assert_eq!(ids(&batches[0]), vec![1, 2]);
      assert!(!acc.is_timer_enabled());

      // Age trigger is off after a drain
      acc.push(event(3));
      assert!(acc.take_due().is_empty());
      assert_eq!(acc.len(), 1);

      acc.resume();
      assert_eq!(acc.take_due().len(), 1);
   }

   #[test]
   fn test_drain_sealed_first() {
      let acc = BatchAccumulator::new(2, Duration::from_secs(5));
      for id in 1..=3 {
         acc.push(event(id));
      }

      let batches = acc.drain();
      assert_eq!(batches.len(), 2);
      assert_eq!(ids(&batches[0]), vec![1, 2]);
      assert_eq!(ids(&batches[1]), vec![3]);
      assert!(acc.drain().is_empty());
   }
}
