//! Hands due batches to the caller's sink and requeues them on failure.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, trace, warn};

use crate::accumulator::BatchAccumulator;
use crate::batch::Batch;
use crate::error::{Error, Result, SinkError};
use crate::watermark::Watermarks;

/// Downstream consumer of delivered batches.
///
/// Returning `Ok` means the batch is durably applied; the watermarks of the
/// tables it covers advance. Returning `Err` requeues the batch whole, and it is
/// retried on the next size or age trigger. A batch can therefore be written
/// more than once, so writes should be idempotent by primary key, operation and
/// source commit time.
///
/// Implemented for any `Fn(Batch) -> Future<Output = Result<(), SinkError>>`.
pub trait Sink: Send + Sync + 'static {
   fn write(&self, batch: Batch) -> impl Future<Output = std::result::Result<(), SinkError>> + Send;
}

impl<F, Fut> Sink for F
where
   F: Fn(Batch) -> Fut + Send + Sync + 'static,
   Fut: Future<Output = std::result::Result<(), SinkError>> + Send,
{
   fn write(&self, batch: Batch) -> impl Future<Output = std::result::Result<(), SinkError>> + Send {
      self(batch)
   }
}

/// Moves batches from the accumulator to the sink.
///
/// Delivery is single-owner: the worker, [`flush_due`](Self::flush_due) and
/// every other delivering method take turns, so at most one sink call is in
/// flight and batches reach the sink in the order they were sealed.
pub struct DeliveryPipeline<S> {
   accumulator: Arc<BatchAccumulator>,
   watermarks: Arc<Watermarks>,
   sink: Arc<S>,
   // Held from taking batches until they are delivered or requeued
   delivering: Mutex<()>,
   // Taken from the accumulator, not yet acknowledged by the sink
   in_flight: parking_lot::Mutex<VecDeque<Batch>>,
}

impl<S: Sink> DeliveryPipeline<S> {
   pub fn new(accumulator: Arc<BatchAccumulator>, watermarks: Arc<Watermarks>, sink: Arc<S>) -> Self {
      Self {
         accumulator,
         watermarks,
         sink,
         delivering: Mutex::new(()),
         in_flight: parking_lot::Mutex::new(VecDeque::new()),
      }
   }

   pub fn accumulator(&self) -> &Arc<BatchAccumulator> {
      &self.accumulator
   }

   pub fn watermarks(&self) -> &Arc<Watermarks> {
      &self.watermarks
   }

   /// Delivers one batch.
   ///
   /// On success, advances each covered table's watermark to the batch's latest
   /// source commit time for that table. On failure the batch is requeued at the
   /// front of the accumulator and [`Error::Delivery`] is returned.
   pub async fn deliver(&self, batch: Batch) -> Result<()> {
      self.deliver_all(vec![batch]).await.map(|_| ())
   }

   /// Delivers batches in order, stopping at the first failure.
   ///
   /// The failed batch and everything after it go back to the front of the
   /// accumulator, still in order. Returns the number of batches delivered.
   pub async fn deliver_all(&self, batches: Vec<Batch>) -> Result<usize> {
      let _delivering = self.delivering.lock().await;
      self.deliver_in_order(batches).await
   }

   /// Delivers batches sealed by the size trigger.
   pub async fn flush_sealed(&self) -> Result<usize> {
      let _delivering = self.delivering.lock().await;
      let batches = self.accumulator.take_sealed();
      self.deliver_in_order(batches).await
   }

   /// Age trigger: delivers sealed batches plus whatever is buffered.
   pub async fn flush_due(&self) -> Result<usize> {
      let _delivering = self.delivering.lock().await;
      let batches = self.accumulator.take_due();
      self.deliver_in_order(batches).await
   }

   /// Disables the age trigger and delivers everything left.
   pub async fn drain(&self) -> Result<usize> {
      let _delivering = self.delivering.lock().await;
      let batches = self.accumulator.drain();
      self.deliver_in_order(batches).await
   }

   /// Puts batches left behind by a cancelled delivery back at the front of
   /// the accumulator, ahead of anything buffered since.
   ///
   /// Does nothing while a delivery is still running. Returns the number of
   /// events requeued.
   pub(crate) fn requeue_abandoned(&self) -> usize {
      let Ok(_delivering) = self.delivering.try_lock() else {
         return 0;
      };
      let abandoned: Vec<Batch> = self.in_flight.lock().drain(..).collect();
      let events = abandoned.iter().map(Batch::len).sum();
      if !abandoned.is_empty() {
         self.accumulator.requeue(abandoned);
      }
      events
   }

   // Callers hold `delivering`
   async fn deliver_in_order(&self, batches: Vec<Batch>) -> Result<usize> {
      let total = batches.len();
      *self.in_flight.lock() = batches.into();
      let mut delivered = 0;

      loop {
         let next = self.in_flight.lock().front().cloned();
         let Some(batch) = next else {
            break;
         };
         let (sequence, events) = (batch.sequence, batch.len());

         if let Err(source) = self.try_deliver(batch).await {
            let err = Error::Delivery {
               sequence,
               events,
               source,
            };
            let requeued: Vec<Batch> = self.in_flight.lock().drain(..).collect();
            warn!(
               error = %err,
               delivered,
               requeued = requeued.len(),
               "Delivery failed, batches requeued"
            );
            self.accumulator.requeue(requeued);
            return Err(err);
         }

         self.in_flight.lock().pop_front();
         delivered += 1;
      }

      if total > 0 {
         trace!(delivered, "Batches delivered");
      }
      Ok(delivered)
   }

   async fn try_deliver(&self, batch: Batch) -> std::result::Result<(), SinkError> {
      if batch.is_empty() {
         return Ok(());
      }

      let (sequence, events, attempts) = (batch.sequence, batch.len(), batch.attempts);
      let commit_times: Vec<(String, OffsetDateTime)> = batch
         .max_commit_times()
         .into_iter()
         .map(|(table, commit_time)| (table.to_string(), commit_time))
         .collect();

      self.sink.write(batch).await?;

      debug!(sequence, events, attempts, "Batch delivered");
      for (table, commit_time) in commit_times {
         self.watermarks.advance(&table, commit_time);
      }
      Ok(())
   }
}

impl<S: Sink> DeliveryPipeline<S> {
   /// Spawns the delivery worker.
   ///
   /// The worker reacts to size-sealed batches and ticks every
   /// `max_batch_age`. A sink call in progress is never interrupted; the
   /// shutdown signal is observed between flushes. After shutdown the worker
   /// drains the accumulator before it exits.
   pub(crate) fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
      tokio::spawn(async move {
         let period = self.accumulator.max_batch_age();
         let mut ticker = interval_at(Instant::now() + period, period);
         ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

         debug!(period_ms = period.as_millis() as u64, "Delivery worker started");

         loop {
            tokio::select! {
               biased;
               changed = shutdown.changed() => {
                  if changed.is_err() || *shutdown.borrow() {
                     break;
                  }
               }
               _ = self.accumulator.ready() => {
                  // Failures are requeued and logged inside
                  let _ = self.flush_sealed().await;
               }
               _ = ticker.tick() => {
                  let _ = self.flush_due().await;
               }
            }
         }

         match self.drain().await {
            Ok(batches) => debug!(batches, "Delivery worker drained"),
            Err(e) => error!(
               error = %e,
               remaining = self.accumulator.len(),
               "Final drain failed, undelivered events remain in memory"
            ),
         }
      })
   }
}
