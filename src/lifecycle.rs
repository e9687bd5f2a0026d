//! Orchestrates connect, subscribe, batching and graceful drain.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use sqlx_sqlite_cdc_conn::ConnectionManager;
use sqlx_sqlite_cdc_transport::{ChangeTransport, HookTransport, ObservedWriter};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::accumulator::BatchAccumulator;
use crate::catchup::CatchUpReader;
use crate::config::CdcConfig;
use crate::delivery::{DeliveryPipeline, Sink};
use crate::error::{Error, Result};
use crate::registry::SubscriptionRegistry;
use crate::status::{LifecycleState, PipelineStatus};
use crate::watermark::Watermarks;

/// Lower bound on the disconnect wait once the shutdown budget is spent.
const MIN_DISCONNECT_WAIT: Duration = Duration::from_secs(1);

/// The CDC ingestion pipeline for one database.
///
/// `start()` connects, subscribes every configured table and starts the
/// delivery worker. `stop()` unsubscribes, lets an in-flight sink call finish,
/// drains the accumulator through the sink and disconnects. Buffered events
/// live in memory only; a crash loses whatever has not been delivered yet.
/// Events still buffered after a stop that timed out survive until the next
/// `start()` on the same pipeline.
///
/// # Example
///
/// ```no_run
/// use sqlite_cdc::{Batch, CdcConfig, Pipeline, SinkError};
///
/// # async fn example() -> sqlite_cdc::Result<()> {
/// let config = CdcConfig::new("app.db").with_tables(["users", "orders"]);
/// let pipeline = Pipeline::new(config, |batch: Batch| async move {
///    println!("{} changes", batch.len());
///    Ok::<(), SinkError>(())
/// })?;
///
/// pipeline.start().await?;
///
/// let mut writer = pipeline.acquire_writer().await?;
/// sqlx::query("INSERT INTO users (name) VALUES ('Alice')")
///    .execute(&mut *writer)
///    .await?;
/// drop(writer);
///
/// pipeline.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<S, T = HookTransport> {
   config: CdcConfig,
   connections: Arc<ConnectionManager>,
   registry: SubscriptionRegistry<T>,
   accumulator: Arc<BatchAccumulator>,
   delivery: Arc<DeliveryPipeline<S>>,
   catch_up: CatchUpReader,
   state: RwLock<LifecycleState>,
   shutdown: watch::Sender<bool>,
   // Held across start/stop so they never interleave
   worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Sink> Pipeline<S, HookTransport> {
   /// Creates a pipeline that captures writes through SQLite hooks.
   pub fn new(config: CdcConfig, sink: S) -> Result<Self> {
      config.validate()?;
      let connections = Arc::new(ConnectionManager::new(
         &config.database_path,
         Some(config.database.clone()),
      )?);
      let transport = HookTransport::new(Arc::clone(&connections));
      Ok(Self::build(config, sink, connections, transport))
   }

   /// Checks out the control connection with change capture enabled.
   ///
   /// Only writes made through the returned writer are observed in realtime.
   /// Drop it before calling [`stop`](Self::stop): a writer still held when
   /// the shutdown budget runs out makes `stop()` return [`Error::Shutdown`].
   pub async fn acquire_writer(&self) -> Result<ObservedWriter> {
      Ok(self.registry.transport().acquire_writer().await?)
   }
}

impl<S: Sink, T: ChangeTransport> Pipeline<S, T> {
   /// Creates a pipeline on a custom realtime transport.
   pub fn with_transport(config: CdcConfig, sink: S, transport: T) -> Result<Self> {
      config.validate()?;
      let connections = Arc::new(ConnectionManager::new(
         &config.database_path,
         Some(config.database.clone()),
      )?);
      Ok(Self::build(config, sink, connections, transport))
   }

   fn build(config: CdcConfig, sink: S, connections: Arc<ConnectionManager>, transport: T) -> Self {
      let accumulator = Arc::new(BatchAccumulator::new(
         config.max_batch_size,
         config.max_batch_age(),
      ));
      let watermarks = Arc::new(Watermarks::new());
      let registry = SubscriptionRegistry::new(
         Arc::new(transport),
         config.tables.iter().cloned(),
         Arc::clone(&accumulator),
      );
      let delivery = Arc::new(DeliveryPipeline::new(
         Arc::clone(&accumulator),
         watermarks,
         Arc::new(sink),
      ));
      let catch_up = CatchUpReader::new(Arc::clone(&connections), &config);
      let (shutdown, _) = watch::channel(true);

      Self {
         config,
         connections,
         registry,
         accumulator,
         delivery,
         catch_up,
         state: RwLock::new(LifecycleState::Stopped),
         shutdown,
         worker: Mutex::new(None),
      }
   }

   /// Connects, subscribes every configured table and starts the flush timer.
   ///
   /// No-op when already running. Legal only from `Stopped`; after a failed
   /// start the pipeline is `Errored` and must be stopped before retrying.
   pub async fn start(&self) -> Result<()> {
      let mut worker = self.worker.lock().await;

      match self.state() {
         LifecycleState::Running => return Ok(()),
         LifecycleState::Stopped => {}
         other => {
            return Err(Error::InvalidState {
               expected: "stopped",
               actual: other.to_string(),
            });
         }
      }

      self.set_state(LifecycleState::Starting);

      if let Err(e) = self.open().await {
         error!(error = %e, "Pipeline failed to start");
         self.set_state(LifecycleState::Errored);
         return Err(Error::Startup(Box::new(e)));
      }

      self.accumulator.resume();
      self.shutdown.send_replace(false);
      *worker = Some(Arc::clone(&self.delivery).spawn(self.shutdown.subscribe()));

      self.set_state(LifecycleState::Running);
      info!(
         tables = ?self.registry.subscribed_tables(),
         max_batch_size = self.config.max_batch_size,
         max_batch_age_ms = self.config.max_batch_age_ms,
         "Pipeline started"
      );
      Ok(())
   }

   async fn open(&self) -> Result<()> {
      self.connections.connect().await?;
      for table in self.config.table_names() {
         self.registry.subscribe(&table).await?;
      }
      Ok(())
   }

   /// Unsubscribes, drains buffered events through the sink and disconnects.
   ///
   /// Individual unsubscribe failures are logged, never returned. An in-flight
   /// sink call is allowed to finish. The worker, the final drain and the
   /// disconnect share one shutdown timeout. When it elapses, delivery is
   /// abandoned: undelivered events, including a batch the sink never
   /// acknowledged, stay buffered and are delivered after the next `start()`.
   /// The disconnect gets whatever budget is left, at least one second, and
   /// then stops waiting for connections still checked out, such as a writer
   /// that was not dropped. A failed or timed-out disconnect
   /// is returned as [`Error::Shutdown`], and the pipeline is `Stopped` either way.
   pub async fn stop(&self) -> Result<()> {
      let mut worker = self.worker.lock().await;

      if self.state() == LifecycleState::Stopped {
         return Ok(());
      }

      self.set_state(LifecycleState::Stopping);

      let failures = self.registry.unsubscribe_all();
      if !failures.is_empty() {
         warn!(failures = failures.len(), "Some tables failed to unsubscribe");
      }

      // Cancels the flush timer and any catch-up in progress
      self.shutdown.send_replace(true);

      let deadline = Instant::now() + self.config.shutdown_timeout();
      match worker.take() {
         Some(mut handle) => {
            let joined = timeout_at(deadline, &mut handle).await;
            match joined {
               Ok(Ok(())) => {}
               Ok(Err(e)) => {
                  error!(error = %e, "Delivery worker panicked");
                  self.delivery.requeue_abandoned();
               }
               Err(_) => {
                  handle.abort();
                  // The worker releases its batches once cancelled
                  let _ = handle.await;
                  self.abandon_delivery();
               }
            }
         }
         None => {
            // Start failed before the worker was spawned
            if timeout_at(deadline, self.delivery.drain()).await.is_err() {
               self.abandon_delivery();
            }
         }
      }

      let remaining = deadline
         .saturating_duration_since(Instant::now())
         .max(MIN_DISCONNECT_WAIT);
      let disconnected = self.connections.disconnect_within(remaining).await;
      self.set_state(LifecycleState::Stopped);

      match disconnected {
         Ok(()) => {
            info!("Pipeline stopped");
            Ok(())
         }
         Err(e) => {
            error!(error = %e, "Disconnect failed during shutdown");
            Err(Error::Shutdown(Box::new(e.into())))
         }
      }
   }

   fn abandon_delivery(&self) {
      let in_flight = self.delivery.requeue_abandoned();
      warn!(
         timeout_ms = self.config.shutdown_timeout_ms,
         in_flight,
         buffered = self.accumulator.len(),
         "Shutdown timeout elapsed, undelivered events stay buffered until the next start"
      );
   }

   /// Replays rows of `table` changed since its watermark through the accumulator.
   ///
   /// Without a watermark the configured lookback window is read. Events join
   /// the live stream and share its batching and retry. Cancelled by `stop()`.
   /// Returns the number of events replayed.
   pub async fn catch_up(&self, table: &str) -> Result<usize> {
      let state = self.state();
      if state != LifecycleState::Running {
         return Err(Error::InvalidState {
            expected: "running",
            actual: state.to_string(),
         });
      }

      let since = self.delivery.watermarks().get(table);
      let mut events = self.catch_up.perform_initial_sync(table, since)?;
      let cancelled = cancelled(self.shutdown.subscribe());
      tokio::pin!(cancelled);

      let mut replayed = 0;
      loop {
         tokio::select! {
            biased;
            _ = &mut cancelled => {
               debug!(table = %table, replayed, "Catch-up cancelled");
               return Err(Error::Cancelled);
            }
            next = events.next() => match next {
               Some(event) => {
                  self.accumulator.push(event?);
                  replayed += 1;
               }
               None => break,
            }
         }
      }

      info!(table = %table, replayed, since = ?since, "Catch-up complete");
      Ok(replayed)
   }

   /// Connectivity check on the query pool.
   ///
   /// A failed check while running moves the pipeline to `Errored`.
   pub async fn check_health(&self) -> Result<()> {
      match self.connections.ping().await {
         Ok(()) => Ok(()),
         Err(e) => {
            let mut state = self.state.write();
            if *state == LifecycleState::Running {
               warn!(error = %e, "Health check failed, pipeline errored");
               *state = LifecycleState::Errored;
            }
            Err(e.into())
         }
      }
   }

   /// Delivers everything currently buffered without waiting for a trigger.
   ///
   /// Waits for a delivery already in progress, so batches keep their order.
   pub async fn flush(&self) -> Result<usize> {
      self.delivery.flush_due().await
   }

   pub fn status(&self) -> PipelineStatus {
      let state = self.state();
      PipelineStatus {
         running: state == LifecycleState::Running,
         buffered_event_count: self.accumulator.len(),
         subscribed_tables: self.registry.subscribed_tables(),
         state,
      }
   }

   pub fn state(&self) -> LifecycleState {
      *self.state.read()
   }

   fn set_state(&self, next: LifecycleState) {
      let mut state = self.state.write();
      debug!(from = %*state, to = %next, "Lifecycle transition");
      *state = next;
   }

   pub fn config(&self) -> &CdcConfig {
      &self.config
   }

   pub fn connections(&self) -> &Arc<ConnectionManager> {
      &self.connections
   }

   pub fn registry(&self) -> &SubscriptionRegistry<T> {
      &self.registry
   }

   pub fn accumulator(&self) -> &Arc<BatchAccumulator> {
      &self.accumulator
   }

   pub fn watermarks(&self) -> &Arc<Watermarks> {
      self.delivery.watermarks()
   }

   pub fn catch_up_reader(&self) -> &CatchUpReader {
      &self.catch_up
   }
}

async fn cancelled(mut shutdown: watch::Receiver<bool>) {
   let _ = shutdown.wait_for(|stopped| *stopped).await;
}
