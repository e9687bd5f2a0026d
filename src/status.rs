use std::fmt;

use serde::Serialize;

/// Lifecycle state of a [`Pipeline`](crate::Pipeline).
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, plus
/// `Starting | Running -> Errored -> Stopping -> Stopped` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
   #[default]
   Stopped,
   Starting,
   Running,
   Stopping,
   Errored,
}

impl fmt::Display for LifecycleState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         LifecycleState::Stopped => f.write_str("stopped"),
         LifecycleState::Starting => f.write_str("starting"),
         LifecycleState::Running => f.write_str("running"),
         LifecycleState::Stopping => f.write_str("stopping"),
         LifecycleState::Errored => f.write_str("errored"),
      }
   }
}

/// Point-in-time view of a pipeline for monitoring and health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
   pub running: bool,
   /// Events held in memory, sealed or not, awaiting delivery.
   pub buffered_event_count: usize,
   pub subscribed_tables: Vec<String>,
   pub state: LifecycleState,
}
