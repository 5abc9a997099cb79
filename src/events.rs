//! Events emitted by the supervision engine.
//!
//! The engine pushes an `EngineEvent` for every log line it records and every
//! status transition. The daemon forwards them to connected clients.

use crate::output::LogLine;
use crate::service::ServiceStatus;

/// Capacity of the engine event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A line was appended to a service's log buffer.
    Log { service: String, line: LogLine },
    /// A service changed status.
    State(StateChange),
}

/// A status transition of one service.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub service: String,
    pub status: ServiceStatus,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub run_count: u32,
}
