use std::sync::Arc;
use std::time::Duration;

/// Describes one flush round of a [`crate::Scheduler`].
///
/// Tick descriptors exist for observability only: they are handed to deferred work, batch
/// functions and stats collectors, and nothing in the engine branches on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickDescriptor {
    /// Monotonically increasing index of the tick within its scheduler.
    pub index: u64,
    pub metadata: Option<TickMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickMetadata {
    /// Name of the scheduler that produced the tick.
    pub scheduler: Arc<str>,
    /// Number of ordinary work dispatches observed since the previous tick.
    pub dispatched_tasks: u64,
    /// Time elapsed since the previous tick (or since the scheduler was created).
    pub tick_delay: Duration,
}

impl TickDescriptor {
    pub fn new(index: u64, metadata: TickMetadata) -> Self {
        Self { index, metadata: Some(metadata) }
    }

    /// Descriptor used for physical calls that never went through a scheduler tick, such as
    /// those issued by the immediate dispatch strategy.
    pub fn immediate() -> Self {
        Self { index: 0, metadata: None }
    }
}
