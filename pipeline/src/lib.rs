//! Threaded stage/queue pipeline framework (spec §4.2).
//!
//! One worker thread per [`Stage`], bounded [`Queue`]s with a blocking or
//! leaky overflow policy between them, and a [`Pipeline`] that owns
//! upstream-first start / downstream-first stop ordering across the whole
//! graph.

mod graph;
mod queue;
mod stage;

pub use graph::{Pipeline, PipelineNode};
pub use queue::{PushError, Queue, QueuePolicy};
pub use stage::{Stage, StageError, ThreadedStage};

pub use channellib::Sender;
