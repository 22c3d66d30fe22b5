//! Ordered collection of stages started/stopped together (spec §4.2
//! "Pipeline"): a thin DAG wrapper that owns start order and guarantees
//! reverse-order shutdown so downstream stages never get starved mid-flush.

use crate::stage::StageError;
use std::sync::Arc;

/// Object-safe handle a [`Pipeline`] can start/stop without knowing the
/// concrete [`crate::Stage`] impl or its item types.
pub trait PipelineNode: Send + Sync {
    fn node_name(&self) -> &str;
    fn node_start(&self) -> Result<(), StageError>;
    fn node_stop(&self) -> Result<(), StageError>;
    fn node_is_running(&self) -> bool;
}

impl<S> PipelineNode for Arc<crate::stage::ThreadedStage<S>>
where
    S: crate::stage::Stage,
    S::Output: Clone,
{
    fn node_name(&self) -> &str {
        crate::stage::ThreadedStage::name(self)
    }
    fn node_start(&self) -> Result<(), StageError> {
        crate::stage::ThreadedStage::start(self)
    }
    fn node_stop(&self) -> Result<(), StageError> {
        crate::stage::ThreadedStage::stop(self)
    }
    fn node_is_running(&self) -> bool {
        crate::stage::ThreadedStage::is_running(self)
    }
}

/// A DAG of stages, started upstream-first and stopped downstream-first
/// (spec §4.2, §5: stop order matters so a stage never blocks waiting on
/// input from one that has already exited).
pub struct Pipeline {
    name: String,
    nodes: Vec<Arc<dyn PipelineNode>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Pipeline {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Register a node. Registration order is start order; stop happens in
    /// reverse.
    pub fn add_node(&mut self, node: Arc<dyn PipelineNode>) {
        self.nodes.push(node);
    }

    pub fn start(&self) -> Result<(), StageError> {
        for node in &self.nodes {
            tracing::info!(pipeline = %self.name, stage = node.node_name(), "starting stage");
            node.node_start()?;
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<(), StageError> {
        for node in self.nodes.iter().rev() {
            tracing::info!(pipeline = %self.name, stage = node.node_name(), "stopping stage");
            node.node_stop()?;
        }
        Ok(())
    }

    pub fn is_fully_running(&self) -> bool {
        self.nodes.iter().all(|n| n.node_is_running())
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node_name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Stage, ThreadedStage};
    use crate::QueuePolicy;

    struct Passthrough;
    impl Stage for Passthrough {
        type Input = u32;
        type Output = u32;
        fn process(&mut self, input: u32) -> Option<u32> {
            Some(input)
        }
        fn name(&self) -> &str {
            "passthrough"
        }
    }

    #[test]
    fn starts_upstream_first_and_stops_downstream_first() {
        let a = ThreadedStage::new(Passthrough, 4, QueuePolicy::Blocking);
        let b = ThreadedStage::new(Passthrough, 4, QueuePolicy::Blocking);
        let mut pipeline = Pipeline::new("test");
        pipeline.add_node(a.clone());
        pipeline.add_node(b.clone());

        pipeline.start().unwrap();
        assert!(pipeline.is_fully_running());
        assert_eq!(pipeline.node_names(), vec!["passthrough", "passthrough"]);

        pipeline.stop().unwrap();
        assert!(!a.is_running());
        assert!(!b.is_running());
    }
}
