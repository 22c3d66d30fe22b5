//! Threaded pipeline stage (spec §4.2 "Stage / ThreadedStage").
//!
//! Grounded on `ci2-async::ThreadedAsyncCamera`: a worker thread owns the
//! actual processing loop, `thread_control` hands out a cooperative
//! stop-flag/join-handle pair, and the stage itself is just the `Arc<Mutex<_>>`
//! wrapped state the worker thread locks once per item.

use crate::queue::{Queue, QueuePolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage '{0}' is already running")]
    AlreadyRunning(String),
    #[error("stage '{0}' is not running")]
    NotRunning(String),
    #[error("no input queue registered for publisher '{0}'")]
    UnknownPublisher(String),
    #[error("input queue for stage '{0}' is disconnected")]
    QueueDisconnected(String),
}

/// Per-item processing logic for one pipeline node.
///
/// Implementations are free to hold their own interior-mutable state (locks,
/// counters); `process` runs on the stage's single worker thread, so no
/// additional synchronization is required within one stage.
pub trait Stage: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Consume one input item, optionally producing one output item.
    /// Returning `None` drops the item silently (e.g. a frame a denoise
    /// variant decides not to forward during loopback bootstrap).
    fn process(&mut self, input: Self::Input) -> Option<Self::Output>;

    fn name(&self) -> &str;
}

/// Wraps a [`Stage`] with a dedicated worker thread, named input queues (one
/// per upstream publisher), and fan-out to named downstream subscribers
/// (spec §4.2, §5 "one thread per stage").
pub struct ThreadedStage<S: Stage> {
    name: String,
    inner: Arc<Mutex<S>>,
    inputs: Mutex<HashMap<String, Arc<Queue<S::Input>>>>,
    subscribers: Mutex<HashMap<String, crossbeam_send::Sender<S::Output>>>,
    control: Mutex<Option<(thread_control::Control, std::thread::JoinHandle<()>)>>,
    default_queue_capacity: usize,
    default_policy: QueuePolicy,
}

/// Local alias kept separate from `channellib` so stage fan-out can reuse
/// plain queues without re-wrapping every subscriber as a full [`Queue`].
mod crossbeam_send {
    pub use channellib::Sender;
}

impl<S: Stage> ThreadedStage<S> {
    pub fn new(stage: S, default_queue_capacity: usize, default_policy: QueuePolicy) -> Arc<Self> {
        let name = stage.name().to_string();
        Arc::new(ThreadedStage {
            name,
            inner: Arc::new(Mutex::new(stage)),
            inputs: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            control: Mutex::new(None),
            default_queue_capacity,
            default_policy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an input queue fed by the named upstream publisher.
    pub fn add_input(&self, publisher: impl Into<String>) -> Arc<Queue<S::Input>> {
        let publisher = publisher.into();
        let queue = Arc::new(Queue::new(
            format!("{}<-{}", self.name, publisher),
            self.default_queue_capacity,
            self.default_policy,
        ));
        self.inputs.lock().insert(publisher, queue.clone());
        queue
    }

    /// Push directly to this stage's input queue from `publisher`, failing
    /// if no such input was registered (spec §4.2: "input queues keyed by
    /// publisher name").
    pub fn push(&self, publisher: &str, item: S::Input) -> Result<(), StageError> {
        let inputs = self.inputs.lock();
        let queue = inputs
            .get(publisher)
            .ok_or_else(|| StageError::UnknownPublisher(publisher.to_string()))?;
        queue
            .push(item)
            .map_err(|_| StageError::QueueDisconnected(self.name.clone()))
    }

    /// Register a downstream subscriber by name; its sender receives every
    /// output this stage produces (spec §4.2 "subscriber fan-out").
    pub fn add_subscriber(&self, name: impl Into<String>, sender: channellib::Sender<S::Output>) {
        self.subscribers.lock().insert(name.into(), sender);
    }

    pub fn remove_subscriber(&self, name: &str) {
        self.subscribers.lock().remove(name);
    }

    /// Send to exactly one named subscriber rather than fanning out to all
    /// (spec §4.2: HDR injection and denoise side-channel outputs need this).
    pub fn send_to_specific_subscriber(&self, name: &str, item: S::Output)
    where
        S::Output: Clone,
    {
        let subs = self.subscribers.lock();
        if let Some(sender) = subs.get(name) {
            if let Err(e) = sender.send(item) {
                tracing::warn!(stage = %self.name, subscriber = name, error = %e, "subscriber disconnected");
            }
        } else {
            tracing::warn!(stage = %self.name, subscriber = name, "no such subscriber");
        }
    }

    fn fan_out(&self, item: S::Output)
    where
        S::Output: Clone,
    {
        let subs = self.subscribers.lock();
        for (name, sender) in subs.iter() {
            if let Err(e) = sender.send(item.clone()) {
                tracing::warn!(stage = %self.name, subscriber = name, error = %e, "subscriber disconnected");
            }
        }
    }

    /// Start the worker thread. It round-robins the registered input queues
    /// with a short timeout so `stop()` is observed promptly even when idle.
    pub fn start(self: &Arc<Self>) -> Result<(), StageError>
    where
        S::Output: Clone,
    {
        let mut control_slot = self.control.lock();
        if control_slot.is_some() {
            return Err(StageError::AlreadyRunning(self.name.clone()));
        }

        let (flag, control) = thread_control::make_pair();
        let this = self.clone();
        let builder = std::thread::Builder::new().name(format!("stage-{}", self.name));
        let join_handle = builder
            .spawn(move || {
                tracing::debug!(stage = %this.name, "worker thread started");
                while flag.is_alive() {
                    let queues: Vec<_> = this.inputs.lock().values().cloned().collect();
                    if queues.is_empty() {
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        continue;
                    }
                    let mut processed_any = false;
                    for queue in &queues {
                        if let Some(item) = queue.pop_timeout(std::time::Duration::from_millis(20)) {
                            processed_any = true;
                            let output = this.inner.lock().process(item);
                            if let Some(output) = output {
                                this.fan_out(output);
                            }
                        }
                        if !flag.is_alive() {
                            break;
                        }
                    }
                    if !processed_any {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }
                tracing::debug!(stage = %this.name, "worker thread stopped");
            })
            .expect("failed to spawn stage worker thread");

        *control_slot = Some((control, join_handle));
        Ok(())
    }

    /// Signal the worker thread to stop and join it.
    pub fn stop(self: &Arc<Self>) -> Result<(), StageError> {
        let control_and_handle = self.control.lock().take();
        match control_and_handle {
            Some((mut control, handle)) => {
                control.stop();
                let _ = handle.join();
                Ok(())
            }
            None => Err(StageError::NotRunning(self.name.clone())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.control.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;
    impl Stage for Double {
        type Input = u32;
        type Output = u32;
        fn process(&mut self, input: u32) -> Option<u32> {
            Some(input * 2)
        }
        fn name(&self) -> &str {
            "double"
        }
    }

    #[test]
    fn processes_items_and_fans_out_to_subscribers() {
        let stage = ThreadedStage::new(Double, 8, QueuePolicy::Blocking);
        let input = stage.add_input("src");
        let (tx, rx) = channellib::bounded(8);
        stage.add_subscriber("sink", tx);
        stage.start().unwrap();

        input.push(21).unwrap();
        let out = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(out, 42);

        stage.stop().unwrap();
    }

    #[test]
    fn stop_without_start_errors() {
        let stage = ThreadedStage::new(Double, 8, QueuePolicy::Blocking);
        assert!(stage.stop().is_err());
    }

    #[test]
    fn double_start_errors() {
        let stage = ThreadedStage::new(Double, 8, QueuePolicy::Blocking);
        stage.start().unwrap();
        assert!(stage.start().is_err());
        stage.stop().unwrap();
    }
}
