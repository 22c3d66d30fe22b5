//! Pluggable accelerator backend trait (spec §6 "Accelerator runtime").
//!
//! Real hardware implementations wrap the platform's inference-scheduler
//! client; [`FakeBackend`] is the in-process reference used by tests and by
//! the `video-pipelined` binary when no accelerator is attached.

use crate::binding::NetworkBindings;
use crate::error::Result;
use std::time::Duration;

/// A handle to one in-flight asynchronous inference job.
pub trait AsyncJob: Send {
    /// Mark the job detached: the caller no longer intends to wait on it
    /// directly, completion still runs the callback given to
    /// [`AcceleratorBackend::run_async`] (spec §4.5: "submit and forget;
    /// completion delivered out of band"). Callers may still retain the
    /// handle afterwards purely to join it at shutdown, matching the
    /// original's `job->detach(); m_last_infer_job = job.release();`.
    fn detach(&self);

    /// Block until this job completes or the timeout elapses.
    fn wait(&self, timeout: Duration) -> Result<()>;
}

/// One configured network on the accelerator.
pub trait AcceleratorBackend: Send + Sync {
    /// Load and configure a network, matching the engine's
    /// `set_config` contract (spec §4.4.1): idempotent when the same
    /// `network_path` is already configured.
    fn configure(
        &self,
        network_path: &str,
        batch_size: u16,
        scheduler_threshold: u32,
        scheduler_timeout: Duration,
    ) -> Result<()>;

    /// Block until the accelerator has a free inference slot.
    fn wait_for_async_ready(&self, timeout: Duration) -> Result<()>;

    /// Submit one inference asynchronously. `on_complete` runs on the
    /// backend's own completion thread once the job finishes (spec §4.5,
    /// §5 "FIFO ordering assumption": completions for jobs submitted to one
    /// network arrive in submission order).
    fn run_async(
        &self,
        bindings: NetworkBindings,
        on_complete: Box<dyn FnOnce(Result<()>) + Send>,
    ) -> Result<Box<dyn AsyncJob>>;
}

/// In-process reference backend: runs "inference" synchronously on a
/// detached thread and invokes the completion callback immediately. Useful
/// for exercising [`crate::AsyncInferenceBinding`]'s bookkeeping without
/// real hardware.
pub struct FakeBackend {
    configured: parking_lot::Mutex<Option<String>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        FakeBackend {
            configured: parking_lot::Mutex::new(None),
        }
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

struct FakeJob {
    handle: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl AsyncJob for FakeJob {
    fn detach(&self) {
        // The thread runs the completion callback on its own; nothing to do.
    }

    fn wait(&self, _timeout: Duration) -> Result<()> {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl AcceleratorBackend for FakeBackend {
    fn configure(
        &self,
        network_path: &str,
        _batch_size: u16,
        _scheduler_threshold: u32,
        _scheduler_timeout: Duration,
    ) -> Result<()> {
        *self.configured.lock() = Some(network_path.to_string());
        Ok(())
    }

    fn wait_for_async_ready(&self, _timeout: Duration) -> Result<()> {
        if self.configured.lock().is_none() {
            return Err(crate::error::Error::ConfigurationError(
                "backend not configured".into(),
            ));
        }
        Ok(())
    }

    fn run_async(
        &self,
        _bindings: NetworkBindings,
        on_complete: Box<dyn FnOnce(Result<()>) + Send>,
    ) -> Result<Box<dyn AsyncJob>> {
        let handle = std::thread::Builder::new()
            .name("fake-accel-job".into())
            .spawn(move || {
                on_complete(Ok(()));
            })
            .expect("failed to spawn fake accelerator job thread");
        Ok(Box::new(FakeJob {
            handle: parking_lot::Mutex::new(Some(handle)),
        }))
    }
}
