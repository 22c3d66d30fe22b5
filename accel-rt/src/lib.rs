//! Async binding layer over the on-device AI accelerator runtime (spec §4.5,
//! §6 "Accelerator runtime").

mod backend;
mod binding;
mod error;
mod runtime;

pub use backend::{AcceleratorBackend, AsyncJob, FakeBackend};
pub use binding::{NetworkBindings, TensorBinding};
pub use error::{Error, Result};
pub use runtime::AsyncInferenceBinding;
