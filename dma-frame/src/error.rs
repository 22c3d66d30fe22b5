//! Error categories shared across the pipeline (spec §7).
//!
//! Mirrors the teacher's per-module error enum shape (`ci2::Error`): one
//! `thiserror` enum, `#[from]` conversions at the edges, no panics on the
//! hot path.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("buffer allocation error: {0}")]
    BufferAllocationError(String),

    #[error("buffer not found: {0}")]
    BufferNotFound(String),

    #[error("component not initialized: {0}")]
    Uninitialized(String),

    #[error("pipeline error: {0}")]
    PipelineError(String),

    #[error("dma error: {0}")]
    DmaError(String),

    #[error("media library error: {0}")]
    MediaLibraryError(String),

    /// Passthrough for the accelerator runtime's own error type (spec:
    /// `HAILORT_ERROR`), the same role `ci2::Error::BackendError` plays for
    /// `anyhow::Error` in the teacher crate.
    #[error("accelerator runtime error: {0}")]
    Accelerator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
