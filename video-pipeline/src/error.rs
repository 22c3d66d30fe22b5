//! Unified error type for the denoise/HDR engines (spec §7 "Error Handling
//! Design"). Propagation policy: `process`-like entry points return this,
//! callers log and drop the frame rather than tearing the pipeline down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("buffer allocation error: {0}")]
    BufferAllocationError(String),
    #[error("buffer not found: {0}")]
    BufferNotFound(String),
    #[error("uninitialized: {0}")]
    Uninitialized(String),
    #[error("pipeline error: {0}")]
    PipelineError(String),
    #[error("dma error: {0}")]
    DmaError(String),
    #[error("media library error: {0}")]
    MediaLibraryError(String),
    #[error(transparent)]
    Accelerator(#[from] accel_rt::Error),
    #[error(transparent)]
    IspControl(#[from] isp_ctl::Error),
    #[error(transparent)]
    DmaFrame(#[from] dma_frame::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
