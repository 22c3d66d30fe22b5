use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("control '{0}' not present on this device")]
    ControlNotPresent(String),
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("isp/v4l2 io error: {0}")]
    Io(String),
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
