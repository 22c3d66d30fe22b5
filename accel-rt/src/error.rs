use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("accelerator not ready within timeout")]
    NotReady,
    #[error("accelerator backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
