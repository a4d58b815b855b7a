use crate::palette::CodecError;
use crate::params::ParamsError;
use crate::worker::WorkerError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No workers available")]
    NoWorkersAvailable,
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("Failed to encode image: {0}")]
    Codec(#[from] CodecError),
}

impl From<ParamsError> for DispatchError {
    fn from(e: ParamsError) -> Self {
        DispatchError::InvalidParameters(e.to_string())
    }
}
