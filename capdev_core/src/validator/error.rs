use crate::capbac::CapbacError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("Validator call failed: {0}")]
    Capbac(#[from] CapbacError),

    #[error("Malformed validator output: {0}")]
    MalformedOutput(#[from] serde_json::Error),

    #[error("Validator worker unavailable")]
    WorkerUnavailable,
}
