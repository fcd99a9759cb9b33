mod error;
mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub use error::ValidatorError;
pub use worker::{ValidatorHandle, ValidatorWorker};

use crate::capbac::CapbacCli;
use crate::config::CapbacConfig;
use crate::token::{Envelope, ValidationResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub type Result<T> = std::result::Result<T, ValidatorError>;

// Default queue depth for the dedicated validator worker
pub const DEFAULT_WORKER_CAPACITY: usize = 64;

/// Decides whether a capability-token envelope is currently authorized
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, envelope: &Envelope) -> Result<ValidationResult>;
}

#[async_trait]
impl<T: TokenValidator + ?Sized> TokenValidator for Arc<T> {
    async fn validate(&self, envelope: &Envelope) -> Result<ValidationResult> {
        (**self).validate(envelope).await
    }
}

/// Validates envelopes with `capbac validate`
#[async_trait]
impl TokenValidator for CapbacCli {
    async fn validate(&self, envelope: &Envelope) -> Result<ValidationResult> {
        let output = CapbacCli::validate(self, &envelope.raw).await?;
        debug!("Validation result: {}", output.trim());
        Ok(ValidationResult::from_output(&output)?)
    }
}

/// The configured production validator. Spawns the worker task when
/// `worker` is set, so this must run inside a tokio runtime.
pub fn from_config(config: &CapbacConfig) -> Arc<dyn TokenValidator> {
    let cli = config.cli();
    if config.worker {
        Arc::new(ValidatorWorker::spawn(cli, config.worker_queue))
    } else {
        Arc::new(cli)
    }
}
