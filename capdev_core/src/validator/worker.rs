use super::{Result, TokenValidator, ValidatorError};
use crate::token::{Envelope, ValidationResult};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

struct ValidationJob {
    envelope: Envelope,
    reply: oneshot::Sender<Result<ValidationResult>>,
}

/// Dedicated task that owns a validator and answers validation jobs one at a
/// time, so request handlers only ever await a reply channel
pub struct ValidatorWorker<V> {
    validator: V,
    job_rx: mpsc::Receiver<ValidationJob>,
}

impl<V: TokenValidator + 'static> ValidatorWorker<V> {
    /// Create a worker with the given queue capacity and a handle to reach it
    pub fn new(validator: V, capacity: usize) -> (Self, ValidatorHandle) {
        let (job_tx, job_rx) = mpsc::channel(capacity);
        debug!("Creating validator worker with capacity {}", capacity);

        (
            Self { validator, job_rx },
            ValidatorHandle { job_tx },
        )
    }

    /// Spawn the worker on the current runtime and return its handle
    pub fn spawn(validator: V, capacity: usize) -> ValidatorHandle {
        let (worker, handle) = Self::new(validator, capacity);
        tokio::spawn(worker.run());
        handle
    }

    /// Run until every handle has been dropped
    pub async fn run(mut self) {
        info!("Starting validator worker");

        while let Some(job) = self.job_rx.recv().await {
            let result = self.validator.validate(&job.envelope).await;
            // The requester may have gone away; nothing to do then
            let _ = job.reply.send(result);
        }

        info!("Validator worker shutting down");
    }
}

/// Cloneable sender side of a [`ValidatorWorker`]
#[derive(Debug, Clone)]
pub struct ValidatorHandle {
    job_tx: mpsc::Sender<ValidationJob>,
}

#[async_trait]
impl TokenValidator for ValidatorHandle {
    async fn validate(&self, envelope: &Envelope) -> Result<ValidationResult> {
        let (reply, response) = oneshot::channel();
        let job = ValidationJob {
            envelope: envelope.clone(),
            reply,
        };

        self.job_tx
            .send(job)
            .await
            .map_err(|_| ValidatorError::WorkerUnavailable)?;

        response
            .await
            .map_err(|_| ValidatorError::WorkerUnavailable)?
    }
}
