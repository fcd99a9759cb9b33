use super::{Result, TokenValidator, ValidatorError};
use crate::capbac::CapbacError;
use crate::token::{Envelope, ValidationResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Validator with a fixed answer that counts how often it is asked
#[derive(Debug, Clone)]
pub(crate) struct MockValidator {
    answer: Option<bool>,
    calls: Arc<AtomicUsize>,
}

impl MockValidator {
    pub(crate) fn allowing() -> Self {
        Self::answering(Some(true))
    }

    pub(crate) fn denying() -> Self {
        Self::answering(Some(false))
    }

    /// A validator whose every call fails
    pub(crate) fn failing() -> Self {
        Self::answering(None)
    }

    fn answering(answer: Option<bool>) -> Self {
        Self {
            answer,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenValidator for MockValidator {
    async fn validate(&self, _envelope: &Envelope) -> Result<ValidationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answer {
            Some(authorized) => Ok(ValidationResult { authorized }),
            None => Err(ValidatorError::Capbac(CapbacError::Exit {
                status: "exit status: 1".to_string(),
                stderr: "ledger unreachable".to_string(),
            })),
        }
    }
}
