use super::framing::FramingError;
use crate::token::Action;
use crate::validator::ValidatorError;
use thiserror::Error;

/// Why the gate refused a request. Only ever logged, never sent to the peer.
#[derive(Debug, Error)]
pub enum RejectReason {
    #[error("Framing violation: {0}")]
    Framing(#[from] FramingError),

    #[error("Envelope is not valid UTF-8")]
    NonUtf8Envelope,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("Invalid token: action {requested} where {required} is required")]
    ActionMismatch { requested: Action, required: Action },

    #[error("Invalid token: resource {requested} where {required} is required")]
    ResourceMismatch { requested: String, required: String },

    #[error("Validator failure: {0}")]
    Validator(#[from] ValidatorError),

    #[error("Unauthorized")]
    Unauthorized,
}

/// Coarse grouping of reject reasons for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectClass {
    Malformed,
    InvalidToken,
    ValidatorFailure,
    Unauthorized,
}

impl RejectReason {
    pub fn class(&self) -> RejectClass {
        match self {
            RejectReason::Framing(_)
            | RejectReason::NonUtf8Envelope
            | RejectReason::MalformedEnvelope(_) => RejectClass::Malformed,
            RejectReason::ActionMismatch { .. } | RejectReason::ResourceMismatch { .. } => {
                RejectClass::InvalidToken
            }
            RejectReason::Validator(_) => RejectClass::ValidatorFailure,
            RejectReason::Unauthorized => RejectClass::Unauthorized,
        }
    }
}

/// The single outcome of every failed authorization
#[derive(Debug, Error)]
#[error("Request rejected")]
pub struct Rejected {
    reason: RejectReason,
}

impl Rejected {
    pub(crate) fn new(reason: RejectReason) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> &RejectReason {
        &self.reason
    }
}
