//! Per-request authorization gate.
//!
//! Every resource handler runs its request body through [`AuthorizationGate`]
//! before touching state. The body starts with a capability envelope; the
//! gate splits it off, checks the requested action, asks the token validator
//! and hands back the remaining payload. Any anomaly on the way is a
//! rejection.

mod error;
mod framing;


pub use error::{RejectClass, RejectReason, Rejected};
pub use framing::{Framing, FramingError, ENVELOPE_DELIMITER, LENGTH_PREFIX_LEN};

use crate::token::{Action, Envelope};
use crate::validator::TokenValidator;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AuthorizationGate {
    validator: Arc<dyn TokenValidator>,
    framing: Framing,
}

impl AuthorizationGate {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            validator,
            framing: Framing::default(),
        }
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Authorize `body` for `required` and return the inner payload
    pub async fn authorize<'a>(
        &self,
        body: &'a [u8],
        required: Action,
    ) -> Result<&'a [u8], Rejected> {
        self.check(body, required, None).await
    }

    /// Like [`authorize`](Self::authorize), but an envelope naming a resource
    /// must name `resource`
    pub async fn authorize_for<'a>(
        &self,
        body: &'a [u8],
        required: Action,
        resource: &str,
    ) -> Result<&'a [u8], Rejected> {
        self.check(body, required, Some(resource)).await
    }

    async fn check<'a>(
        &self,
        body: &'a [u8],
        required: Action,
        resource: Option<&str>,
    ) -> Result<&'a [u8], Rejected> {
        match self.evaluate(body, required, resource).await {
            Ok(payload) => {
                debug!(action = %required, payload_len = payload.len(), "Request authorized");
                Ok(payload)
            }
            Err(reason) => {
                warn!(action = %required, class = ?reason.class(), "Rejecting request: {}", reason);
                Err(Rejected::new(reason))
            }
        }
    }

    async fn evaluate<'a>(
        &self,
        body: &'a [u8],
        required: Action,
        resource: Option<&str>,
    ) -> Result<&'a [u8], RejectReason> {
        let (envelope, payload) = self.framing.split(body)?;
        let raw = std::str::from_utf8(envelope).map_err(|_| RejectReason::NonUtf8Envelope)?;
        debug!("Validation request: {}", raw);

        let envelope = Envelope::parse(raw)?;

        if envelope.action() != required {
            return Err(RejectReason::ActionMismatch {
                requested: envelope.action(),
                required,
            });
        }

        if let (Some(requested), Some(required)) = (envelope.request.resource.as_deref(), resource)
        {
            if requested != required {
                return Err(RejectReason::ResourceMismatch {
                    requested: requested.to_string(),
                    required: required.to_string(),
                });
            }
        }

        let result = self.validator.validate(&envelope).await?;
        if !result.authorized {
            return Err(RejectReason::Unauthorized);
        }

        Ok(payload)
    }
}

impl fmt::Debug for AuthorizationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationGate")
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}
