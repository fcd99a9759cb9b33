use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte closing the embedded envelope in delimited framing
pub const ENVELOPE_DELIMITER: u8 = b'}';

/// Width of the big-endian envelope length in length-prefixed framing
pub const LENGTH_PREFIX_LEN: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("No envelope delimiter in body")]
    MissingDelimiter,

    #[error("Body shorter than the length prefix")]
    MissingLengthPrefix,

    #[error("Envelope declares {declared} bytes but only {available} are present")]
    Truncated { declared: usize, available: usize },

    #[error("Envelope of {0} bytes does not fit the length prefix")]
    EnvelopeTooLong(usize),
}

/// How the capability envelope and the application payload share one body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Envelope runs up to and including the first `}`; the rest is payload.
    /// Only works while the envelope has no nested objects.
    #[default]
    Delimited,

    /// Two-byte big-endian envelope length, then envelope, then payload
    LengthPrefixed,
}

impl Framing {
    /// Split a body into `(envelope, payload)`
    pub fn split<'a>(&self, body: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), FramingError> {
        match self {
            Framing::Delimited => {
                let end = body
                    .iter()
                    .position(|b| *b == ENVELOPE_DELIMITER)
                    .ok_or(FramingError::MissingDelimiter)?;
                Ok(body.split_at(end + 1))
            }
            Framing::LengthPrefixed => {
                if body.len() < LENGTH_PREFIX_LEN {
                    return Err(FramingError::MissingLengthPrefix);
                }
                let (prefix, rest) = body.split_at(LENGTH_PREFIX_LEN);
                let declared = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
                if declared > rest.len() {
                    return Err(FramingError::Truncated {
                        declared,
                        available: rest.len(),
                    });
                }
                Ok(rest.split_at(declared))
            }
        }
    }

    /// Build a body from an envelope and a payload
    pub fn join(&self, envelope: &[u8], payload: &[u8]) -> Result<Vec<u8>, FramingError> {
        let mut body = Vec::with_capacity(LENGTH_PREFIX_LEN + envelope.len() + payload.len());
        match self {
            Framing::Delimited => {
                if envelope.last() != Some(&ENVELOPE_DELIMITER) {
                    return Err(FramingError::MissingDelimiter);
                }
            }
            Framing::LengthPrefixed => {
                let len = u16::try_from(envelope.len())
                    .map_err(|_| FramingError::EnvelopeTooLong(envelope.len()))?;
                body.extend_from_slice(&len.to_be_bytes());
            }
        }
        body.extend_from_slice(envelope);
        body.extend_from_slice(payload);
        Ok(body)
    }
}
