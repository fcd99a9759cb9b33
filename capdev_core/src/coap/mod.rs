//! Minimal CoAP (RFC 7252) message codec with the Observe option (RFC 7641).

mod message;
pub mod option;

pub use message::{Code, Message, MessageType, MAX_TOKEN_LEN, PAYLOAD_MARKER};
pub use option::{CoapOption, ContentFormat};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodecError>;

pub const DEFAULT_PORT: u16 = 5683;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Datagram of {0} bytes is shorter than a CoAP header")]
    TooShort(usize),

    #[error("Unsupported CoAP version {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid token length {0}")]
    InvalidTokenLength(usize),

    #[error("Message truncated")]
    Truncated,

    #[error("Reserved option nibble")]
    ReservedNibble,

    #[error("Option number overflow")]
    OptionNumberOverflow,

    #[error("Option field of {0} bytes is too long")]
    OptionTooLong(usize),

    #[error("Payload marker without payload")]
    EmptyPayload,

    #[error("Empty message carries token, options or payload")]
    NonEmptyEmptyMessage,
}
