//! CoAP option numbers and value helpers.

pub const IF_MATCH: u16 = 1;
pub const URI_HOST: u16 = 3;
pub const ETAG: u16 = 4;
pub const IF_NONE_MATCH: u16 = 5;
pub const OBSERVE: u16 = 6;
pub const URI_PORT: u16 = 7;
pub const LOCATION_PATH: u16 = 8;
pub const URI_PATH: u16 = 11;
pub const CONTENT_FORMAT: u16 = 12;
pub const MAX_AGE: u16 = 14;
pub const URI_QUERY: u16 = 15;
pub const ACCEPT: u16 = 17;
pub const SIZE1: u16 = 60;

/// Options the server either acts on or can safely ignore
pub const RECOGNIZED: &[u16] = &[
    URI_HOST,
    ETAG,
    OBSERVE,
    URI_PORT,
    URI_PATH,
    CONTENT_FORMAT,
    MAX_AGE,
    URI_QUERY,
    ACCEPT,
    SIZE1,
];

/// Observe registration value (RFC 7641)
pub const OBSERVE_REGISTER: u32 = 0;
/// Observe deregistration value (RFC 7641)
pub const OBSERVE_DEREGISTER: u32 = 1;
/// Observe sequence numbers are 24 bits wide
pub const OBSERVE_SEQUENCE_MASK: u32 = 0x00ff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn new(number: u16, value: Vec<u8>) -> Self {
        Self { number, value }
    }

    pub fn uint(number: u16, value: u32) -> Self {
        Self::new(number, encode_uint(value))
    }

    /// Odd option numbers are critical
    pub fn is_critical(&self) -> bool {
        self.number & 1 == 1
    }

    pub fn as_uint(&self) -> Option<u32> {
        decode_uint(&self.value)
    }
}

/// Minimal big-endian encoding; zero is the empty string
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Content-Format registry values used by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    TextPlain,
    LinkFormat,
}

impl ContentFormat {
    pub fn id(&self) -> u16 {
        match self {
            ContentFormat::TextPlain => 0,
            ContentFormat::LinkFormat => 40,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(ContentFormat::TextPlain),
            40 => Some(ContentFormat::LinkFormat),
            _ => None,
        }
    }
}
