use super::option::{self, CoapOption, ContentFormat};
use super::{CodecError, Result};
use crate::token::Action;
use std::fmt;

pub const VERSION: u8 = 1;
pub const PAYLOAD_MARKER: u8 = 0xff;
pub const MAX_TOKEN_LEN: usize = 8;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(&self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Method or response code, `class.detail`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);

    pub const CREATED: Code = Code(0x41);
    pub const DELETED: Code = Code(0x42);
    pub const VALID: Code = Code(0x43);
    pub const CHANGED: Code = Code(0x44);
    pub const CONTENT: Code = Code(0x45);

    pub const BAD_REQUEST: Code = Code(0x80);
    pub const UNAUTHORIZED: Code = Code(0x81);
    pub const BAD_OPTION: Code = Code(0x82);
    pub const NOT_FOUND: Code = Code(0x84);
    pub const METHOD_NOT_ALLOWED: Code = Code(0x85);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code(0x8d);

    pub const INTERNAL_SERVER_ERROR: Code = Code(0xa0);

    pub fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1f))
    }

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_request(&self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    pub fn action(&self) -> Option<Action> {
        match *self {
            Code::GET => Some(Action::Get),
            Code::POST => Some(Action::Post),
            Code::PUT => Some(Action::Put),
            Code::DELETE => Some(Action::Delete),
            _ => None,
        }
    }
}

impl From<Action> for Code {
    fn from(action: Action) -> Self {
        match action {
            Action::Get => Code::GET,
            Action::Post => Code::POST,
            Action::Put => Code::PUT,
            Action::Delete => Code::DELETE,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Empty RST for a message we cannot or will not process
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id)
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn add_option(&mut self, option: CoapOption) {
        self.options.push(option);
    }

    pub fn option(&self, number: u16) -> Option<&CoapOption> {
        self.options.iter().find(|o| o.number == number)
    }

    pub fn set_uri_path(&mut self, path: &str) {
        self.options.retain(|o| o.number != option::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::new(option::URI_PATH, segment.as_bytes().to_vec()));
        }
    }

    /// Uri-Path segments, `None` if a segment is not UTF-8
    pub fn uri_path(&self) -> Option<Vec<String>> {
        self.options
            .iter()
            .filter(|o| o.number == option::URI_PATH)
            .map(|o| String::from_utf8(o.value.clone()).ok())
            .collect()
    }

    pub fn observe(&self) -> Option<u32> {
        self.option(option::OBSERVE).and_then(CoapOption::as_uint)
    }

    pub fn set_observe(&mut self, value: u32) {
        self.options.retain(|o| o.number != option::OBSERVE);
        self.add_option(CoapOption::uint(
            option::OBSERVE,
            value & option::OBSERVE_SEQUENCE_MASK,
        ));
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.option(option::CONTENT_FORMAT)
            .and_then(CoapOption::as_uint)
            .and_then(|id| u16::try_from(id).ok())
            .and_then(ContentFormat::from_id)
    }

    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.options.retain(|o| o.number != option::CONTENT_FORMAT);
        self.add_option(CoapOption::uint(
            option::CONTENT_FORMAT,
            u32::from(format.id()),
        ));
    }

    /// First critical option the server does not understand
    pub fn unrecognized_critical_option(&self) -> Option<u16> {
        self.options
            .iter()
            .find(|o| o.is_critical() && !option::RECOGNIZED.contains(&o.number))
            .map(|o| o.number)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CodecError::InvalidTokenLength(self.token.len()));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + self.token.len() + self.payload.len() + 16);
        out.push((VERSION << 6) | (self.message_type.bits() << 4) | self.token.len() as u8);
        out.push(self.code.0);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        // Stable, so repeated options keep their order
        options.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for option in options {
            let delta = option.number - previous;
            let (delta_nibble, delta_ext) = encode_nibble(usize::from(delta))?;
            let (len_nibble, len_ext) = encode_nibble(option.value.len())?;
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(&option.value);
            previous = option.number;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }

        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::TooShort(data.len()));
        }

        let version = data[0] >> 6;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let message_type = MessageType::from_bits(data[0] >> 4);
        let token_len = usize::from(data[0] & 0x0f);
        if token_len > MAX_TOKEN_LEN {
            return Err(CodecError::InvalidTokenLength(token_len));
        }
        let code = Code(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut cursor = Cursor::new(data, HEADER_LEN);
        let token = cursor.take(token_len)?.to_vec();

        let mut message = Message {
            message_type,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        };

        let mut number = 0u32;
        while let Some(byte) = cursor.next_byte() {
            if byte == PAYLOAD_MARKER {
                let payload = cursor.rest();
                if payload.is_empty() {
                    return Err(CodecError::EmptyPayload);
                }
                message.payload = payload.to_vec();
                break;
            }

            let delta = cursor.extended(byte >> 4)?;
            let len = cursor.extended(byte & 0x0f)?;
            number += delta as u32;
            let option_number =
                u16::try_from(number).map_err(|_| CodecError::OptionNumberOverflow)?;
            let value = cursor.take(len)?.to_vec();
            message.options.push(CoapOption::new(option_number, value));
        }

        let has_content = !message.token.is_empty()
            || !message.options.is_empty()
            || !message.payload.is_empty();
        if message.code.is_empty() && has_content {
            return Err(CodecError::NonEmptyEmptyMessage);
        }

        Ok(message)
    }
}

fn encode_nibble(value: usize) -> Result<(u8, Vec<u8>)> {
    match value {
        0..=12 => Ok((value as u8, Vec::new())),
        13..=268 => Ok((13, vec![(value - 13) as u8])),
        269..=65804 => Ok((14, ((value - 269) as u16).to_be_bytes().to_vec())),
        _ => Err(CodecError::OptionTooLong(value)),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn next_byte(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let data = self.data;
        let rest = &data[self.pos..];
        self.pos = data.len();
        rest
    }

    /// Resolve a delta or length nibble with its extension bytes
    fn extended(&mut self, nibble: u8) -> Result<usize> {
        match nibble {
            0..=12 => Ok(usize::from(nibble)),
            13 => Ok(usize::from(self.take(1)?[0]) + 13),
            14 => {
                let ext = self.take(2)?;
                Ok(usize::from(u16::from_be_bytes([ext[0], ext[1]])) + 269)
            }
            _ => Err(CodecError::ReservedNibble),
        }
    }
}
