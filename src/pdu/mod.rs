//! Owned CoAP message buffers.
//!
//! A [`Pdu`] is one contiguous byte buffer (fixed header, options,
//! payload) with a size budget fixed at creation.  The fixed header is
//! `{version:2, type:2, option count:4, code:8, message id:16}`; options
//! are delta-coded TLV with fence-posts at option-number multiples of 14
//! (see [`opts`]).
//!
//! Messages are immutable once their payload is set; the send paths ship
//! [`Pdu::as_bytes`] verbatim, so a retransmission is byte-identical to
//! the first transmission.

use bytes::{BufMut, BytesMut};

pub mod opts;

pub use opts::{OptFilter, OptionIter};

/// Fixed header size in bytes.
pub const HDR_SIZE: usize = 4;

/// Protocol version carried in the two most significant header bits.
pub const VERSION: u8 = 1;

/// Largest datagram the endpoint will produce or accept.
pub const MAX_PDU_SIZE: usize = 1400;

/// Message type, the two bits following the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// Request and response codes.
pub mod codes {
    pub const EMPTY: u8 = 0;

    pub const GET: u8 = 1;
    pub const POST: u8 = 2;
    pub const PUT: u8 = 3;
    pub const DELETE: u8 = 4;

    /// Builds a response code from its dotted decimal form, e.g.
    /// `response(205)` for 2.05 Content.
    pub const fn response(dotted: u16) -> u8 {
        (((dotted / 100) << 5) | (dotted % 100)) as u8
    }

    pub const CREATED: u8 = response(201);
    pub const DELETED: u8 = response(202);
    pub const VALID: u8 = response(203);
    pub const CHANGED: u8 = response(204);
    pub const CONTENT: u8 = response(205);
    pub const BAD_REQUEST: u8 = response(400);
    pub const UNAUTHORIZED: u8 = response(401);
    pub const BAD_OPTION: u8 = response(402);
    pub const FORBIDDEN: u8 = response(403);
    pub const NOT_FOUND: u8 = response(404);
    pub const METHOD_NOT_ALLOWED: u8 = response(405);
    pub const PRECONDITION_FAILED: u8 = response(412);
    pub const UNSUPPORTED_MEDIA_TYPE: u8 = response(415);
    pub const INTERNAL_SERVER_ERROR: u8 = response(500);
    pub const NOT_IMPLEMENTED: u8 = response(501);
    pub const BAD_GATEWAY: u8 = response(502);
    pub const SERVICE_UNAVAILABLE: u8 = response(503);
    pub const GATEWAY_TIMEOUT: u8 = response(504);

    pub fn is_request(code: u8) -> bool {
        matches!(code, GET..=DELETE)
    }

    pub fn is_response(code: u8) -> bool {
        code >= 64
    }
}

/// Content-format identifiers carried in the Content-Type option.
pub mod media {
    pub const TEXT_PLAIN: u16 = 0;
    pub const APPLICATION_LINK_FORMAT: u16 = 40;
    pub const APPLICATION_XML: u16 = 41;
    pub const APPLICATION_OCTET_STREAM: u16 = 42;
    pub const APPLICATION_JSON: u16 = 50;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PduError {
    #[error("frame shorter than the fixed header")]
    ShortFrame,

    #[error("option region truncated")]
    TruncatedOptions,

    #[error("options must be added in ascending number order")]
    OptionOrder,

    #[error("option count field exhausted")]
    TooManyOptions,

    #[error("option value exceeds the encodable length")]
    OptionTooLong,

    #[error("message size budget exceeded")]
    NoSpace,

    #[error("payload already set")]
    PayloadPresent,
}

pub struct Pdu {
    buf: BytesMut,
    max_size: usize,
    /// Payload offset; equals `buf.len()` while no payload is set.
    data_off: usize,
    /// Highest option number written so far.
    last_opt: u16,
}

impl Pdu {
    /// Creates an empty message with the given size budget.  Returns
    /// `None` when the budget cannot hold the fixed header; callers treat
    /// this the same way as an allocation failure.
    pub fn new(mtype: MessageType, code: u8, message_id: u16, max_size: usize) -> Option<Pdu> {
        if max_size < HDR_SIZE {
            log::warn!("pdu budget {max_size} below fixed header size");
            return None;
        }
        let mut buf = BytesMut::with_capacity(max_size);
        buf.put_u8((VERSION << 6) | (mtype.bits() << 4));
        buf.put_u8(code);
        buf.put_u16(message_id);
        Some(Pdu {
            buf,
            max_size,
            data_off: HDR_SIZE,
            last_opt: 0,
        })
    }

    /// Parses a received datagram, copying it verbatim.  The payload
    /// offset is computed by stepping past the header's declared option
    /// count with the raw walker, fence-posts included.
    pub fn parse(bytes: &[u8]) -> Result<Pdu, PduError> {
        if bytes.len() < HDR_SIZE {
            return Err(PduError::ShortFrame);
        }
        let count = bytes[0] & 0x0f;
        let (data_off, last_opt) = opts::walk_options(bytes, HDR_SIZE, count)?;
        let mut buf = BytesMut::with_capacity(bytes.len());
        buf.extend_from_slice(bytes);
        Ok(Pdu {
            buf,
            max_size: bytes.len(),
            data_off,
            last_opt,
        })
    }

    pub fn version(&self) -> u8 {
        self.buf[0] >> 6
    }

    pub fn mtype(&self) -> MessageType {
        MessageType::from_bits(self.buf[0] >> 4)
    }

    pub fn code(&self) -> u8 {
        self.buf[1]
    }

    pub fn message_id(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn opt_count(&self) -> u8 {
        self.buf[0] & 0x0f
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.data_off..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes still available within the size budget.
    pub fn remaining(&self) -> usize {
        self.max_size - self.buf.len()
    }

    /// Official option iterator; fence-posts are skipped.
    pub fn options(&self) -> OptionIter<'_> {
        OptionIter::new(&self.buf, self.data_off)
    }

    /// First occurrence of `number`, if any.
    pub fn first_option(&self, number: u16) -> Option<&[u8]> {
        self.options()
            .find(|&(n, _)| n == number)
            .map(|(_, value)| value)
    }

    /// The request/response token carried in the Token option.
    pub fn token(&self) -> Option<&[u8]> {
        self.first_option(opts::TOKEN)
    }

    /// Appends an option, inserting fence-posts wherever the number gap
    /// exceeds 14.  Numbers must be non-decreasing.
    pub fn add_option(&mut self, number: u16, value: &[u8]) -> Result<(), PduError> {
        if self.data_off < self.buf.len() {
            return Err(PduError::PayloadPresent);
        }
        if number < self.last_opt {
            return Err(PduError::OptionOrder);
        }
        if value.len() > opts::MAX_OPT_LENGTH {
            return Err(PduError::OptionTooLong);
        }

        let mut fences = 0u16;
        let mut cursor = self.last_opt;
        while number - cursor > opts::FENCE_POST_INTERVAL {
            cursor = opts::next_fence_post(cursor);
            fences += 1;
        }
        let need =
            usize::from(fences) + 1 + usize::from(value.len() >= 15) + value.len();
        if self.max_size - self.buf.len() < need {
            return Err(PduError::NoSpace);
        }
        let count = u16::from(self.opt_count()) + fences + 1;
        if count > u16::from(opts::MAX_OPT_COUNT) {
            return Err(PduError::TooManyOptions);
        }

        let mut cursor = self.last_opt;
        while number - cursor > opts::FENCE_POST_INTERVAL {
            let fence = opts::next_fence_post(cursor);
            self.buf.put_u8(((fence - cursor) as u8) << 4);
            cursor = fence;
        }
        let delta = (number - cursor) as u8;
        if value.len() < 15 {
            self.buf.put_u8(delta << 4 | value.len() as u8);
        } else {
            self.buf.put_u8(delta << 4 | 0x0f);
            self.buf.put_u8((value.len() - 15) as u8);
        }
        self.buf.extend_from_slice(value);

        self.buf[0] = (self.buf[0] & 0xf0) | count as u8;
        self.last_opt = number;
        self.data_off = self.buf.len();
        Ok(())
    }

    /// Sets the payload.  May be called at most once, after all options.
    pub fn add_data(&mut self, data: &[u8]) -> Result<(), PduError> {
        if self.data_off < self.buf.len() {
            return Err(PduError::PayloadPresent);
        }
        if self.max_size - self.buf.len() < data.len() {
            return Err(PduError::NoSpace);
        }
        self.data_off = self.buf.len();
        self.buf.extend_from_slice(data);
        Ok(())
    }
}

impl std::fmt::Debug for Pdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pdu")
            .field("type", &self.mtype())
            .field("code", &self.code())
            .field("message_id", &self.message_id())
            .field("opt_count", &self.opt_count())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// Minimal-length big-endian encoding for integer option values; zero
/// encodes to the empty string.
pub fn encode_var_bytes(value: u16) -> ([u8; 2], usize) {
    let bytes = value.to_be_bytes();
    if value == 0 {
        (bytes, 0)
    } else if value < 256 {
        ([bytes[1], 0], 1)
    } else {
        (bytes, 2)
    }
}
