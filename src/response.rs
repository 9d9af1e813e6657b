//! Response synthesis: error responses, `.well-known/core` responses,
//! piggy-backed replies and empty acknowledgements.

use log::debug;

use crate::context::EndpointContext;
use crate::hash::TransactionId;
use crate::link;
use crate::pdu::{
    codes, encode_var_bytes, media, opts, MessageType, OptFilter, Pdu, HDR_SIZE, MAX_PDU_SIZE,
};
use crate::peer::PeerAddress;

/// Canonical reason phrase, carried as text/plain payload in synthesized
/// error responses.
pub fn response_phrase(code: u8) -> Option<&'static str> {
    let phrase = match code {
        codes::CREATED => "Created",
        codes::DELETED => "Deleted",
        codes::VALID => "Valid",
        codes::CHANGED => "Changed",
        codes::CONTENT => "Content",
        codes::BAD_REQUEST => "Bad Request",
        codes::UNAUTHORIZED => "Unauthorized",
        codes::BAD_OPTION => "Bad Option",
        codes::FORBIDDEN => "Forbidden",
        codes::NOT_FOUND => "Not Found",
        codes::METHOD_NOT_ALLOWED => "Method Not Allowed",
        codes::PRECONDITION_FAILED => "Precondition Failed",
        codes::UNSUPPORTED_MEDIA_TYPE => "Unsupported Media Type",
        codes::INTERNAL_SERVER_ERROR => "Internal Server Error",
        codes::NOT_IMPLEMENTED => "Not Implemented",
        codes::BAD_GATEWAY => "Bad Gateway",
        codes::SERVICE_UNAVAILABLE => "Service Unavailable",
        codes::GATEWAY_TIMEOUT => "Gateway Timeout",
        _ => return None,
    };
    Some(phrase)
}

fn encoded_option_size(value_len: usize) -> usize {
    1 + usize::from(value_len >= 15) + value_len
}

/// Builds an error response for `request`: an ACK when the request was
/// confirmable, NON otherwise, echoing the message id and every request
/// option enabled in `opts_filter` (always the Token; for 4.02 also the
/// unknown critical options).  Returns `None` when the response cannot
/// be built.
pub fn new_error_response(request: &Pdu, code: u8, mut opts_filter: OptFilter) -> Option<Pdu> {
    // never echo the request's Content-Type; always echo its Token
    opts_filter.clear(opts::CONTENT_TYPE);
    opts_filter.set(opts::TOKEN);

    let mtype = if request.mtype() == MessageType::Confirmable {
        MessageType::Acknowledgement
    } else {
        MessageType::NonConfirmable
    };
    let phrase = response_phrase(code);

    let mut size = HDR_SIZE + 4; // some bytes for fence-post options
    if let Some(phrase) = phrase {
        size += phrase.len() + 2;
    }
    for (number, value) in request.options() {
        if opts_filter.contains(number) {
            size += encoded_option_size(value.len());
        }
    }

    let mut response = Pdu::new(mtype, code, request.message_id(), size)?;
    if phrase.is_some() {
        let (value, len) = encode_var_bytes(media::TEXT_PLAIN);
        response.add_option(opts::CONTENT_TYPE, &value[..len]).ok()?;
    }
    for (number, value) in request.options() {
        if opts_filter.contains(number) {
            response.add_option(number, value).ok()?;
        }
    }
    if let Some(phrase) = phrase {
        response.add_data(phrase.as_bytes()).ok()?;
    }
    Some(response)
}

/// Builds a piggy-backed reply to `request`: ACK for confirmable
/// requests, NON otherwise, echoing message id and token.  Handlers add
/// their payload and send it through [`EndpointContext::send`].
pub fn new_response(request: &Pdu, code: u8, content_format: Option<u16>) -> Option<Pdu> {
    let mtype = if request.mtype() == MessageType::Confirmable {
        MessageType::Acknowledgement
    } else {
        MessageType::NonConfirmable
    };
    let mut response = Pdu::new(mtype, code, request.message_id(), MAX_PDU_SIZE)?;
    if let Some(format) = content_format {
        let (value, len) = encode_var_bytes(format);
        response.add_option(opts::CONTENT_TYPE, &value[..len]).ok()?;
    }
    if let Some(token) = request.token() {
        response.add_option(opts::TOKEN, token).ok()?;
    }
    Some(response)
}

impl EndpointContext {
    /// Default `.well-known/core` response: 2.05 Content with the
    /// link-format rendering of the resource registry, echoing message
    /// id and token of `request`.
    pub fn wellknown_response(&self, request: &Pdu) -> Option<Pdu> {
        let mut response = Pdu::new(
            MessageType::Acknowledgement,
            codes::CONTENT,
            request.message_id(),
            MAX_PDU_SIZE,
        )?;
        let (value, len) = encode_var_bytes(media::APPLICATION_LINK_FORMAT);
        response.add_option(opts::CONTENT_TYPE, &value[..len]).ok()?;
        if let Some(token) = request.token() {
            response.add_option(opts::TOKEN, token).ok()?;
        }

        let mut payload = vec![0u8; response.remaining()];
        let links = self.discoverable.iter().map(String::as_str);
        match link::render_links(links, &mut payload) {
            Some(written) => {
                response.add_data(&payload[..written]).ok()?;
                Some(response)
            }
            None => {
                debug!("well-known rendering does not fit the response");
                None
            }
        }
    }

    /// Acknowledges a confirmable message with an empty ACK.
    pub fn send_ack(&mut self, dst: &PeerAddress, request: &Pdu) -> Option<TransactionId> {
        let ack = Pdu::new(
            MessageType::Acknowledgement,
            codes::EMPTY,
            request.message_id(),
            HDR_SIZE,
        )?;
        self.send(dst, ack)
    }
}
