//! The endpoint context: exclusive owner of the socket, both queues, the
//! resource registry, the known-options bitmap and the user callbacks.
//!
//! The engine is single-threaded and cooperative.  A host calls
//! [`EndpointContext::read`] when the socket is readable,
//! [`EndpointContext::dispatch`] afterwards, and
//! [`EndpointContext::retransmit_expired`] when the deadline of the send
//! queue head passes; [`crate::CoapServer`] wires exactly that loop up
//! under tokio.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use log::{debug, error, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::{duration_to_ticks, Clock, Ticks};
use crate::hash::{self, Key, TransactionId};
use crate::pdu::{opts, OptFilter, Pdu, HDR_SIZE, MAX_PDU_SIZE, VERSION};
use crate::peer::PeerAddress;
use crate::queue::{QueueNode, TransmitQueue};
use crate::resource::Resource;
use crate::udp::{DatagramSocket, UdpChannel};

/// Invoked for every received response:
/// `(ctx, remote, matching_request, response, transaction_id)`.  The PDUs
/// are only valid for the duration of the call.
pub type ResponseHandler = Box<
    dyn FnMut(&mut EndpointContext, &PeerAddress, Option<&Pdu>, &Pdu, TransactionId) + Send,
>;

/// Pluggable predicate deciding whether a received message is handled by
/// this endpoint.  The default accepts everything.
pub type LocalDeliveryPredicate = fn(&EndpointContext, &QueueNode) -> bool;

/// Reliability knobs for confirmable transmissions.  Defaults come from
/// the protocol specification: 2 s base timeout, 4 retransmissions, and
/// a 1.0–1.5x jitter factor applied per send.
#[derive(Debug, Clone, Copy)]
pub struct TransmissionParameters {
    response_timeout: Duration,
    max_retransmit: u32,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            max_retransmit: 4,
        }
    }
}

impl TransmissionParameters {
    pub fn new(response_timeout: Duration, max_retransmit: u32) -> anyhow::Result<Self> {
        if response_timeout.is_zero() {
            return Err(anyhow!("invalid response_timeout={response_timeout:?}"));
        }
        Ok(Self {
            response_timeout,
            max_retransmit,
        })
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn max_retransmit(&self) -> u32 {
        self.max_retransmit
    }
}

/// Why a received datagram was not queued.  All variants are recoverable;
/// the reader logs and the caller moves on to the next datagram.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("socket receive failed")]
    Io(#[from] io::Error),

    #[error("frame shorter than a message header")]
    ShortFrame,

    #[error("unknown protocol version {0}")]
    UnknownVersion(u8),

    #[error(transparent)]
    Malformed(#[from] crate::pdu::PduError),
}

pub struct EndpointContext {
    socket: Box<dyn DatagramSocket>,
    pub(crate) sendqueue: TransmitQueue,
    pub(crate) recvqueue: TransmitQueue,
    pub(crate) resources: HashMap<Key, Arc<Resource>>,
    /// Preformatted link entries in registration order, rendered by
    /// `.well-known/core` responses.
    pub(crate) discoverable: Vec<String>,
    known_options: OptFilter,
    pub(crate) response_handler: Option<ResponseHandler>,
    pub(crate) deliver_locally: Option<LocalDeliveryPredicate>,
    params: TransmissionParameters,
    pub(crate) clock: Clock,
    rng: StdRng,
    next_message_id: u16,
}

impl EndpointContext {
    /// Opens a UDP socket on `listen` (with `SO_REUSEADDR`), registers
    /// the critical options this engine understands and seeds the jitter
    /// PRNG from the listen address and the current wall clock.
    ///
    /// Must be called within a tokio runtime.
    pub fn bind(listen: SocketAddr) -> io::Result<EndpointContext> {
        let socket = UdpChannel::bind(listen)?;
        let local = socket.local_addr()?;
        Ok(Self::with_socket(
            Box::new(socket),
            prng_seed(local),
            TransmissionParameters::default(),
        ))
    }

    /// Builds a context over any [`DatagramSocket`] implementation.
    pub fn with_socket(
        socket: Box<dyn DatagramSocket>,
        seed: u64,
        params: TransmissionParameters,
    ) -> EndpointContext {
        let mut known_options = OptFilter::new();
        for number in [
            opts::CONTENT_TYPE,
            opts::PROXY_URI,
            opts::URI_HOST,
            opts::URI_PORT,
            opts::URI_PATH,
            opts::TOKEN,
            opts::URI_QUERY,
        ] {
            known_options.set(number);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let next_message_id = rng.gen();
        EndpointContext {
            socket,
            sendqueue: TransmitQueue::new(),
            recvqueue: TransmitQueue::new(),
            resources: HashMap::new(),
            discoverable: Vec::new(),
            known_options,
            response_handler: None,
            deliver_locally: None,
            params,
            clock: Clock::new(),
            rng,
            next_message_id,
        }
    }

    /// Marks an option number as understood by this endpoint.  The set
    /// only ever grows during the context's lifetime.
    pub fn register_option(&mut self, number: u16) {
        self.known_options.set(number);
    }

    pub fn add_resource(&mut self, resource: Resource) {
        let resource = Arc::new(resource);
        if resource.is_discoverable() {
            self.discoverable.push(resource.link_str().to_string());
        }
        if let Some(old) = self.resources.insert(resource.key(), resource) {
            self.discoverable.retain(|link| link != old.link_str());
        }
    }

    pub fn set_response_handler(&mut self, handler: ResponseHandler) {
        self.response_handler = Some(handler);
    }

    pub fn set_local_delivery(&mut self, predicate: LocalDeliveryPredicate) {
        self.deliver_locally = Some(predicate);
    }

    /// Fresh wire message id (wrapping counter, randomly seeded).
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    pub fn params(&self) -> &TransmissionParameters {
        &self.params
    }

    /// Flags every critical (odd-numbered) option the endpoint does not
    /// know in `unknown` and reports whether the PDU is acceptable.
    /// Numbers beyond the filter's range cannot be echoed back, so the
    /// walk stops there; the message is rejected either way.
    pub fn check_critical(&self, pdu: &Pdu, unknown: &mut OptFilter) -> bool {
        let mut ok = true;
        for (number, _) in pdu.options() {
            if number & 1 == 1 && !self.known_options.contains(number) {
                debug!("unknown critical option {number}");
                ok = false;
                if !unknown.set(number) {
                    break;
                }
            }
        }
        ok
    }

    /// Receives one datagram and appends it to the receive queue.  Does
    /// not dispatch.
    pub fn read(&mut self) -> Result<(), ReadError> {
        let mut buf = [0u8; MAX_PDU_SIZE];
        let (len, src) = self.socket.try_recv_from(&mut buf)?;
        self.enqueue_datagram(&buf[..len], src)
    }

    /// Validates and queues one raw datagram, as if it had just been read
    /// from the socket.  Exposed for transports that deliver datagrams by
    /// other means.
    pub fn enqueue_datagram(&mut self, bytes: &[u8], src: PeerAddress) -> Result<(), ReadError> {
        if bytes.len() < HDR_SIZE {
            debug!("discarded invalid frame from {src}");
            return Err(ReadError::ShortFrame);
        }
        let version = bytes[0] >> 6;
        if version != VERSION {
            debug!("discarded frame with unknown protocol version {version}");
            return Err(ReadError::UnknownVersion(version));
        }
        let pdu = Pdu::parse(bytes).map_err(|e| {
            debug!("discarded malformed frame from {src}: {e}");
            e
        })?;
        trace!("** received {} bytes from {src}", bytes.len());
        let id = hash::transaction_id(&src, &pdu);
        let node = QueueNode::new(self.clock.ticks(), id, src, pdu);
        self.recvqueue.insert(node);
        Ok(())
    }

    /// Single unconfirmed transmission.  The PDU is consumed whether or
    /// not the write succeeds; `None` signals the write failure.
    pub fn send(&mut self, dst: &PeerAddress, pdu: Pdu) -> Option<TransactionId> {
        match self.socket.try_send_to(pdu.as_bytes(), dst) {
            Ok(_) => Some(hash::transaction_id(dst, &pdu)),
            Err(e) => {
                error!("send to {dst} failed: {e}");
                None
            }
        }
    }

    /// Confirmable transmission: the PDU is handed to the retransmission
    /// scheduler, which owns it until an ACK/RST removes it or retries
    /// are exhausted.  The first wire write happening to fail does not
    /// unschedule the node; the next tick retransmits.
    pub fn send_confirmed(&mut self, dst: PeerAddress, pdu: Pdu) -> Option<TransactionId> {
        let jitter: u8 = self.rng.gen();
        let base = duration_to_ticks(self.params.response_timeout);
        let timeout = base + (((base >> 1) * Ticks::from(jitter)) >> 8);
        let id = hash::transaction_id(&dst, &pdu);

        if let Err(e) = self.socket.try_send_to(pdu.as_bytes(), &dst) {
            error!("send to {dst} failed: {e}");
        }

        let mut node = QueueNode::new(self.clock.ticks() + timeout, id, dst, pdu);
        node.timeout = timeout;
        self.sendqueue.insert(node);
        Some(id)
    }

    /// Builds an error response for `request` and sends it unconfirmed.
    pub fn send_error(
        &mut self,
        request: &Pdu,
        dst: &PeerAddress,
        code: u8,
        opts_filter: OptFilter,
    ) -> Option<TransactionId> {
        let response = crate::response::new_error_response(request, code, opts_filter)?;
        self.send(dst, response)
    }

    /// One retransmission step for a node popped off the send queue:
    /// doubles the timeout and reschedules, or drops the node once the
    /// retry budget is spent.
    pub fn retransmit(&mut self, mut node: Box<QueueNode>) -> Option<TransactionId> {
        if node.retransmit_cnt < self.params.max_retransmit {
            node.retransmit_cnt += 1;
            node.t += node.timeout << node.retransmit_cnt;
            debug!(
                "** retransmission #{} of transaction {}",
                node.retransmit_cnt,
                node.pdu.message_id()
            );
            if let Err(e) = self.socket.try_send_to(node.pdu.as_bytes(), &node.remote) {
                error!("send to {} failed: {e}", node.remote);
            }
            let id = node.id;
            self.sendqueue.insert(node);
            Some(id)
        } else {
            // retries exhausted; the response callback for this
            // transaction will simply never fire
            debug!("** removed transaction {}", node.id);
            None
        }
    }

    /// Retransmits every send-queue node whose deadline has passed.
    pub fn retransmit_expired(&mut self) {
        let now = self.clock.ticks();
        while self.sendqueue.peek_front().is_some_and(|n| n.t <= now) {
            if let Some(node) = self.sendqueue.pop_front() {
                self.retransmit(node);
            }
        }
    }

    /// Deadline of the earliest scheduled retransmission, for the host's
    /// timer.
    pub fn next_retransmit_at(&self) -> Option<tokio::time::Instant> {
        self.sendqueue
            .peek_front()
            .map(|node| self.clock.instant_at(node.t))
    }

    /// Resolves when the socket has a datagram waiting.
    pub async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }

    /// True when no queued work remains in either direction.
    pub fn can_exit(&self) -> bool {
        self.recvqueue.is_empty() && self.sendqueue.is_empty()
    }
}

/// Seed for the jitter PRNG: listen address bits folded through the
/// engine hash, XORed with the wall-clock offset.
fn prng_seed(listen: SocketAddr) -> u64 {
    let mut key = Key::default();
    PeerAddress::from(listen).hash_into(&mut key);
    let clock_offset = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u64::from(u32::from_be_bytes(key)) ^ clock_offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TICKS_PER_SECOND;
    use crate::pdu::{codes, MessageType};
    use crate::udp::testing::MockSocket;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn test_context() -> (EndpointContext, std::sync::Arc<std::sync::Mutex<Vec<(Vec<u8>, PeerAddress)>>>)
    {
        let (socket, sent) = MockSocket::new();
        let ctx =
            EndpointContext::with_socket(Box::new(socket), 7, TransmissionParameters::default());
        (ctx, sent)
    }

    fn peer() -> PeerAddress {
        PeerAddress::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 56830))
    }

    fn con_get(message_id: u16) -> Pdu {
        Pdu::new(MessageType::Confirmable, codes::GET, message_id, 64).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_send_schedules_with_jitter() {
        let (mut ctx, sent) = test_context();
        ctx.send_confirmed(peer(), con_get(0x77)).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);

        let node = ctx.sendqueue.peek_front().unwrap();
        let base = 2 * TICKS_PER_SECOND;
        assert!(node.t >= base && node.t < base + base / 2, "t = {}", node.t);
        assert_eq!(node.timeout, node.t);
        assert_eq!(node.retransmit_cnt, 0);
        assert!(!ctx.can_exit());
    }

    #[tokio::test(start_paused = true)]
    async fn retransmission_doubles_and_gives_up() {
        let (mut ctx, sent) = test_context();
        ctx.send_confirmed(peer(), con_get(0x77)).unwrap();

        let timeout = ctx.sendqueue.peek_front().unwrap().timeout;
        let mut expected_t = timeout;
        for k in 1..=ctx.params().max_retransmit() {
            tokio::time::advance(std::time::Duration::from_millis(
                expected_t - ctx.clock.ticks() + 1,
            ))
            .await;
            ctx.retransmit_expired();
            let node = ctx.sendqueue.peek_front().unwrap();
            assert_eq!(node.retransmit_cnt, k);
            // k-th retransmission scheduled a full doubled timeout later
            expected_t += timeout << k;
            assert_eq!(node.t, expected_t);
            assert!(node.t >= timeout * (1u64 << k));
            assert_eq!(sent.lock().unwrap().len(), 1 + k as usize);
        }

        // one more expiry exhausts the retry budget and drops the node
        tokio::time::advance(std::time::Duration::from_millis(
            expected_t - ctx.clock.ticks() + 1,
        ))
        .await;
        ctx.retransmit_expired();
        assert!(ctx.sendqueue.is_empty());
        assert!(ctx.can_exit());
        assert_eq!(
            sent.lock().unwrap().len(),
            1 + ctx.params().max_retransmit() as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_the_node_scheduled() {
        let (mut socket, sent) = MockSocket::new();
        socket.fail_sends = true;
        let mut ctx =
            EndpointContext::with_socket(Box::new(socket), 7, TransmissionParameters::default());

        ctx.send_confirmed(peer(), con_get(1)).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 0);
        assert_eq!(ctx.sendqueue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_send_reports_write_failure() {
        let (mut socket, _sent) = MockSocket::new();
        socket.fail_sends = true;
        let mut ctx =
            EndpointContext::with_socket(Box::new(socket), 7, TransmissionParameters::default());
        assert!(ctx.send(&peer(), con_get(1)).is_none());
        assert!(ctx.can_exit());
    }

    #[test]
    fn short_and_wrong_version_frames_are_rejected() {
        let (mut ctx, _sent) = test_context();
        assert!(matches!(
            ctx.enqueue_datagram(&[0x40, 0x01], peer()),
            Err(ReadError::ShortFrame)
        ));
        // version 2 in the top bits
        assert!(matches!(
            ctx.enqueue_datagram(&[0x80, 0x01, 0x00, 0x01], peer()),
            Err(ReadError::UnknownVersion(2))
        ));
        assert!(ctx.recvqueue.is_empty());
    }

    #[test]
    fn valid_frame_lands_in_the_receive_queue() {
        let (mut ctx, _sent) = test_context();
        let request = con_get(0x1234);
        ctx.enqueue_datagram(request.as_bytes(), peer()).unwrap();
        assert_eq!(ctx.recvqueue.len(), 1);
        let node = ctx.recvqueue.peek_front().unwrap();
        assert_eq!(node.pdu.message_id(), 0x1234);
        assert_eq!(node.id, hash::transaction_id(&peer(), &request));
    }

    #[test]
    fn check_critical_accepts_known_and_even_options() {
        let (ctx, _sent) = test_context();
        let mut pdu = con_get(1);
        pdu.add_option(opts::ETAG, &[1]).unwrap(); // even: elective
        pdu.add_option(opts::URI_PATH, b"a").unwrap(); // odd but known
        let mut unknown = OptFilter::new();
        assert!(ctx.check_critical(&pdu, &mut unknown));
        assert!(unknown.is_empty());
    }

    #[test]
    fn check_critical_flags_unknown_odd_options() {
        let (ctx, _sent) = test_context();
        let mut pdu = con_get(1);
        pdu.add_option(opts::URI_PATH, b"a").unwrap();
        pdu.add_option(21, &[]).unwrap();
        let mut unknown = OptFilter::new();
        assert!(!ctx.check_critical(&pdu, &mut unknown));
        assert!(unknown.contains(21));
        assert!(!unknown.contains(opts::URI_PATH));
    }

    #[test]
    fn check_critical_registered_options_become_known() {
        let (mut ctx, _sent) = test_context();
        let mut pdu = con_get(1);
        pdu.add_option(21, &[]).unwrap();
        let mut unknown = OptFilter::new();
        assert!(!ctx.check_critical(&pdu, &mut unknown));

        ctx.register_option(21);
        let mut unknown = OptFilter::new();
        assert!(ctx.check_critical(&pdu, &mut unknown));
    }

    #[test]
    fn check_critical_stops_beyond_filter_range() {
        let (ctx, _sent) = test_context();
        let mut pdu = con_get(1);
        pdu.add_option(65, &[]).unwrap(); // odd, beyond the 64-bit filter
        let mut unknown = OptFilter::new();
        assert!(!ctx.check_critical(&pdu, &mut unknown));
        assert!(unknown.is_empty());
    }

    #[test]
    fn message_ids_increment_and_wrap() {
        let (mut ctx, _sent) = test_context();
        let first = ctx.next_message_id();
        assert_eq!(ctx.next_message_id(), first.wrapping_add(1));
    }

    #[test]
    fn transmission_parameters_validate() {
        assert!(TransmissionParameters::new(Duration::ZERO, 4).is_err());
        let params = TransmissionParameters::new(Duration::from_secs(1), 2).unwrap();
        assert_eq!(params.response_timeout(), Duration::from_secs(1));
        assert_eq!(params.max_retransmit(), 2);
    }
}
