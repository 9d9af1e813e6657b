//! Message dispatch: drains the receive queue, tears down acknowledged
//! transactions, enforces critical options and routes requests to
//! resource handlers.

use log::{debug, info, warn};

use crate::context::EndpointContext;
use crate::hash::{self, WELLKNOWN_PATH};
use crate::pdu::{codes, opts, MessageType, OptFilter, Pdu, VERSION};
use crate::queue::QueueNode;
use crate::response::new_error_response;

impl EndpointContext {
    /// Processes every queued received message.  Must not be called
    /// re-entrantly from a handler.
    pub fn dispatch(&mut self) {
        while let Some(rcvd) = self.recvqueue.pop_front() {
            let mut sent: Option<Box<QueueNode>> = None;
            let mut opt_filter = OptFilter::new();

            if rcvd.pdu.version() != VERSION {
                debug!(
                    "dropped packet with unknown version {}",
                    rcvd.pdu.version()
                );
                continue;
            }

            match rcvd.pdu.mtype() {
                MessageType::Acknowledgement => {
                    // stop retransmitting the acknowledged transaction
                    sent = self.sendqueue.remove_by_id(rcvd.id);
                    if rcvd.pdu.code() == codes::EMPTY {
                        // empty ACK: a separate response will follow
                        continue;
                    }
                }
                MessageType::Reset => {
                    // the peer disliked something we sent
                    warn!("got RST for message {}", rcvd.pdu.message_id());
                    sent = self.sendqueue.remove_by_id(rcvd.id);
                }
                MessageType::NonConfirmable => {
                    // unknown critical options drop a NON silently
                    if !self.check_critical(&rcvd.pdu, &mut opt_filter) {
                        continue;
                    }
                }
                MessageType::Confirmable => {
                    if !self.check_critical(&rcvd.pdu, &mut opt_filter) {
                        match new_error_response(&rcvd.pdu, codes::BAD_OPTION, opt_filter) {
                            None => warn!("dispatch: cannot create error response"),
                            Some(response) => {
                                if self.send(&rcvd.remote, response).is_none() {
                                    warn!("dispatch: error sending response");
                                }
                            }
                        }
                        continue;
                    }
                }
            }

            if self.handle_locally(&rcvd) {
                let code = rcvd.pdu.code();
                if codes::is_request(code) {
                    self.handle_request(&rcvd);
                } else if codes::is_response(code) {
                    self.handle_response(sent.as_deref(), &rcvd);
                } else {
                    debug!("dropped message with invalid code");
                }
            }
        }
    }

    fn handle_locally(&self, node: &QueueNode) -> bool {
        self.deliver_locally.map_or(true, |accepts| accepts(self, node))
    }

    /// Routes a request to its resource handler, or synthesizes the
    /// well-known / 4.04 / 4.05 response.
    fn handle_request(&mut self, node: &QueueNode) {
        let mut opt_filter = OptFilter::new();
        opt_filter.set(opts::TOKEN);

        let key = hash::request_uri_key(&node.pdu);
        let method = node.pdu.code();

        let Some(resource) = self.resources.get(&key).cloned() else {
            let response = if method == codes::GET {
                if key == hash::wellknown_key() {
                    info!("create default response for {WELLKNOWN_PATH}");
                    self.wellknown_response(&node.pdu)
                } else {
                    debug!("GET for unknown resource {key:02x?}, return 4.04");
                    new_error_response(&node.pdu, codes::NOT_FOUND, opt_filter)
                }
            } else {
                debug!("unhandled request for unknown resource {key:02x?}, return 4.05");
                new_error_response(&node.pdu, codes::METHOD_NOT_ALLOWED, opt_filter)
            };
            self.send_or_warn(response, node);
            return;
        };

        if let Some(handler) = resource.handler_for(method) {
            debug!("call custom handler for resource {key:02x?}");
            // the handler owns the reply, including not sending one
            handler(self, &resource, &node.remote, &node.pdu, node.id);
        } else {
            let response = if method == codes::GET && key == hash::wellknown_key() {
                debug!("create default response for {WELLKNOWN_PATH}");
                self.wellknown_response(&node.pdu)
            } else {
                new_error_response(&node.pdu, codes::METHOD_NOT_ALLOWED, opt_filter)
            };
            self.send_or_warn(response, node);
        }
    }

    fn send_or_warn(&mut self, response: Option<Pdu>, node: &QueueNode) {
        let delivered = match response {
            Some(response) => self.send(&node.remote, response).is_some(),
            None => false,
        };
        if !delivered {
            warn!("cannot send response for transaction {}", node.id);
        }
    }

    /// Delivers a received response to the user callback, acknowledging
    /// separate confirmable responses first.
    fn handle_response(&mut self, sent: Option<&QueueNode>, rcvd: &QueueNode) {
        if rcvd.pdu.mtype() == MessageType::Confirmable {
            let _ = self.send_ack(&rcvd.remote, &rcvd.pdu);
        }
        if let Some(mut handler) = self.response_handler.take() {
            handler(self, &rcvd.remote, sent.map(|s| &s.pdu), &rcvd.pdu, rcvd.id);
            if self.response_handler.is_none() {
                self.response_handler = Some(handler);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TransmissionParameters;
    use crate::pdu::media;
    use crate::peer::PeerAddress;
    use crate::resource::resource;
    use crate::response::new_response;
    use crate::udp::testing::MockSocket;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Sent = Arc<Mutex<Vec<(Vec<u8>, PeerAddress)>>>;

    fn test_context() -> (EndpointContext, Sent) {
        let (socket, sent) = MockSocket::new();
        let ctx =
            EndpointContext::with_socket(Box::new(socket), 7, TransmissionParameters::default());
        (ctx, sent)
    }

    fn peer() -> PeerAddress {
        PeerAddress::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 56830))
    }

    fn request(
        mtype: MessageType,
        method: u8,
        message_id: u16,
        path: &[&str],
        token: Option<&[u8]>,
    ) -> Pdu {
        let mut pdu = Pdu::new(mtype, method, message_id, 128).unwrap();
        for segment in path {
            pdu.add_option(opts::URI_PATH, segment.as_bytes()).unwrap();
        }
        if let Some(token) = token {
            pdu.add_option(opts::TOKEN, token).unwrap();
        }
        pdu
    }

    fn last_sent(sent: &Sent) -> Pdu {
        let sent = sent.lock().unwrap();
        let (bytes, _) = sent.last().expect("nothing was sent");
        Pdu::parse(bytes).unwrap()
    }

    // Scenario: CON GET to a resource with a GET handler produces a
    // piggy-backed 2.05 ACK echoing message id and token.
    #[test]
    fn echo_con_request() {
        let (mut ctx, sent) = test_context();
        ctx.add_resource(
            resource("/a")
                .get(|ctx, _res, remote, request, _tid| {
                    let mut response =
                        new_response(request, codes::CONTENT, Some(media::TEXT_PLAIN)).unwrap();
                    response.add_data(b"ok").unwrap();
                    ctx.send(remote, response);
                })
                .build(),
        );

        let get = request(MessageType::Confirmable, codes::GET, 0x1234, &["a"], Some(&[0x42]));
        ctx.enqueue_datagram(get.as_bytes(), peer()).unwrap();
        ctx.dispatch();

        let response = last_sent(&sent);
        assert_eq!(response.mtype(), MessageType::Acknowledgement);
        assert_eq!(response.code(), codes::CONTENT);
        assert_eq!(response.message_id(), 0x1234);
        assert_eq!(response.token(), Some(&[0x42][..]));
        assert_eq!(response.payload(), b"ok");
        assert!(ctx.can_exit());
    }

    // Scenario: GET for an unknown resource yields 4.04 with the token
    // echoed.
    #[test]
    fn unknown_resource_get_yields_not_found() {
        let (mut ctx, sent) = test_context();
        let get = request(
            MessageType::Confirmable,
            codes::GET,
            0x0001,
            &["missing"],
            Some(&[0x99]),
        );
        ctx.enqueue_datagram(get.as_bytes(), peer()).unwrap();
        ctx.dispatch();

        let response = last_sent(&sent);
        assert_eq!(response.mtype(), MessageType::Acknowledgement);
        assert_eq!(response.code(), codes::NOT_FOUND);
        assert_eq!(response.message_id(), 0x0001);
        assert_eq!(response.token(), Some(&[0x99][..]));
    }

    // Non-GET methods on unknown resources yield 4.05.
    #[test]
    fn unknown_resource_post_yields_method_not_allowed() {
        let (mut ctx, sent) = test_context();
        let post = request(MessageType::Confirmable, codes::POST, 2, &["missing"], None);
        ctx.enqueue_datagram(post.as_bytes(), peer()).unwrap();
        ctx.dispatch();
        assert_eq!(last_sent(&sent).code(), codes::METHOD_NOT_ALLOWED);
    }

    // A registered resource without a handler for the method also
    // yields 4.05.
    #[test]
    fn missing_method_handler_yields_method_not_allowed() {
        let (mut ctx, sent) = test_context();
        ctx.add_resource(resource("/a").get(|_, _, _, _, _| {}).build());
        let put = request(MessageType::Confirmable, codes::PUT, 3, &["a"], None);
        ctx.enqueue_datagram(put.as_bytes(), peer()).unwrap();
        ctx.dispatch();
        assert_eq!(last_sent(&sent).code(), codes::METHOD_NOT_ALLOWED);
    }

    // Scenario: discovery of /.well-known/core without registering it.
    #[test]
    fn wellknown_discovery() {
        let (mut ctx, sent) = test_context();
        ctx.add_resource(resource("/a").get(|_, _, _, _, _| {}).build());
        ctx.add_resource(resource("/b").get(|_, _, _, _, _| {}).build());

        let get = request(
            MessageType::Confirmable,
            codes::GET,
            0x0500,
            &[".well-known", "core"],
            Some(&[0x05]),
        );
        ctx.enqueue_datagram(get.as_bytes(), peer()).unwrap();
        ctx.dispatch();

        let response = last_sent(&sent);
        assert_eq!(response.mtype(), MessageType::Acknowledgement);
        assert_eq!(response.code(), codes::CONTENT);
        assert_eq!(response.message_id(), 0x0500);
        assert_eq!(response.token(), Some(&[0x05][..]));
        assert_eq!(
            response.first_option(opts::CONTENT_TYPE),
            Some(&[media::APPLICATION_LINK_FORMAT as u8][..])
        );
        assert_eq!(response.payload(), b"</a>,</b>");
    }

    // Scenario: a CON carrying an unknown critical option is answered
    // with 4.02 Bad Option reflecting the offending option.
    #[test]
    fn unknown_critical_option_on_con_yields_bad_option() {
        let (mut ctx, sent) = test_context();
        let mut post = Pdu::new(MessageType::Confirmable, codes::POST, 0x0d0d, 64).unwrap();
        post.add_option(opts::TOKEN, &[0x0f]).unwrap();
        post.add_option(17, b"x").unwrap();
        ctx.enqueue_datagram(post.as_bytes(), peer()).unwrap();
        ctx.dispatch();

        let response = last_sent(&sent);
        assert_eq!(response.mtype(), MessageType::Acknowledgement);
        assert_eq!(response.code(), codes::BAD_OPTION);
        assert_eq!(response.message_id(), 0x0d0d);
        assert_eq!(response.token(), Some(&[0x0f][..]));
        assert_eq!(response.first_option(17), Some(&b"x"[..]));
    }

    // The same option on a NON is dropped without any reply.
    #[test]
    fn unknown_critical_option_on_non_is_dropped_silently() {
        let (mut ctx, sent) = test_context();
        let mut non = Pdu::new(MessageType::NonConfirmable, codes::POST, 5, 64).unwrap();
        non.add_option(17, b"x").unwrap();
        ctx.enqueue_datagram(non.as_bytes(), peer()).unwrap();
        ctx.dispatch();
        assert!(sent.lock().unwrap().is_empty());
        assert!(ctx.can_exit());
    }

    // Scenario: a retransmission happens before the ACK arrives; the
    // ACK then removes the transaction and retransmissions stop.
    #[tokio::test(start_paused = true)]
    async fn retransmission_then_ack() {
        let (mut ctx, sent) = test_context();
        let con = Pdu::new(MessageType::Confirmable, codes::GET, 0x0077, 32).unwrap();
        ctx.send_confirmed(peer(), con).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);

        // past the (jittered) first deadline, within 3 s
        tokio::time::advance(Duration::from_millis(3001)).await;
        ctx.retransmit_expired();
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(ctx.sendqueue.peek_front().unwrap().retransmit_cnt, 1);

        // empty ACK from the peer tears the transaction down
        let ack = Pdu::new(MessageType::Acknowledgement, codes::EMPTY, 0x0077, 8).unwrap();
        ctx.enqueue_datagram(ack.as_bytes(), peer()).unwrap();
        ctx.dispatch();
        assert!(ctx.sendqueue.is_empty());
        assert!(ctx.can_exit());

        // no further retransmissions fire
        tokio::time::advance(Duration::from_secs(60)).await;
        ctx.retransmit_expired();
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    // Scenario: RST removes the transaction and the response callback
    // never fires.
    #[tokio::test(start_paused = true)]
    async fn reset_removes_transaction_without_callback() {
        let (mut ctx, sent) = test_context();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_handler = Arc::clone(&fired);
        ctx.set_response_handler(Box::new(move |_, _, _, _, _| {
            fired_in_handler.store(true, Ordering::SeqCst);
        }));

        let con = Pdu::new(MessageType::Confirmable, codes::GET, 0x0077, 32).unwrap();
        ctx.send_confirmed(peer(), con).unwrap();

        let rst = Pdu::new(MessageType::Reset, codes::EMPTY, 0x0077, 8).unwrap();
        ctx.enqueue_datagram(rst.as_bytes(), peer()).unwrap();
        ctx.dispatch();

        assert!(ctx.sendqueue.is_empty());
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    // A piggy-backed response reaches the response callback together
    // with the matching request.
    #[tokio::test(start_paused = true)]
    async fn piggybacked_response_reaches_the_callback() {
        let (mut ctx, _sent) = test_context();
        let observed = Arc::new(Mutex::new(None));
        let observed_in_handler = Arc::clone(&observed);
        ctx.set_response_handler(Box::new(move |_ctx, _remote, sent_pdu, rcvd, _tid| {
            *observed_in_handler.lock().unwrap() =
                Some((sent_pdu.is_some(), rcvd.payload().to_vec()));
        }));

        let mut con = Pdu::new(MessageType::Confirmable, codes::GET, 0x0042, 32).unwrap();
        con.add_option(opts::TOKEN, &[0x42]).unwrap();
        ctx.send_confirmed(peer(), con).unwrap();

        let mut ack = Pdu::new(MessageType::Acknowledgement, codes::CONTENT, 0x0042, 32).unwrap();
        ack.add_option(opts::TOKEN, &[0x42]).unwrap();
        ack.add_data(b"hello").unwrap();
        ctx.enqueue_datagram(ack.as_bytes(), peer()).unwrap();
        ctx.dispatch();

        let observed = observed.lock().unwrap().clone();
        assert_eq!(observed, Some((true, b"hello".to_vec())));
        assert!(ctx.can_exit());
    }

    // A separate response arriving as CON is acknowledged with an empty
    // ACK before the callback runs.
    #[test]
    fn separate_con_response_is_acked() {
        let (mut ctx, sent) = test_context();
        let mut response = Pdu::new(MessageType::Confirmable, codes::CONTENT, 0x0abc, 32).unwrap();
        response.add_data(b"late").unwrap();
        ctx.enqueue_datagram(response.as_bytes(), peer()).unwrap();
        ctx.dispatch();

        let ack = last_sent(&sent);
        assert_eq!(ack.mtype(), MessageType::Acknowledgement);
        assert_eq!(ack.code(), codes::EMPTY);
        assert_eq!(ack.message_id(), 0x0abc);
    }

    // Version 0 frames never make it into the queue; a crafted queue
    // entry with a bad version is dropped by dispatch as well.
    #[test]
    fn handlers_see_nothing_for_rejected_frames() {
        let (mut ctx, sent) = test_context();
        assert!(ctx
            .enqueue_datagram(&[0x00, 0x01, 0x00, 0x01], peer())
            .is_err());
        ctx.dispatch();
        assert!(sent.lock().unwrap().is_empty());
    }

    // The pluggable local-delivery predicate can veto handling.
    #[test]
    fn local_delivery_predicate_vetoes_handling() {
        let (mut ctx, sent) = test_context();
        ctx.set_local_delivery(|_, _| false);
        let get = request(MessageType::Confirmable, codes::GET, 1, &["missing"], None);
        ctx.enqueue_datagram(get.as_bytes(), peer()).unwrap();
        ctx.dispatch();
        assert!(sent.lock().unwrap().is_empty());
        assert!(ctx.can_exit());
    }
}
