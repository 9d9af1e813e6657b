//! Single-socket CoAP endpoint engine.
//!
//! One UDP socket, two queues and a cooperative, single-threaded state
//! machine: confirmable messages are retransmitted with doubling
//! jittered timeouts until acknowledged or exhausted, received messages
//! are de-duplicated against outstanding transactions by a (peer, token)
//! transaction id, requests are routed to per-method resource handlers,
//! and `.well-known/core` discovery is answered from the resource
//! registry.  An async driver ([`CoapServer`]) integrates the engine
//! under tokio.
//!
//! # Examples
//! ```no_run
//! use coap_endpoint::{
//!     codes, media, new_response, resource, CoapServer, EndpointContext, FatalServerError,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FatalServerError> {
//!     let mut ctx = EndpointContext::bind("0.0.0.0:5683".parse().unwrap())?;
//!     ctx.add_resource(
//!         resource("/hello")
//!             .get(|ctx, _res, remote, request, _tid| {
//!                 if let Some(mut reply) =
//!                     new_response(request, codes::CONTENT, Some(media::TEXT_PLAIN))
//!                 {
//!                     let _ = reply.add_data(b"Hello, world");
//!                     ctx.send(remote, reply);
//!                 }
//!             })
//!             .build(),
//!     );
//!     CoapServer::new(ctx).run().await
//! }
//! ```

pub use context::{
    EndpointContext, LocalDeliveryPredicate, ReadError, ResponseHandler, TransmissionParameters,
};
pub use hash::{hash_path, transaction_id, wellknown_key, Key, TransactionId, WELLKNOWN_PATH};
pub use link::{CoreLink, LinkAttrValue};
pub use pdu::{codes, media, opts, MessageType, OptFilter, Pdu, PduError, MAX_PDU_SIZE};
pub use peer::{LinkAddress, PeerAddress};
pub use resource::{resource, MethodHandler, Resource, ResourceBuilder};
pub use response::{new_error_response, new_response, response_phrase};
pub use server::{CoapServer, FatalServerError};
pub use udp::{DatagramSocket, UdpChannel};

pub mod clock;
pub mod context;
pub mod dispatch;
pub mod hash;
pub mod link;
pub mod pdu;
pub mod peer;
pub mod queue;
pub mod resource;
pub mod response;
pub mod server;
pub mod udp;

/// Default CoAP port.
pub const DEFAULT_PORT: u16 = 5683;
