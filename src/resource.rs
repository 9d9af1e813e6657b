//! Resources and their per-method handler tables.
//!
//! A resource is looked up by the 4-byte hash of the request's Uri-Path
//! option sequence and dispatches through a fixed array of optional
//! handlers indexed by method code.  Handlers are fully responsible for
//! any reply; the router only synthesizes responses when no handler is
//! registered.

use crate::context::EndpointContext;
use crate::hash::{self, Key, TransactionId};
use crate::link::{CoreLink, LinkAttrValue};
use crate::pdu::{codes, Pdu};
use crate::peer::PeerAddress;

/// Per-method request handler.  Invoked as
/// `handler(ctx, resource, remote, request, transaction_id)`; the request
/// PDU must not be retained past the call.
pub type MethodHandler =
    Box<dyn Fn(&mut EndpointContext, &Resource, &PeerAddress, &Pdu, TransactionId) + Send + Sync>;

pub struct Resource {
    key: Key,
    path: String,
    link_str: String,
    discoverable: bool,
    handlers: [Option<MethodHandler>; 4],
}

impl Resource {
    pub fn key(&self) -> Key {
        self.key
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Preformatted `.well-known/core` entry for this resource.
    pub fn link_str(&self) -> &str {
        &self.link_str
    }

    pub fn is_discoverable(&self) -> bool {
        self.discoverable
    }

    /// Handler registered for a request method code, if any.
    pub fn handler_for(&self, method: u8) -> Option<&MethodHandler> {
        if codes::is_request(method) {
            self.handlers[usize::from(method) - 1].as_ref()
        } else {
            None
        }
    }
}

/// Starts building a resource for the given URI path, e.g.
/// `resource("/sensors/temp")`.
pub fn resource(path: &str) -> ResourceBuilder {
    ResourceBuilder::new(path)
}

/// Fluent configuration of a [`Resource`], its link attributes and its
/// per-method handlers.
pub struct ResourceBuilder {
    path: String,
    link: CoreLink,
    discoverable: bool,
    handlers: [Option<MethodHandler>; 4],
}

impl ResourceBuilder {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            link: CoreLink::new(path),
            discoverable: true,
            handlers: [None, None, None, None],
        }
    }

    /// Excludes this resource from `.well-known/core` discovery.
    pub fn not_discoverable(mut self) -> Self {
        self.discoverable = false;
        self
    }

    /// Adds an attribute to the CoRE link entry, e.g.
    /// `link_attr("rt", LinkAttrValue::Quoted("temperature".into()))`.
    pub fn link_attr(mut self, key: &'static str, value: LinkAttrValue) -> Self {
        self.link.attr(key, value);
        self
    }

    pub fn get(
        self,
        handler: impl Fn(&mut EndpointContext, &Resource, &PeerAddress, &Pdu, TransactionId)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.handler(codes::GET, Box::new(handler))
    }

    pub fn post(
        self,
        handler: impl Fn(&mut EndpointContext, &Resource, &PeerAddress, &Pdu, TransactionId)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.handler(codes::POST, Box::new(handler))
    }

    pub fn put(
        self,
        handler: impl Fn(&mut EndpointContext, &Resource, &PeerAddress, &Pdu, TransactionId)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.handler(codes::PUT, Box::new(handler))
    }

    pub fn delete(
        self,
        handler: impl Fn(&mut EndpointContext, &Resource, &PeerAddress, &Pdu, TransactionId)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.handler(codes::DELETE, Box::new(handler))
    }

    fn handler(mut self, method: u8, handler: MethodHandler) -> Self {
        self.handlers[usize::from(method) - 1] = Some(handler);
        self
    }

    pub fn build(self) -> Resource {
        let key = hash::hash_path(self.path.trim_start_matches('/').as_bytes());
        Resource {
            key,
            link_str: self.link.format_single_link(),
            path: self.path,
            discoverable: self.discoverable,
            handlers: self.handlers,
        }
    }
}
