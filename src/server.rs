//! Async driver for the synchronous engine.
//!
//! The engine itself never suspends; this wrapper integrates it under a
//! tokio event loop exactly the way the engine expects from any host:
//! call [`EndpointContext::read`] when the socket is readable, dispatch
//! immediately after, and arm a timer against the deadline of the send
//! queue head.

use std::io;

use log::warn;

use crate::context::{EndpointContext, ReadError};

/// Unrecoverable failure of the underlying socket.  Per-peer problems
/// (malformed frames, unreachable peers) never surface here; the server
/// keeps running through those.
#[derive(thiserror::Error, Debug)]
pub enum FatalServerError {
    #[error("fatal transport error: {0}")]
    Io(#[from] io::Error),
}

/// Runs an [`EndpointContext`] under tokio.
pub struct CoapServer {
    ctx: EndpointContext,
}

impl CoapServer {
    pub fn new(ctx: EndpointContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EndpointContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut EndpointContext {
        &mut self.ctx
    }

    pub fn into_context(self) -> EndpointContext {
        self.ctx
    }

    /// Serves forever.  Returns only on a fatal socket error.
    pub async fn run(&mut self) -> Result<(), FatalServerError> {
        loop {
            self.turn().await?;
        }
    }

    /// Serves until both queues are empty: every outstanding confirmable
    /// exchange is finished (or exhausted) and nothing is waiting to be
    /// dispatched.  This is the client-side main loop.
    pub async fn run_until_idle(&mut self) -> Result<(), FatalServerError> {
        while !self.ctx.can_exit() {
            self.turn().await?;
        }
        Ok(())
    }

    /// One event-loop turn: whichever of "socket readable" and "head
    /// retransmission deadline" fires first.
    async fn turn(&mut self) -> Result<(), FatalServerError> {
        match self.ctx.next_retransmit_at() {
            Some(deadline) => {
                tokio::select! {
                    ready = self.ctx.readable() => {
                        ready?;
                        self.pump();
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        self.ctx.retransmit_expired();
                    }
                }
            }
            None => {
                self.ctx.readable().await?;
                self.pump();
            }
        }
        Ok(())
    }

    /// Drains every pending datagram into the receive queue, then
    /// dispatches the lot.
    fn pump(&mut self) {
        loop {
            match self.ctx.read() {
                Ok(()) => {}
                Err(ReadError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ReadError::Io(e)) => {
                    warn!("socket receive failed: {e}");
                    break;
                }
                // rejected datagram, already logged; keep draining
                Err(_) => {}
            }
        }
        self.ctx.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TransmissionParameters;
    use crate::pdu::{codes, MessageType, Pdu};
    use crate::peer::PeerAddress;
    use crate::udp::testing::MockSocket;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[tokio::test(start_paused = true)]
    async fn timer_turns_drive_the_retransmission_schedule() {
        let (socket, sent) = MockSocket::new();
        let ctx =
            EndpointContext::with_socket(Box::new(socket), 7, TransmissionParameters::default());
        let mut server = CoapServer::new(ctx);

        let peer = PeerAddress::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5683));
        let con = Pdu::new(MessageType::Confirmable, codes::GET, 0x0077, 16).unwrap();
        server.context_mut().send_confirmed(peer, con).unwrap();

        // with the socket forever quiet, run_until_idle walks the whole
        // retransmission schedule and returns once the node is dropped
        server.run_until_idle().await.unwrap();
        assert!(server.context().can_exit());
        let max = server.context().params().max_retransmit() as usize;
        assert_eq!(sent.lock().unwrap().len(), 1 + max);
    }
}
