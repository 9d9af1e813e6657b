//! Confirmable GET client.
//!
//! `cargo run --example client -- 127.0.0.1:5683 /.well-known/core`
//!
//! Sends one confirmable request and drives the event loop until every
//! transaction is finished: either the response arrived or the
//! retransmission budget ran out.

use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};
use coap_endpoint::{
    codes, opts, CoapServer, EndpointContext, MessageType, Pdu, MAX_PDU_SIZE,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let target: SocketAddr = args
        .next()
        .context("usage: client <host:port> [path]")?
        .parse()
        .context("target address")?;
    let path = args.next().unwrap_or_else(|| "/.well-known/core".to_string());

    let mut ctx = EndpointContext::bind("0.0.0.0:0".parse()?)?;
    ctx.set_response_handler(Box::new(|_ctx, remote, _sent, response, _tid| {
        let code = response.code();
        println!(
            "{remote} responded {}.{:02}: {}",
            code >> 5,
            code & 0x1f,
            String::from_utf8_lossy(response.payload())
        );
    }));

    let message_id = ctx.next_message_id();
    let mut request = Pdu::new(MessageType::Confirmable, codes::GET, message_id, MAX_PDU_SIZE)
        .ok_or_else(|| anyhow!("cannot build request"))?;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        request.add_option(opts::URI_PATH, segment.as_bytes())?;
    }
    request.add_option(opts::TOKEN, &[0x42])?;

    ctx.send_confirmed(target.into(), request);
    CoapServer::new(ctx).run_until_idle().await?;
    Ok(())
}
