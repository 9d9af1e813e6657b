//! Minimal CoAP server: `/hello` and `/uptime` plus `.well-known/core`
//! discovery.
//!
//! Run with `cargo run --example server -- 0.0.0.0:5683`, then point the
//! client demo at it.

use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result};
use coap_endpoint::{
    codes, media, new_response, resource, CoapServer, EndpointContext, LinkAttrValue,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let listen: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:5683".to_string())
        .parse()
        .context("listen address")?;

    let started = Instant::now();
    let mut ctx = EndpointContext::bind(listen).context("bind")?;

    ctx.add_resource(
        resource("/hello")
            .link_attr("rt", LinkAttrValue::Quoted("greeting".into()))
            .link_attr("ct", LinkAttrValue::Uint(media::TEXT_PLAIN.into()))
            .get(|ctx, _res, remote, request, _tid| {
                if let Some(mut reply) =
                    new_response(request, codes::CONTENT, Some(media::TEXT_PLAIN))
                {
                    let _ = reply.add_data(b"Hello from coap-endpoint");
                    ctx.send(remote, reply);
                }
            })
            .build(),
    );

    ctx.add_resource(
        resource("/uptime")
            .link_attr("rt", LinkAttrValue::Quoted("uptime".into()))
            .get(move |ctx, _res, remote, request, _tid| {
                if let Some(mut reply) =
                    new_response(request, codes::CONTENT, Some(media::TEXT_PLAIN))
                {
                    let seconds = started.elapsed().as_secs().to_string();
                    let _ = reply.add_data(seconds.as_bytes());
                    ctx.send(remote, reply);
                }
            })
            .build(),
    );

    log::info!("listening on {listen}");
    CoapServer::new(ctx).run().await?;
    Ok(())
}
