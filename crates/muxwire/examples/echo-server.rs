//! Minimal echo server: replies to every default-channel message with its payload.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send 127.0.0.1:7878 --data hello --wait --wait-timeout 3s

use std::sync::Arc;

use muxwire::frame::DEFAULT_CHANNEL;
use muxwire::peer::Server;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(Server::new("127.0.0.1:7878".parse()?));

    server.client_connected().subscribe(|context| {
        eprintln!("Client connected: {} ({})", context.guid(), context.peer_addr());
        let Ok(channel) = context.get_or_create_channel(DEFAULT_CHANNEL) else {
            return;
        };
        let reply_on = channel.clone();
        channel.message_received().subscribe(move |event| {
            eprintln!("Received {} bytes", event.message.payload().len());
            let reply = event.message.reply(event.message.payload().clone());
            if let Err(e) = reply_on.send(reply) {
                eprintln!("Reply failed: {e}");
            }
        });
    });
    server.client_disconnected().subscribe(|context| {
        eprintln!("Client disconnected: {}", context.guid());
    });

    server.open()?;
    if let Some(addr) = server.local_addr() {
        eprintln!("Listening on {addr}");
    }
    server.run()?;
    Ok(())
}
