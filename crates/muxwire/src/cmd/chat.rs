use std::io::BufRead;
use std::sync::Arc;

use muxwire_frame::SharedMessage;
use muxwire_peer::{Client, PeerError};
use uuid::Uuid;

use crate::cmd::{install_ctrlc_handler, ChatArgs};
use crate::exit::{io_error, peer_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: ChatArgs, format: OutputFormat) -> CliResult<i32> {
    let client = Arc::new(Client::new());
    client
        .connect(args.addr)
        .map_err(|err| peer_error("connect failed", err))?;

    let context = client
        .message_context()
        .ok_or_else(|| CliError::new(FAILURE, "connection closed"))?;
    let channel = context
        .get_or_create_channel(args.channel)
        .map_err(|err| peer_error("channel setup failed", err))?;

    let peer = context.peer_addr();
    channel.message_received().subscribe(move |event| {
        print_message(event.channel_guid, &event.message, peer, format);
    });
    context.disconnected().subscribe(move |_| {
        eprintln!("disconnected from {peer}");
    });

    let interrupted = Arc::clone(&client);
    install_ctrlc_handler(move || {
        interrupted.shutdown();
        std::process::exit(SUCCESS);
    })?;

    tracing::info!(%peer, channel = %args.channel, "connected, type lines to send");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(|err| io_error("reading stdin failed", err))?;
        if line.is_empty() {
            continue;
        }
        match channel.send(SharedMessage::new(Uuid::nil(), line)) {
            Ok(()) => {}
            Err(PeerError::ChannelClosed(_)) => {
                return Err(CliError::new(FAILURE, "connection closed"));
            }
            Err(err) => return Err(peer_error("send failed", err)),
        }
    }

    client.shutdown();
    Ok(SUCCESS)
}
