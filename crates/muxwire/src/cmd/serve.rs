use std::sync::Arc;

use dashmap::DashMap;
use muxwire_frame::{SharedMessage, DEFAULT_CHANNEL};
use muxwire_peer::{MessageChannel, MessageContext, MessageEvent, PeerConfig, Server};
use uuid::Uuid;

use crate::cmd::{install_ctrlc_handler, ServeArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

/// Default channels of every connected client, keyed by context id.
type Members = Arc<DashMap<Uuid, MessageChannel>>;

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = PeerConfig::default();
    if let Some(max) = args.max_payload {
        config = config.with_max_payload_size(max);
    }

    let server = Arc::new(Server::with_config(args.addr, config));
    let members: Members = Arc::new(DashMap::new());

    {
        let members = Arc::clone(&members);
        server.client_connected().subscribe(move |context| {
            join(context, &members, format);
        });
    }
    {
        let members = Arc::clone(&members);
        server.client_disconnected().subscribe(move |context| {
            members.remove(&context.guid());
            tracing::info!(context = %context.guid(), peer = %context.peer_addr(), "client left");
        });
    }

    server.open().map_err(|err| peer_error("bind failed", err))?;
    if let Some(addr) = server.local_addr() {
        tracing::info!(%addr, "relay server listening");
    }

    let interrupted = Arc::clone(&server);
    install_ctrlc_handler(move || interrupted.shutdown())?;

    server.run().map_err(|err| peer_error("accept failed", err))?;
    Ok(SUCCESS)
}

fn join(context: &MessageContext, members: &Members, format: OutputFormat) {
    let channel = match context.get_or_create_channel(DEFAULT_CHANNEL) {
        Ok(channel) => channel,
        Err(err) => {
            tracing::warn!(context = %context.guid(), error = %err, "client left before joining");
            return;
        }
    };

    let sender = context.guid();
    let peer = context.peer_addr();
    let relay = Arc::clone(members);
    channel.message_received().subscribe(move |event| {
        print_message(event.channel_guid, &event.message, peer, format);
        relay_to_members(&relay, sender, event);
    });

    members.insert(context.guid(), channel);
    tracing::info!(context = %context.guid(), %peer, "client joined");
}

/// Forward `event` to every member. The sender gets a reply to its own
/// message so a waiting `send --wait` unblocks; everyone else gets a copy.
fn relay_to_members(members: &DashMap<Uuid, MessageChannel>, sender: Uuid, event: &MessageEvent) {
    let targets: Vec<(Uuid, MessageChannel)> = members
        .iter()
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect();

    for (member, channel) in targets {
        let message = if member == sender {
            event.message.reply(event.message.payload().clone())
        } else {
            SharedMessage::new(Uuid::nil(), event.message.payload().clone())
        };
        if let Err(err) = channel.send(message) {
            tracing::debug!(context = %member, error = %err, "relay skipped");
        }
    }
}
