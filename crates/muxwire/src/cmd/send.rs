use std::fs;

use muxwire_frame::SharedMessage;
use muxwire_peer::Client;
use uuid::Uuid;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let client = Client::new();
    client
        .connect(args.addr)
        .map_err(|err| peer_error("connect failed", err))?;
    let context = client
        .message_context()
        .ok_or_else(|| CliError::new(FAILURE, "connection closed"))?;
    let channel = context
        .get_or_create_channel(args.channel)
        .map_err(|err| peer_error("channel setup failed", err))?;

    let message = SharedMessage::new(Uuid::nil(), payload);
    tracing::debug!(channel = %args.channel, message = %message.id(), size = message.payload().len(), "sending");

    if !args.wait {
        channel
            .send(message)
            .map_err(|err| peer_error("send failed", err))?;
        client.shutdown();
        return Ok(SUCCESS);
    }

    let reply = channel
        .request(message, wait_timeout)
        .map_err(|err| peer_error("send failed", err))?;
    client.shutdown();

    match reply {
        Some(reply) => {
            print_message(args.channel, &reply, context.peer_addr(), format);
            Ok(SUCCESS)
        }
        None => Err(CliError::new(
            TIMEOUT,
            format!("no reply within {}ms", wait_timeout.as_millis()),
        )),
    }
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
