use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use muxwire_frame::{FrameWriter, NetworkMessage, SharedMessage, DEFAULT_CHANNEL};
use muxwire_peer::{
    Client, MessageContext, PeerConfig, PeerError, Result, Server, TransmitOptions,
};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("valid address")
}

/// Open `server` and run its accept loop on a background thread.
fn start(server: &Arc<Server>) -> (SocketAddr, JoinHandle<Result<()>>) {
    server.open().expect("server should bind");
    let addr = server.local_addr().expect("bound address");
    let accept = Arc::clone(server);
    (addr, thread::spawn(move || accept.run()))
}

fn stop(server: &Server, accept: JoinHandle<Result<()>>) {
    server.shutdown();
    accept
        .join()
        .expect("accept thread should finish")
        .expect("accept loop should end cleanly");
}

/// Echo every payload on the default channel back to the sender.
fn echo_server() -> Arc<Server> {
    let server = Arc::new(Server::new(loopback()));
    server.client_connected().subscribe(|context| {
        let channel = context
            .get_or_create_channel(DEFAULT_CHANNEL)
            .expect("fresh context accepts channels");
        let reply_on = channel.clone();
        channel.message_received().subscribe(move |event| {
            let _ = reply_on.send(SharedMessage::new(Uuid::nil(), event.message.payload().clone()));
        });
    });
    server
}

/// Forward the contexts the server accepts.
fn accepted(server: &Server) -> Receiver<MessageContext> {
    let (tx, rx) = mpsc::channel();
    server.client_connected().subscribe(move |context| {
        let _ = tx.send(context.clone());
    });
    rx
}

fn payloads_on(client: &Client, channel: Uuid) -> Receiver<Bytes> {
    let (tx, rx) = mpsc::channel();
    client
        .message_context()
        .expect("connected client has a context")
        .get_or_create_channel(channel)
        .expect("live context accepts channels")
        .message_received()
        .subscribe(move |event| {
            let _ = tx.send(event.message.payload().clone());
        });
    rx
}

#[test]
fn ping_is_echoed_back() {
    let server = echo_server();
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let received = payloads_on(&client, DEFAULT_CHANNEL);

    let channel = client
        .message_context()
        .expect("context")
        .get_or_create_channel(DEFAULT_CHANNEL)
        .expect("channel");
    channel
        .send(SharedMessage::new(Uuid::nil(), "ping"))
        .expect("send should succeed");

    let payload = received.recv_timeout(WAIT).expect("echo should arrive");
    assert_eq!(payload.as_ref(), b"ping");

    client.shutdown();
    stop(&server, accept);
}

#[test]
fn frames_reach_only_their_channel() {
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let server = Arc::new(Server::new(loopback()));
    let (tx, rx) = mpsc::channel::<(Uuid, Uuid, Bytes)>();
    server.client_connected().subscribe(move |context| {
        for guid in [first, second] {
            let tx = tx.clone();
            context
                .get_or_create_channel(guid)
                .expect("channel")
                .message_received()
                .subscribe(move |event| {
                    let _ = tx.send((guid, event.channel_guid, event.message.payload().clone()));
                });
        }
    });
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let context = client.message_context().expect("context");
    context
        .get_or_create_channel(first)
        .expect("channel")
        .send(SharedMessage::new(Uuid::nil(), "one"))
        .expect("send");
    context
        .get_or_create_channel(second)
        .expect("channel")
        .send(SharedMessage::new(Uuid::nil(), "two"))
        .expect("send");
    context
        .get_or_create_channel(Uuid::new_v4())
        .expect("channel")
        .send(SharedMessage::new(Uuid::nil(), "nobody"))
        .expect("send");

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(rx.recv_timeout(WAIT).expect("routed message"));
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    seen.sort_by_key(|(subscriber, _, _)| *subscriber == second);
    assert_eq!(seen[0], (first, first, Bytes::from_static(b"one")));
    assert_eq!(seen[1], (second, second, Bytes::from_static(b"two")));

    client.shutdown();
    stop(&server, accept);
}

#[test]
fn request_unblocks_only_on_matching_reply() {
    let server = Arc::new(Server::new(loopback()));
    server.client_connected().subscribe(|context| {
        let channel = context.get_or_create_channel(DEFAULT_CHANNEL).expect("channel");
        let reply_on = channel.clone();
        channel.message_received().subscribe(move |event| {
            let request = &event.message;
            let _ = reply_on.send(SharedMessage::new(Uuid::nil(), "unrelated"));
            let _ = reply_on.send(SharedMessage::new(Uuid::new_v4(), "someone else's"));
            thread::sleep(Duration::from_millis(100));
            let _ = reply_on.send(request.reply("answer"));
            let _ = reply_on.send(request.reply("late duplicate"));
        });
    });
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let everything = payloads_on(&client, DEFAULT_CHANNEL);
    let channel = client
        .message_context()
        .expect("context")
        .get_or_create_channel(DEFAULT_CHANNEL)
        .expect("channel");

    let request = SharedMessage::new(Uuid::nil(), "question");
    let request_id = request.id();
    let reply = channel
        .request(request, WAIT)
        .expect("request should succeed")
        .expect("reply should arrive");

    assert_eq!(reply.reply_to(), request_id);
    assert_eq!(reply.payload().as_ref(), b"answer");

    let mut observed = Vec::new();
    for _ in 0..4 {
        observed.push(everything.recv_timeout(WAIT).expect("all traffic is published"));
    }
    assert_eq!(
        observed,
        vec![
            Bytes::from_static(b"unrelated"),
            Bytes::from_static(b"someone else's"),
            Bytes::from_static(b"answer"),
            Bytes::from_static(b"late duplicate"),
        ]
    );
    assert_eq!(channel.message_received().subscriber_count(), 1);
    assert_eq!(channel.pending_requests(), 0);

    client.shutdown();
    stop(&server, accept);
}

#[test]
fn handler_can_request_on_its_own_connection() {
    let server = Arc::new(Server::new(loopback()));
    server.client_connected().subscribe(|context| {
        let channel = context.get_or_create_channel(DEFAULT_CHANNEL).expect("channel");
        let asker = channel.clone();
        channel.message_received().subscribe(move |event| {
            if event.message.is_reply() {
                return;
            }
            let started = Instant::now();
            let follow_up = asker
                .request(SharedMessage::new(Uuid::nil(), "follow-up"), WAIT)
                .expect("follow-up request should be sent");
            let answer = match follow_up {
                Some(reply) if started.elapsed() < Duration::from_secs(2) => reply.payload().clone(),
                _ => Bytes::from_static(b"no answer"),
            };
            let _ = asker.send(event.message.reply(answer));
        });
    });
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let channel = client
        .message_context()
        .expect("context")
        .get_or_create_channel(DEFAULT_CHANNEL)
        .expect("channel");
    let answering = channel.clone();
    channel.message_received().subscribe(move |event| {
        if !event.message.is_reply() {
            let _ = answering.send(event.message.reply("answer"));
        }
    });

    let reply = channel
        .request(SharedMessage::new(Uuid::nil(), "question"), WAIT)
        .expect("request should succeed")
        .expect("reply should arrive");
    assert_eq!(reply.payload().as_ref(), b"answer");

    client.shutdown();
    stop(&server, accept);
}

#[test]
fn wait_for_reply_times_out_when_server_is_silent() {
    let server = Arc::new(Server::new(loopback()));
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let channel = client
        .message_context()
        .expect("context")
        .get_or_create_channel(DEFAULT_CHANNEL)
        .expect("channel");

    let started = Instant::now();
    let replied = channel
        .send_with(
            SharedMessage::new(Uuid::nil(), "hello?"),
            TransmitOptions::wait_for_reply(Duration::from_millis(500)),
        )
        .expect("send should succeed");
    let elapsed = started.elapsed();

    assert!(!replied);
    assert!(elapsed >= Duration::from_millis(500), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned late: {elapsed:?}");

    client.shutdown();
    stop(&server, accept);
}

#[test]
fn repeated_disconnect_fires_one_event() {
    let server = Arc::new(Server::new(loopback()));
    let (gone_tx, gone_rx) = mpsc::channel();
    server.client_disconnected().subscribe(move |context| {
        let _ = gone_tx.send(context.guid());
    });
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let context = client.message_context().expect("context");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    context.disconnected().subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| context.disconnect());
        }
        scope.spawn(|| client.shutdown());
    });
    client.shutdown();
    context.disconnect();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!context.is_connected());

    gone_rx.recv_timeout(WAIT).expect("server notices the disconnect");
    assert!(gone_rx.recv_timeout(Duration::from_millis(200)).is_err());
    stop(&server, accept);
}

#[test]
fn messages_arrive_in_send_order() {
    const COUNT: u32 = 200;
    let server = Arc::new(Server::new(loopback()));
    let (tx, rx) = mpsc::channel::<u32>();
    server.client_connected().subscribe(move |context| {
        let tx = tx.clone();
        context
            .get_or_create_channel(DEFAULT_CHANNEL)
            .expect("channel")
            .message_received()
            .subscribe(move |event| {
                let raw: [u8; 4] = event.message.payload().as_ref().try_into().expect("u32 payload");
                let _ = tx.send(u32::from_le_bytes(raw));
            });
    });
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let channel = client
        .message_context()
        .expect("context")
        .get_or_create_channel(DEFAULT_CHANNEL)
        .expect("channel");
    for i in 0..COUNT {
        channel
            .send(SharedMessage::new(Uuid::nil(), i.to_le_bytes().to_vec()))
            .expect("send");
    }

    let received: Vec<u32> = (0..COUNT)
        .map(|_| rx.recv_timeout(WAIT).expect("every message arrives"))
        .collect();
    assert_eq!(received, (0..COUNT).collect::<Vec<_>>());

    client.shutdown();
    stop(&server, accept);
}

#[test]
fn concurrent_channels_share_one_connection_intact() {
    let server = echo_server();
    let contexts = accepted(&server);
    let (addr, accept) = start(&server);

    let (tx, rx) = mpsc::channel::<(Uuid, Bytes)>();
    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let server_side = contexts.recv_timeout(WAIT).expect("server accepted");

    let guids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    for guid in &guids {
        let tx = tx.clone();
        server_side
            .get_or_create_channel(*guid)
            .expect("channel")
            .message_received()
            .subscribe(move |event| {
                let _ = tx.send((event.channel_guid, event.message.payload().clone()));
            });
    }

    let context = client.message_context().expect("context");
    thread::scope(|scope| {
        for guid in &guids {
            let channel = context.get_or_create_channel(*guid).expect("channel");
            scope.spawn(move || {
                for i in 0..50 {
                    let payload = format!("{guid}:{i}:").repeat(64);
                    channel
                        .send(SharedMessage::new(Uuid::nil(), payload))
                        .expect("send");
                }
            });
        }
    });

    let mut next = std::collections::HashMap::new();
    for _ in 0..200 {
        let (guid, payload) = rx.recv_timeout(WAIT).expect("message arrives");
        let i = next.entry(guid).or_insert(0usize);
        assert_eq!(payload, Bytes::from(format!("{guid}:{i}:").repeat(64)));
        *i += 1;
    }
    assert!(next.values().all(|count| *count == 50));

    client.shutdown();
    stop(&server, accept);
}

#[test]
fn abrupt_client_close_disconnects_server_side_once() {
    let server = Arc::new(Server::new(loopback()));
    let contexts = accepted(&server);
    let (gone_tx, gone_rx) = mpsc::channel();
    server.client_disconnected().subscribe(move |context| {
        let _ = gone_tx.send(context.guid());
    });
    let (addr, accept) = start(&server);

    let raw = TcpStream::connect(addr).expect("raw connect");
    let context = contexts.recv_timeout(WAIT).expect("server accepted");
    assert_eq!(server.connection_count(), 1);

    drop(raw);

    let guid = gone_rx.recv_timeout(WAIT).expect("server notices the close");
    assert_eq!(guid, context.guid());
    assert!(gone_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(!context.is_connected());
    assert_eq!(server.connection_count(), 0);

    stop(&server, accept);
}

#[test]
fn abrupt_server_close_disconnects_client_once() {
    let listener = TcpListener::bind(loopback()).expect("bind");
    let addr = listener.local_addr().expect("addr");

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let (accepted, _) = listener.accept().expect("accept");

    let context = client.message_context().expect("context");
    let (tx, rx) = mpsc::channel();
    context.disconnected().subscribe(move |context| {
        let _ = tx.send(context.guid());
    });

    drop(accepted);

    assert_eq!(rx.recv_timeout(WAIT).expect("client notices the close"), context.guid());
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(!context.is_connected());
    client.shutdown();
}

#[test]
fn server_shutdown_disconnects_clients() {
    let server = echo_server();
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let context = client.message_context().expect("context");
    let channel = context.get_or_create_channel(DEFAULT_CHANNEL).expect("channel");
    let (tx, rx) = mpsc::channel();
    context.disconnected().subscribe(move |_| {
        let _ = tx.send(());
    });

    // Make sure the server side exists before shutting down.
    let received = payloads_on(&client, DEFAULT_CHANNEL);
    channel.send(SharedMessage::new(Uuid::nil(), "hi")).expect("send");
    received.recv_timeout(WAIT).expect("echo");

    stop(&server, accept);

    rx.recv_timeout(WAIT).expect("client notices the shutdown");
    assert!(matches!(
        channel.send(SharedMessage::new(Uuid::nil(), "after")),
        Err(PeerError::ChannelClosed(_))
    ));
    assert!(matches!(
        context.get_or_create_channel(DEFAULT_CHANNEL),
        Err(PeerError::Disposed(_))
    ));
}

#[test]
fn pending_request_fails_when_connection_drops() {
    let server = Arc::new(Server::new(loopback()));
    server.client_connected().subscribe(|context| {
        let channel = context.get_or_create_channel(DEFAULT_CHANNEL).expect("channel");
        let context = context.clone();
        channel.message_received().subscribe(move |_| context.disconnect());
    });
    let (addr, accept) = start(&server);

    let client = Client::new();
    client.connect(addr).expect("client should connect");
    let channel = client
        .message_context()
        .expect("context")
        .get_or_create_channel(DEFAULT_CHANNEL)
        .expect("channel");

    let started = Instant::now();
    let result = channel.request(SharedMessage::new(Uuid::nil(), "bye"), Duration::from_secs(10));
    assert!(matches!(result, Err(PeerError::Disconnected(_))));
    assert!(started.elapsed() < WAIT);

    client.shutdown();
    stop(&server, accept);
}

#[test]
fn oversized_inbound_frame_disconnects() {
    let config = PeerConfig::default().with_max_payload_size(16);
    let server = Arc::new(Server::with_config(loopback(), config));
    let (gone_tx, gone_rx) = mpsc::channel();
    server.client_disconnected().subscribe(move |_| {
        let _ = gone_tx.send(());
    });
    let (addr, accept) = start(&server);

    let raw = TcpStream::connect(addr).expect("raw connect");
    let mut writer = FrameWriter::new(raw);
    writer
        .write_message(&NetworkMessage::new(
            DEFAULT_CHANNEL,
            SharedMessage::new(Uuid::nil(), vec![0u8; 64]),
        ))
        .expect("raw write");

    gone_rx.recv_timeout(WAIT).expect("server drops the connection");
    stop(&server, accept);
}

#[test]
fn handler_can_register_channels_before_traffic() {
    // Frames written before the server even accepts must still be routed.
    let server = echo_server();
    let (addr, accept) = start(&server);

    let mut writer = FrameWriter::new(TcpStream::connect(addr).expect("raw connect"));
    writer
        .write_message(&NetworkMessage::new(
            DEFAULT_CHANNEL,
            SharedMessage::new(Uuid::nil(), "early"),
        ))
        .expect("raw write");

    let stream = writer.into_inner();
    stream
        .set_read_timeout(Some(WAIT))
        .expect("set read timeout");
    let mut reader = muxwire_frame::FrameReader::new(stream);
    let echoed = reader.read_frame().expect("echo arrives");
    assert_eq!(echoed.payload().as_ref(), b"early");

    stop(&server, accept);
}
