//! End-to-end scenarios over in-memory transports. The test body plays the
//! remote peer by reading and writing raw frames on the other end of the
//! duplex link.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::congestion::CONGESTION_IDLE;
use crate::framing::{FrameReader, FrameWriter};
use crate::*;

type RemoteReader = FrameReader<ReadHalf<DuplexStream>>;
type RemoteWriter = FrameWriter<WriteHalf<DuplexStream>>;

/// Dispatcher for a test, with log capture wired to the test harness.
/// `RUST_LOG=tether=debug cargo test -- --nocapture` shows driver traffic.
fn test_dispatcher() -> Dispatcher {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Dispatcher::new("tests").unwrap()
}

async fn expect_hello(reader: &mut RemoteReader) -> Vec<String> {
    match reader.recv().await.unwrap().unwrap() {
        Frame::Hello { services } => services,
        other => panic!("expected hello, got {other:?}"),
    }
}

/// Attach a channel over a memory transport, complete the hello exchange
/// with `remote_services`, and hand back the remote's frame endpoints.
async fn open_channel(
    dispatcher: &DispatcherHandle,
    remote_services: &[&str],
) -> (Channel, RemoteReader, RemoteWriter) {
    let (local, remote) = memory_pair();
    let channel = Channel::attach(dispatcher, local, Peer::new("client"), "server");
    channel.start();

    let (r, w) = tokio::io::split(remote);
    let mut reader = FrameReader::new(r);
    let mut writer = FrameWriter::new(w);

    expect_hello(&mut reader).await;
    writer
        .send(&Frame::Hello {
            services: remote_services.iter().map(|s| s.to_string()).collect(),
        })
        .await
        .unwrap();
    channel.wait_open().await.unwrap();

    (channel, reader, writer)
}

/// Listener registration travels on the ops queue while remote events
/// arrive on the transport; sending an event of our own and watching it
/// come out the far end proves the driver has processed every prior op.
async fn fence(channel: &Channel, reader: &mut RemoteReader) {
    channel.send_event("Fence", "f", vec![]).await.unwrap();
    match reader.recv().await.unwrap().unwrap() {
        Frame::Event { service, .. } => assert_eq!(service, "Fence"),
        other => panic!("expected fence event, got {other:?}"),
    }
}

#[tokio::test]
async fn command_round_trip_over_memory_transport() {
    let dispatcher = test_dispatcher();
    let (channel, mut reader, mut writer) =
        open_channel(dispatcher.handle(), &["Echo", LOCATOR_SERVICE]).await;

    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.remote_peer_id(), "server");
    assert_eq!(
        channel.remote_services(),
        vec!["Echo".to_string(), LOCATOR_SERVICE.to_string()]
    );

    let issue = channel.command("Echo", "echo", b"ping".to_vec());
    let serve = async {
        match reader.recv().await.unwrap().unwrap() {
            Frame::Command {
                token,
                service,
                name,
                args,
            } => {
                assert_eq!(service, "Echo");
                assert_eq!(name, "echo");
                writer
                    .send(&Frame::Result { token, data: args })
                    .await
                    .unwrap();
            }
            other => panic!("expected command, got {other:?}"),
        }
    };
    let (result, ()) = tokio::join!(issue, serve);
    assert_eq!(result.unwrap(), b"ping");

    // A completed command leaves the channel open.
    assert_eq!(channel.state(), ChannelState::Open);
    dispatcher.shutdown();
}

#[tokio::test]
async fn progress_reports_arrive_before_the_result() {
    let dispatcher = test_dispatcher();
    let (channel, mut reader, mut writer) = open_channel(dispatcher.handle(), &["Job"]).await;

    let progress = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();

    let seen = Arc::clone(&progress);
    let handler = CommandHandler::new(move |_token, outcome| {
        let _ = done_tx.send(outcome);
    })
    .with_progress(move |_token, data| {
        seen.lock().unwrap().push(data.to_vec());
    });

    let token = channel
        .send_command("Job", "run", vec![], handler)
        .await
        .unwrap();

    match reader.recv().await.unwrap().unwrap() {
        Frame::Command { token: t, .. } => assert_eq!(t, token),
        other => panic!("expected command, got {other:?}"),
    }
    for pct in [b"25".to_vec(), b"50".to_vec()] {
        writer
            .send(&Frame::Progress { token, data: pct })
            .await
            .unwrap();
    }
    writer
        .send(&Frame::Result {
            token,
            data: b"done".to_vec(),
        })
        .await
        .unwrap();

    match done_rx.await.unwrap() {
        CommandOutcome::Result(data) => assert_eq!(data, b"done"),
        other => panic!("expected result, got {other:?}"),
    }
    // Both progress payloads were delivered, in order, before the result.
    assert_eq!(*progress.lock().unwrap(), vec![b"25".to_vec(), b"50".to_vec()]);
    dispatcher.shutdown();
}

#[tokio::test]
async fn commands_issued_while_opening_flush_on_open() {
    let dispatcher = test_dispatcher();
    let (local, remote) = memory_pair();
    let channel = Channel::attach(dispatcher.handle(), local, Peer::new("client"), "server");
    channel.start();

    // Issued before the remote hello: must be queued, not lost.
    let early = channel.command("Echo", "echo", b"early".to_vec());

    let script = async {
        let (r, w) = tokio::io::split(remote);
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);

        expect_hello(&mut reader).await;
        writer
            .send(&Frame::Hello {
                services: vec!["Echo".into()],
            })
            .await
            .unwrap();
        match reader.recv().await.unwrap().unwrap() {
            Frame::Command { token, args, .. } => {
                writer
                    .send(&Frame::Result { token, data: args })
                    .await
                    .unwrap();
            }
            other => panic!("expected command, got {other:?}"),
        }
    };
    let (result, ()) = tokio::join!(early, script);
    assert_eq!(result.unwrap(), b"early");
    dispatcher.shutdown();
}

#[tokio::test]
async fn severed_transport_terminates_pending_commands() {
    let dispatcher = test_dispatcher();
    let (channel, reader, writer) = open_channel(dispatcher.handle(), &["Echo"]).await;

    let pending = channel.command("Echo", "echo", b"x".to_vec());
    let sever = async move {
        let mut reader = reader;
        reader.recv().await.unwrap();
        drop(reader);
        drop(writer);
    };
    let (result, ()) = tokio::join!(pending, sever);

    assert!(matches!(result, Err(ChannelError::Io(_))));
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel.close_cause().is_some());
    dispatcher.shutdown();
}

#[tokio::test]
async fn close_terminates_every_pending_command_once() {
    let dispatcher = test_dispatcher();
    let (channel, mut reader, _writer) = open_channel(dispatcher.handle(), &["Slow"]).await;

    let (closed_tx, closed_rx) = oneshot::channel();
    channel.add_channel_listener(ChannelEvents::new().on_closed(move |cause| {
        let _ = closed_tx.send(cause);
    }));

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let outcomes = Arc::clone(&outcomes);
        let handler = CommandHandler::new(move |_token, outcome| {
            outcomes.lock().unwrap().push(outcome);
        });
        channel
            .send_command("Slow", "wait", vec![], handler)
            .await
            .unwrap();
    }
    for _ in 0..3 {
        reader.recv().await.unwrap();
    }

    channel.close();
    let cause = closed_rx.await.unwrap();
    assert!(cause.is_none(), "graceful close carries no cause");

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 3, "each pending command completes once");
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, CommandOutcome::Terminated(ChannelError::Closed))));

    // The remote sees a graceful close frame.
    match reader.recv().await.unwrap().unwrap() {
        Frame::Close { cause } => assert!(cause.is_none()),
        other => panic!("expected close, got {other:?}"),
    }
    dispatcher.shutdown();
}

#[tokio::test]
async fn close_keeps_congestion_accounting_balanced() {
    let dispatcher = test_dispatcher();
    let (channel, mut reader, _writer) = open_channel(dispatcher.handle(), &["Echo"]).await;

    channel.close();
    match reader.recv().await.unwrap().unwrap() {
        Frame::Close { cause } => assert!(cause.is_none()),
        other => panic!("expected close, got {other:?}"),
    }

    // The close frame passes through the congestion tracker like any other
    // frame, so the writer's flush accounting balances and a still-held
    // handle settles back to the idle level instead of underflowing.
    let mut level = channel.congestion();
    for _ in 0..200 {
        if level == CONGESTION_IDLE {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        level = channel.congestion();
    }
    assert_eq!(level, CONGESTION_IDLE);
    dispatcher.shutdown();
}

#[tokio::test]
async fn send_on_a_closed_channel_fires_the_handler() {
    let dispatcher = test_dispatcher();
    let (channel, mut reader, _writer) = open_channel(dispatcher.handle(), &["Echo"]).await;

    channel.close();
    match reader.recv().await.unwrap().unwrap() {
        Frame::Close { .. } => {}
        other => panic!("expected close, got {other:?}"),
    }
    for _ in 0..200 {
        if channel.state() == ChannelState::Closed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(channel.state(), ChannelState::Closed);

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let handler = CommandHandler::new(move |_token, outcome| {
        sink.lock().unwrap().push(outcome);
    });
    let result = channel.send_command("Echo", "echo", vec![], handler).await;

    // Both the return value and the handler report the same cause: the
    // handler's exactly-once completion holds even for refused sends.
    assert!(matches!(result, Err(ChannelError::Closed)));
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        CommandOutcome::Terminated(ChannelError::Closed)
    ));
    dispatcher.shutdown();
}

#[tokio::test]
async fn inbound_command_for_unknown_service_is_fatal() {
    let dispatcher = test_dispatcher();
    let (channel, _reader, mut writer) = open_channel(dispatcher.handle(), &["Echo"]).await;

    let (closed_tx, closed_rx) = oneshot::channel();
    channel.add_channel_listener(ChannelEvents::new().on_closed(move |cause| {
        let _ = closed_tx.send(cause);
    }));

    writer
        .send(&Frame::Command {
            token: Token::new(9),
            service: "Ghost".into(),
            name: "boo".into(),
            args: vec![],
        })
        .await
        .unwrap();

    let cause = closed_rx.await.unwrap();
    assert!(matches!(cause, Some(ChannelError::Protocol(_))));
    dispatcher.shutdown();
}

#[tokio::test]
async fn local_command_server_answers_inbound_commands() {
    let dispatcher = test_dispatcher();
    let (local, remote) = memory_pair();
    let channel = Channel::attach(dispatcher.handle(), local, Peer::new("server"), "client");

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    channel.add_command_server("Echo", move |token, name, args| {
        let _ = cmd_tx.send((token, name.to_string(), args));
    });
    channel.start();

    let (r, w) = tokio::io::split(remote);
    let mut reader = FrameReader::new(r);
    let mut writer = FrameWriter::new(w);

    // Servers registered before start are announced in the hello.
    assert_eq!(expect_hello(&mut reader).await, vec!["Echo".to_string()]);
    writer
        .send(&Frame::Hello { services: vec![] })
        .await
        .unwrap();
    channel.wait_open().await.unwrap();

    writer
        .send(&Frame::Command {
            token: Token::new(7),
            service: "Echo".into(),
            name: "echo".into(),
            args: b"hi".to_vec(),
        })
        .await
        .unwrap();

    let (token, name, args) = cmd_rx.recv().await.unwrap();
    assert_eq!(name, "echo");
    channel.send_progress(token, b"working".to_vec()).await.unwrap();
    channel.send_result(token, args).await.unwrap();

    match reader.recv().await.unwrap().unwrap() {
        Frame::Progress { token: t, data } => {
            assert_eq!(t, Token::new(7));
            assert_eq!(data, b"working");
        }
        other => panic!("expected progress, got {other:?}"),
    }
    match reader.recv().await.unwrap().unwrap() {
        Frame::Result { token: t, data } => {
            assert_eq!(t, Token::new(7));
            assert_eq!(data, b"hi");
        }
        other => panic!("expected result, got {other:?}"),
    }
    dispatcher.shutdown();
}

#[tokio::test]
#[should_panic(expected = "already registered")]
async fn duplicate_command_server_registration_panics() {
    let dispatcher = test_dispatcher();
    let (local, _remote) = memory_pair();
    let channel = Channel::attach(dispatcher.handle(), local, Peer::new("server"), "client");
    channel.add_command_server("Echo", |_, _, _| {});
    channel.add_command_server("Echo", |_, _, _| {});
}

#[tokio::test]
async fn events_fan_out_to_every_listener() {
    let dispatcher = test_dispatcher();
    let (channel, mut reader, mut writer) =
        open_channel(dispatcher.handle(), &["Breakpoints"]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx_a = tx.clone();
    channel.add_event_listener("Breakpoints", move |name, _data| {
        let _ = tx_a.send(("a", name.to_string()));
    });
    let tx_b = tx.clone();
    let listener_b = channel.add_event_listener("Breakpoints", move |name, _data| {
        let _ = tx_b.send(("b", name.to_string()));
    });
    fence(&channel, &mut reader).await;

    // No listener for this service: dropped without fuss.
    writer
        .send(&Frame::Event {
            service: "Nobody".into(),
            name: "ignored".into(),
            data: vec![],
        })
        .await
        .unwrap();
    writer
        .send(&Frame::Event {
            service: "Breakpoints".into(),
            name: "hit".into(),
            data: b"bp1".to_vec(),
        })
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), ("a", "hit".to_string()));
    assert_eq!(rx.recv().await.unwrap(), ("b", "hit".to_string()));

    channel.remove_event_listener("Breakpoints", listener_b);
    fence(&channel, &mut reader).await;
    writer
        .send(&Frame::Event {
            service: "Breakpoints".into(),
            name: "hit".into(),
            data: b"bp2".to_vec(),
        })
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), ("a", "hit".to_string()));
    let late = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(late.is_err(), "removed listener must not fire");

    assert_eq!(channel.state(), ChannelState::Open);
    dispatcher.shutdown();
}

#[tokio::test]
async fn congestion_rises_while_the_remote_stalls() {
    let dispatcher = test_dispatcher();
    let (channel, mut reader, _writer) = open_channel(dispatcher.handle(), &["Sink"]).await;
    assert_eq!(channel.congestion(), CONGESTION_IDLE);

    // More than the duplex buffer holds; the writer wedges and bytes pile
    // up in the outbound queue, but below the gate's high watermark so no
    // send suspends.
    for _ in 0..3 {
        channel
            .send_event("Sink", "blob", vec![0u8; 24 * 1024])
            .await
            .unwrap();
    }
    let mut level = channel.congestion();
    for _ in 0..200 {
        if level > CONGESTION_IDLE {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        level = channel.congestion();
    }
    assert!(level > CONGESTION_IDLE, "stalled writer must raise the level");

    // Drain the remote side; the level falls back to idle.
    for _ in 0..3 {
        match reader.recv().await.unwrap().unwrap() {
            Frame::Event { name, .. } => assert_eq!(name, "blob"),
            other => panic!("expected event, got {other:?}"),
        }
    }
    let mut level = channel.congestion();
    for _ in 0..200 {
        if level == CONGESTION_IDLE {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        level = channel.congestion();
    }
    assert_eq!(level, CONGESTION_IDLE);
    dispatcher.shutdown();
}

// ===== redirection =====

#[derive(Clone)]
struct ScriptedConnector {
    stream: Arc<Mutex<Option<DuplexStream>>>,
    dials: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(Some(stream))),
            dials: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Connector for ScriptedConnector {
    type Transport = DuplexStream;

    fn connect(&self, _peer: &Peer) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let stream = self.stream.lock().unwrap().take();
        async move {
            stream.ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "script provided no stream")
            })
        }
    }
}

#[tokio::test]
async fn redirect_hops_through_the_whole_proxy_chain() {
    let dispatcher = test_dispatcher();
    let target = Peer::new("target").with_attribute(Peer::ATTR_PROXIES, "px-1,px-2");

    let (local, remote) = memory_pair();
    let connector = ScriptedConnector::new(local);
    let dials = Arc::clone(&connector.dials);
    let redirector = Redirector::new(connector);

    let connect = redirector.connect(dispatcher.handle(), Peer::new("client"), &target, &[]);

    // One scripted endpoint plays all three hops in turn: the transport is
    // dialed once and every later hop is reached by redirection.
    let script = async {
        let (r, w) = tokio::io::split(remote);
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);

        expect_hello(&mut reader).await;
        writer
            .send(&Frame::Hello {
                services: vec![LOCATOR_SERVICE.into()],
            })
            .await
            .unwrap();

        match reader.recv().await.unwrap().unwrap() {
            Frame::Redirect { peer_id } => assert_eq!(peer_id, "px-2"),
            other => panic!("expected redirect, got {other:?}"),
        }
        writer
            .send(&Frame::Hello {
                services: vec![LOCATOR_SERVICE.into()],
            })
            .await
            .unwrap();

        match reader.recv().await.unwrap().unwrap() {
            Frame::Redirect { peer_id } => assert_eq!(peer_id, "target"),
            other => panic!("expected redirect, got {other:?}"),
        }
        writer
            .send(&Frame::Hello {
                services: vec!["Echo".into()],
            })
            .await
            .unwrap();
    };

    let (channel, ()) = tokio::join!(connect, script);
    let channel = channel.unwrap();

    assert_eq!(dials.load(Ordering::SeqCst), 1, "only the first hop is dialed");
    assert_eq!(channel.open_count(), 3, "one open per hop");
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.remote_peer_id(), "target");
    assert_eq!(channel.remote_services(), vec!["Echo".to_string()]);
    dispatcher.shutdown();
}

#[tokio::test]
async fn failed_hop_aborts_the_route() {
    let dispatcher = test_dispatcher();
    let target = Peer::new("target").with_attribute(Peer::ATTR_PROXIES, "px-1");

    let (local, remote) = memory_pair();
    let redirector = Redirector::new(ScriptedConnector::new(local));
    let connect = redirector.connect(dispatcher.handle(), Peer::new("client"), &target, &[]);

    let script = async {
        let (r, w) = tokio::io::split(remote);
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);

        expect_hello(&mut reader).await;
        writer
            .send(&Frame::Hello {
                services: vec![LOCATOR_SERVICE.into()],
            })
            .await
            .unwrap();

        match reader.recv().await.unwrap().unwrap() {
            Frame::Redirect { peer_id } => assert_eq!(peer_id, "target"),
            other => panic!("expected redirect, got {other:?}"),
        }
        writer
            .send(&Frame::Close {
                cause: Some("no route to target".into()),
            })
            .await
            .unwrap();
    };

    let (result, ()) = tokio::join!(connect, script);
    match result {
        Err(ChannelError::PeerClosed(cause)) => assert!(cause.contains("no route")),
        other => panic!("expected peer-closed error, got {:?}", other.err()),
    }
    dispatcher.shutdown();
}

#[tokio::test]
async fn redirect_requires_the_locator_service() {
    let dispatcher = test_dispatcher();
    let target = Peer::new("target").with_attribute(Peer::ATTR_PROXIES, "px-1");

    let (local, remote) = memory_pair();
    let redirector = Redirector::new(ScriptedConnector::new(local));
    let connect = redirector.connect(dispatcher.handle(), Peer::new("client"), &target, &[]);

    let script = async {
        let (r, w) = tokio::io::split(remote);
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);

        expect_hello(&mut reader).await;
        // A proxy that cannot redirect: no locator service in its hello.
        writer
            .send(&Frame::Hello {
                services: vec!["Echo".into()],
            })
            .await
            .unwrap();
        // Keep the endpoints alive until the channel gives up.
        (reader, writer)
    };

    let (result, _endpoints) = tokio::join!(connect, script);
    assert!(matches!(result, Err(ChannelError::Redirect(_))));
    dispatcher.shutdown();
}

// ===== blocking bridge and caches over a live channel =====

#[test]
fn blocking_task_bridges_into_channel_callbacks() {
    let dispatcher = test_dispatcher();
    let (local, remote) = memory_pair();
    let channel = Channel::attach(dispatcher.handle(), local, Peer::new("client"), "server");
    channel.start();

    // The remote peer runs entirely on the dispatch runtime: it answers
    // every command with a version string.
    dispatcher.handle().spawn(async move {
        let (r, w) = tokio::io::split(remote);
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);

        expect_hello(&mut reader).await;
        writer
            .send(&Frame::Hello {
                services: vec!["Version".into()],
            })
            .await
            .unwrap();
        while let Ok(Some(frame)) = reader.recv().await {
            if let Frame::Command { token, .. } = frame {
                let _ = writer
                    .send(&Frame::Result {
                        token,
                        data: b"1.2.3".to_vec(),
                    })
                    .await;
            }
        }
    });

    // A cache whose fetch issues a command over the channel.
    let fetch_handle = dispatcher.handle().clone();
    let fetch_channel = channel.clone();
    let cache: DataCache<String> = DataCache::new(move |update| {
        let channel = fetch_channel.clone();
        fetch_handle.spawn(async move {
            if let Ok(data) = channel.command("Version", "get", vec![]).await {
                update.done(String::from_utf8_lossy(&data).into_owned());
            }
        });
    });

    // A blocking task that retries until the cache is valid, then settles.
    let task_cache = cache.clone();
    let task = BlockingTask::new(dispatcher.handle(), move |settle| {
        if task_cache.validate(settle.rearm()) {
            settle.done(task_cache.get().unwrap());
        }
    });

    assert_eq!(task.get(Duration::from_secs(5)).unwrap(), "1.2.3");
    assert!(cache.is_valid());

    // The value is cached now: a second task settles without refetching.
    let task_cache = cache.clone();
    let again = BlockingTask::new(dispatcher.handle(), move |settle| {
        if task_cache.validate(settle.rearm()) {
            settle.done(task_cache.get().unwrap());
        }
    });
    assert_eq!(again.get(Duration::from_secs(5)).unwrap(), "1.2.3");

    channel.close();
    dispatcher.shutdown();
}
