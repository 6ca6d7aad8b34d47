//! Channels: multiplexed command/event sessions over a byte stream.
//!
//! A [`Channel`] is a cloneable handle onto a driver task that owns all
//! per-channel state: the frame reader, the pending-command registry,
//! command servers, and listeners. Handles talk to the driver through an
//! ops queue; the driver runs on the dispatch thread, so every callback
//! fires there and handler code needs no locking of its own.
//!
//! Lifecycle: a channel attaches in `Opening`, exchanges hello frames, and
//! becomes `Open`. It leaves `Open` only for `Closed` (graceful close,
//! remote close, or a fatal error) or back to `Opening` during a proxy
//! redirect. Every pending command is guaranteed exactly one completion:
//! its result frame, or a termination carrying the close cause.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_wire::{Frame, Token};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use crate::congestion::CongestionTracker;
use crate::dispatch::DispatcherHandle;
use crate::errors::ChannelError;
use crate::framing::{encode_frame, FrameReader};
use crate::peer::Peer;

/// The service every proxy must offer for redirection to be possible.
pub const LOCATOR_SERVICE: &str = "Locator";

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Attached, hello exchange (or a redirect hop) in progress.
    Opening,
    /// Fully open: commands, results, and events flow.
    Open,
    /// Closed. Terminal.
    Closed,
}

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// How a pending command ended.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The remote answered. The payload is the service-level reply, opaque
    /// to the channel layer.
    Result(Vec<u8>),
    /// The channel died first; the command will never be answered.
    Terminated(ChannelError),
}

type ProgressFn = Box<dyn FnMut(Token, &[u8]) + Send>;
type DoneFn = Box<dyn FnOnce(Token, CommandOutcome) + Send>;

/// Callbacks for one outbound command. Exactly one done callback fires per
/// command, on the dispatch thread.
pub struct CommandHandler {
    on_progress: Option<ProgressFn>,
    on_done: Option<DoneFn>,
}

impl CommandHandler {
    pub fn new(on_done: impl FnOnce(Token, CommandOutcome) + Send + 'static) -> Self {
        Self {
            on_progress: None,
            on_done: Some(Box::new(on_done)),
        }
    }

    /// Also receive intermediate progress payloads for this command.
    pub fn with_progress(mut self, f: impl FnMut(Token, &[u8]) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }
}

type OpenedFn = Box<dyn FnMut() + Send>;
type ClosedFn = Box<dyn FnOnce(Option<ChannelError>) + Send>;
type CongestionFn = Box<dyn FnMut(i32) + Send>;

/// Lifecycle callbacks for a channel, registered as a unit.
///
/// `on_opened` may fire more than once: a redirected channel re-opens at
/// each hop. `on_closed` fires exactly once, with `None` for a graceful
/// close and the cause otherwise.
#[derive(Default)]
pub struct ChannelEvents {
    on_opened: Option<OpenedFn>,
    on_closed: Option<ClosedFn>,
    on_congestion: Option<CongestionFn>,
}

impl ChannelEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_opened(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_opened = Some(Box::new(f));
        self
    }

    pub fn on_closed(mut self, f: impl FnOnce(Option<ChannelError>) + Send + 'static) -> Self {
        self.on_closed = Some(Box::new(f));
        self
    }

    pub fn on_congestion(mut self, f: impl FnMut(i32) + Send + 'static) -> Self {
        self.on_congestion = Some(Box::new(f));
        self
    }
}

type CommandServer = Box<dyn FnMut(Token, &str, Vec<u8>) + Send>;
type EventHandler = Box<dyn FnMut(&str, &[u8]) + Send>;

enum ChannelOp {
    Start,
    Command {
        token: Token,
        service: String,
        name: String,
        args: Vec<u8>,
        handler: CommandHandler,
    },
    Result {
        token: Token,
        data: Vec<u8>,
    },
    Progress {
        token: Token,
        data: Vec<u8>,
    },
    Event {
        service: String,
        name: String,
        data: Vec<u8>,
    },
    AddChannelListener {
        id: ListenerId,
        events: ChannelEvents,
    },
    RemoveChannelListener {
        id: ListenerId,
    },
    AddCommandServer {
        service: String,
        server: CommandServer,
    },
    RemoveCommandServer {
        service: String,
    },
    AddEventListener {
        id: ListenerId,
        service: String,
        handler: EventHandler,
    },
    RemoveEventListener {
        service: String,
        id: ListenerId,
    },
    Redirect {
        peer_id: String,
    },
    Close,
    Terminate {
        error: ChannelError,
    },
}

struct RemoteEndpoint {
    peer_id: String,
    services: Vec<String>,
}

struct Shared {
    local_peer: Peer,
    next_token: AtomicU64,
    next_listener: AtomicU64,
    /// Bumped on every transition into `Open`. Lets a redirector wait for
    /// the re-open that follows a specific hop without racing the watch.
    open_count: AtomicU64,
    state_rx: watch::Receiver<ChannelState>,
    close_cause: Mutex<Option<ChannelError>>,
    remote: Mutex<RemoteEndpoint>,
    local_services: Mutex<Vec<String>>,
    tracker: Arc<CongestionTracker>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to a channel.
#[derive(Clone)]
pub struct Channel {
    ops: mpsc::UnboundedSender<ChannelOp>,
    shared: Arc<Shared>,
}

impl Channel {
    /// Attach a channel to `stream` and spawn its driver and writer tasks
    /// on the dispatch thread. The channel starts in `Opening`; call
    /// [`Channel::start`] once local command servers are registered to
    /// send the hello frame.
    pub fn attach<S>(
        dispatcher: &DispatcherHandle,
        stream: S,
        local_peer: Peer,
        remote_peer_id: impl Into<String>,
    ) -> Channel
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let remote_peer_id = remote_peer_id.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Opening);
        let (tracker, level_rx) = CongestionTracker::new();
        let (writer_err_tx, writer_err_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            local_peer,
            next_token: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            open_count: AtomicU64::new(0),
            state_rx,
            close_cause: Mutex::new(None),
            remote: Mutex::new(RemoteEndpoint {
                peer_id: remote_peer_id,
                services: Vec::new(),
            }),
            local_services: Mutex::new(Vec::new()),
            tracker: Arc::clone(&tracker),
        });

        let writer_tracker = Arc::clone(&tracker);
        dispatcher.spawn(async move {
            if let Err(e) = writer_loop(write_half, out_rx, writer_tracker).await {
                let _ = writer_err_tx.send(e);
            }
        });

        let driver = Driver {
            reader: FrameReader::new(read_half),
            ops: ops_rx,
            out: out_tx,
            state_tx,
            level_rx,
            writer_err: writer_err_rx,
            shared: Arc::clone(&shared),
            tracker,
            pending: HashMap::new(),
            inbound: HashSet::new(),
            command_servers: HashMap::new(),
            event_listeners: HashMap::new(),
            channel_listeners: Vec::new(),
            queued_until_open: Vec::new(),
        };
        dispatcher.spawn(driver.run());

        Channel {
            ops: ops_tx,
            shared,
        }
    }

    /// Send the hello frame announcing locally registered services.
    pub fn start(&self) {
        let _ = self.ops.send(ChannelOp::Start);
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state_rx.borrow()
    }

    /// Wait until the channel is open. Fails with the close cause if it
    /// closes first.
    pub async fn wait_open(&self) -> Result<(), ChannelError> {
        let mut rx = self.shared.state_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                ChannelState::Open => return Ok(()),
                ChannelState::Closed => return Err(self.close_cause_or_closed()),
                ChannelState::Opening => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.close_cause_or_closed());
            }
        }
    }

    /// Number of times this channel has entered `Open` (once per hello,
    /// so once initially plus once per completed redirect hop).
    pub fn open_count(&self) -> u64 {
        self.shared.open_count.load(Ordering::Acquire)
    }

    /// Wait for an open that happens after `count` opens have been seen.
    /// This is how a redirector distinguishes the re-open of the next hop
    /// from the open it already observed.
    pub async fn wait_open_since(&self, count: u64) -> Result<(), ChannelError> {
        let mut rx = self.shared.state_rx.clone();
        loop {
            {
                let state = *rx.borrow_and_update();
                match state {
                    ChannelState::Closed => return Err(self.close_cause_or_closed()),
                    ChannelState::Open if self.open_count() > count => return Ok(()),
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(self.close_cause_or_closed());
            }
        }
    }

    /// Send a command to a remote service. Returns the correlation token.
    ///
    /// Suspends at the congestion gate while the outbound queue is over the
    /// high watermark. `handler.on_done` fires exactly once with the result
    /// or the termination cause: on the dispatch thread for a command that
    /// was issued, or immediately from the calling task when the send itself
    /// fails (the call then also returns the same cause).
    pub async fn send_command(
        &self,
        service: &str,
        name: &str,
        args: Vec<u8>,
        mut handler: CommandHandler,
    ) -> Result<Token, ChannelError> {
        if let Err(cause) = self.gate().await {
            let token = Token::new(self.shared.next_token.fetch_add(1, Ordering::AcqRel));
            if let Some(done) = handler.on_done.take() {
                done(token, CommandOutcome::Terminated(cause.clone()));
            }
            return Err(cause);
        }
        let token = Token::new(self.shared.next_token.fetch_add(1, Ordering::AcqRel));
        let op = ChannelOp::Command {
            token,
            service: service.to_string(),
            name: name.to_string(),
            args,
            handler,
        };
        if let Err(mpsc::error::SendError(op)) = self.ops.send(op) {
            let cause = self.close_cause_or_closed();
            if let ChannelOp::Command { mut handler, .. } = op {
                if let Some(done) = handler.on_done.take() {
                    done(token, CommandOutcome::Terminated(cause.clone()));
                }
            }
            return Err(cause);
        }
        Ok(token)
    }

    /// Send a command and wait for its result payload.
    pub async fn command(
        &self,
        service: &str,
        name: &str,
        args: Vec<u8>,
    ) -> Result<Vec<u8>, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let handler = CommandHandler::new(move |_token, outcome| {
            let _ = tx.send(outcome);
        });
        self.send_command(service, name, args, handler).await?;
        match rx.await {
            Ok(CommandOutcome::Result(data)) => Ok(data),
            Ok(CommandOutcome::Terminated(e)) => Err(e),
            Err(_) => Err(self.close_cause_or_closed()),
        }
    }

    /// Answer an inbound command. Consumes the token: answering the same
    /// command twice is a programming error and panics in the driver.
    pub async fn send_result(&self, token: Token, data: Vec<u8>) -> Result<(), ChannelError> {
        self.gated_send(ChannelOp::Result { token, data }).await
    }

    /// Send an intermediate progress payload for an inbound command still
    /// in progress.
    pub async fn send_progress(&self, token: Token, data: Vec<u8>) -> Result<(), ChannelError> {
        self.gated_send(ChannelOp::Progress { token, data }).await
    }

    /// Broadcast an event. Events are unsolicited and carry no token.
    pub async fn send_event(
        &self,
        service: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), ChannelError> {
        self.gated_send(ChannelOp::Event {
            service: service.to_string(),
            name: name.to_string(),
            data,
        })
        .await
    }

    /// Current congestion level in [-100, 100]. See [`crate::congestion`].
    pub fn congestion(&self) -> i32 {
        self.shared.tracker.level()
    }

    pub fn add_channel_listener(&self, events: ChannelEvents) -> ListenerId {
        let id = self.next_listener_id();
        let _ = self.ops.send(ChannelOp::AddChannelListener { id, events });
        id
    }

    /// Remove a channel listener. Unknown ids are ignored.
    pub fn remove_channel_listener(&self, id: ListenerId) {
        let _ = self.ops.send(ChannelOp::RemoveChannelListener { id });
    }

    /// Register the handler for inbound commands addressed to `service`.
    /// The service is included in the hello frame if registered before
    /// [`Channel::start`].
    ///
    /// # Panics
    ///
    /// Panics if `service` already has a command server on this channel.
    pub fn add_command_server(
        &self,
        service: &str,
        server: impl FnMut(Token, &str, Vec<u8>) + Send + 'static,
    ) {
        {
            let mut services = lock(&self.shared.local_services);
            if services.iter().any(|s| s == service) {
                panic!("command server already registered for service {service}");
            }
            services.push(service.to_string());
        }
        let _ = self.ops.send(ChannelOp::AddCommandServer {
            service: service.to_string(),
            server: Box::new(server),
        });
    }

    /// Remove a command server. Unknown services are ignored.
    pub fn remove_command_server(&self, service: &str) {
        lock(&self.shared.local_services).retain(|s| s != service);
        let _ = self.ops.send(ChannelOp::RemoveCommandServer {
            service: service.to_string(),
        });
    }

    /// Listen for events from a remote service. Multiple listeners per
    /// service are allowed; each sees every event.
    pub fn add_event_listener(
        &self,
        service: &str,
        handler: impl FnMut(&str, &[u8]) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id();
        let _ = self.ops.send(ChannelOp::AddEventListener {
            id,
            service: service.to_string(),
            handler: Box::new(handler),
        });
        id
    }

    /// Remove an event listener. Unknown ids are ignored.
    pub fn remove_event_listener(&self, service: &str, id: ListenerId) {
        let _ = self.ops.send(ChannelOp::RemoveEventListener {
            service: service.to_string(),
            id,
        });
    }

    /// Ask the current remote endpoint (which must be open and offer the
    /// locator service) to forward this channel to `peer_id`. The channel
    /// drops back to `Opening` until the new endpoint's hello arrives.
    pub fn redirect(&self, peer_id: &str) {
        let _ = self.ops.send(ChannelOp::Redirect {
            peer_id: peer_id.to_string(),
        });
    }

    /// Close gracefully: pending commands terminate with
    /// [`ChannelError::Closed`], listeners see a `None` cause.
    pub fn close(&self) {
        let _ = self.ops.send(ChannelOp::Close);
    }

    /// Close abruptly with an error cause.
    pub fn terminate(&self, error: ChannelError) {
        let _ = self.ops.send(ChannelOp::Terminate { error });
    }

    pub fn local_peer(&self) -> &Peer {
        &self.shared.local_peer
    }

    pub fn remote_peer_id(&self) -> String {
        lock(&self.shared.remote).peer_id.clone()
    }

    /// Services the remote announced in its hello. Empty while opening.
    pub fn remote_services(&self) -> Vec<String> {
        lock(&self.shared.remote).services.clone()
    }

    /// Services registered locally on this channel.
    pub fn local_services(&self) -> Vec<String> {
        lock(&self.shared.local_services).clone()
    }

    /// Why the channel closed. `None` while open or after a graceful close.
    pub fn close_cause(&self) -> Option<ChannelError> {
        lock(&self.shared.close_cause).clone()
    }

    fn close_cause_or_closed(&self) -> ChannelError {
        self.close_cause().unwrap_or(ChannelError::Closed)
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.shared.next_listener.fetch_add(1, Ordering::AcqRel))
    }

    async fn gate(&self) -> Result<(), ChannelError> {
        if self.state() == ChannelState::Closed {
            return Err(self.close_cause_or_closed());
        }
        self.shared.tracker.ready().await.map_err(|e| match e {
            ChannelError::Closed => self.close_cause_or_closed(),
            other => other,
        })
    }

    async fn gated_send(&self, op: ChannelOp) -> Result<(), ChannelError> {
        self.gate().await?;
        self.ops
            .send(op)
            .map_err(|_| self.close_cause_or_closed())
    }
}

// ===== writer task =====

async fn writer_loop<W: AsyncWrite + Unpin>(
    mut stream: W,
    mut out: mpsc::UnboundedReceiver<Vec<u8>>,
    tracker: Arc<CongestionTracker>,
) -> Result<(), ChannelError> {
    while let Some(buf) = out.recv().await {
        let len = buf.len();
        let result = async {
            stream.write_all(&buf).await?;
            stream.flush().await
        }
        .await;
        tracker.flushed(len);
        if let Err(e) = result {
            return Err(ChannelError::io(e));
        }
    }
    // The driver dropped the queue: channel closed, best-effort shutdown.
    let _ = stream.shutdown().await;
    Ok(())
}

// ===== driver task =====

enum Flow {
    Continue,
    Stop(Option<ChannelError>),
}

struct Driver<R> {
    reader: FrameReader<R>,
    ops: mpsc::UnboundedReceiver<ChannelOp>,
    out: mpsc::UnboundedSender<Vec<u8>>,
    state_tx: watch::Sender<ChannelState>,
    level_rx: watch::Receiver<i32>,
    writer_err: oneshot::Receiver<ChannelError>,
    shared: Arc<Shared>,
    tracker: Arc<CongestionTracker>,
    /// Outbound commands awaiting their result, keyed by token.
    pending: HashMap<u64, CommandHandler>,
    /// Inbound command tokens whose result has not been sent yet.
    inbound: HashSet<u64>,
    command_servers: HashMap<String, CommandServer>,
    event_listeners: HashMap<String, Vec<(ListenerId, EventHandler)>>,
    channel_listeners: Vec<(ListenerId, ChannelEvents)>,
    /// Commands issued while opening, flushed on the hello.
    queued_until_open: Vec<Frame>,
}

impl<R: AsyncRead + Unpin> Driver<R> {
    async fn run(mut self) {
        let cause = loop {
            tokio::select! {
                frame = self.reader.recv() => {
                    match frame {
                        Ok(Some(frame)) => match self.handle_frame(frame) {
                            Flow::Continue => {}
                            Flow::Stop(cause) => break cause,
                        },
                        Ok(None) => {
                            break Some(ChannelError::io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "transport closed without a close frame",
                            )));
                        }
                        Err(e) => break Some(ChannelError::io(e)),
                    }
                }
                op = self.ops.recv() => {
                    match op {
                        Some(op) => match self.handle_op(op) {
                            Flow::Continue => {}
                            Flow::Stop(cause) => break cause,
                        },
                        // Every handle is gone; nobody can use the channel
                        // again, so close it gracefully.
                        None => break None,
                    }
                }
                err = &mut self.writer_err => {
                    break Some(err.unwrap_or_else(|_| {
                        ChannelError::Protocol("writer task stopped unexpectedly".into())
                    }));
                }
                changed = self.level_rx.changed() => {
                    if changed.is_ok() {
                        let level = *self.level_rx.borrow_and_update();
                        for (_, events) in &mut self.channel_listeners {
                            if let Some(f) = events.on_congestion.as_mut() {
                                f(level);
                            }
                        }
                    }
                }
            }
        };
        self.teardown(cause);
    }

    fn handle_frame(&mut self, frame: Frame) -> Flow {
        match frame {
            Frame::Hello { services } => {
                if *self.state_tx.borrow() != ChannelState::Opening {
                    return self.protocol_error("hello on an already open channel");
                }
                lock(&self.shared.remote).services = services;
                // Bumped before the watch update so an observer that sees
                // Open also sees the new count.
                self.shared.open_count.fetch_add(1, Ordering::AcqRel);
                let _ = self.state_tx.send(ChannelState::Open);
                tracing::debug!(
                    peer = %lock(&self.shared.remote).peer_id,
                    "channel open"
                );
                for (_, events) in &mut self.channel_listeners {
                    if let Some(f) = events.on_opened.as_mut() {
                        f();
                    }
                }
                for frame in std::mem::take(&mut self.queued_until_open) {
                    if let Err(e) = self.enqueue_frame(&frame) {
                        return Flow::Stop(Some(e));
                    }
                }
                Flow::Continue
            }
            Frame::Command {
                token,
                service,
                name,
                args,
            } => match self.command_servers.get_mut(&service) {
                Some(server) => {
                    self.inbound.insert(token.raw());
                    server(token, &name, args);
                    Flow::Continue
                }
                None => self.protocol_error(&format!(
                    "command for unregistered service {service}"
                )),
            },
            Frame::Progress { token, data } => match self.pending.get_mut(&token.raw()) {
                Some(handler) => {
                    if let Some(f) = handler.on_progress.as_mut() {
                        f(token, &data);
                    }
                    Flow::Continue
                }
                None => {
                    self.protocol_error(&format!("progress for unknown command {token}"))
                }
            },
            Frame::Result { token, data } => match self.pending.remove(&token.raw()) {
                Some(mut handler) => {
                    if let Some(f) = handler.on_done.take() {
                        f(token, CommandOutcome::Result(data));
                    }
                    Flow::Continue
                }
                None => self.protocol_error(&format!("result for unknown command {token}")),
            },
            Frame::Event {
                service,
                name,
                data,
            } => {
                // Events with no listener are dropped, not an error: the
                // remote may broadcast for services we never subscribed to.
                if let Some(listeners) = self.event_listeners.get_mut(&service) {
                    for (_, handler) in listeners {
                        handler(&name, &data);
                    }
                }
                Flow::Continue
            }
            Frame::Redirect { .. } => {
                self.protocol_error("unexpected redirect frame from remote")
            }
            Frame::Close { cause } => Flow::Stop(cause.map(ChannelError::PeerClosed)),
        }
    }

    fn handle_op(&mut self, op: ChannelOp) -> Flow {
        match op {
            ChannelOp::Start => {
                let services = lock(&self.shared.local_services).clone();
                self.enqueue(Frame::Hello { services })
            }
            ChannelOp::Command {
                token,
                service,
                name,
                args,
                handler,
            } => {
                self.pending.insert(token.raw(), handler);
                let frame = Frame::Command {
                    token,
                    service,
                    name,
                    args,
                };
                if *self.state_tx.borrow() == ChannelState::Opening {
                    self.queued_until_open.push(frame);
                    Flow::Continue
                } else {
                    self.enqueue(frame)
                }
            }
            ChannelOp::Result { token, data } => {
                if !self.inbound.remove(&token.raw()) {
                    panic!("result sent for a command that is not in progress: {token}");
                }
                self.enqueue(Frame::Result { token, data })
            }
            ChannelOp::Progress { token, data } => {
                if !self.inbound.contains(&token.raw()) {
                    panic!("progress sent for a command that is not in progress: {token}");
                }
                self.enqueue(Frame::Progress { token, data })
            }
            ChannelOp::Event {
                service,
                name,
                data,
            } => self.enqueue(Frame::Event {
                service,
                name,
                data,
            }),
            ChannelOp::AddChannelListener { id, events } => {
                self.channel_listeners.push((id, events));
                Flow::Continue
            }
            ChannelOp::RemoveChannelListener { id } => {
                self.channel_listeners.retain(|(l, _)| *l != id);
                Flow::Continue
            }
            ChannelOp::AddCommandServer { service, server } => {
                self.command_servers.insert(service, server);
                Flow::Continue
            }
            ChannelOp::RemoveCommandServer { service } => {
                self.command_servers.remove(&service);
                Flow::Continue
            }
            ChannelOp::AddEventListener {
                id,
                service,
                handler,
            } => {
                self.event_listeners
                    .entry(service)
                    .or_default()
                    .push((id, handler));
                Flow::Continue
            }
            ChannelOp::RemoveEventListener { service, id } => {
                if let Some(listeners) = self.event_listeners.get_mut(&service) {
                    listeners.retain(|(l, _)| *l != id);
                }
                Flow::Continue
            }
            ChannelOp::Redirect { peer_id } => self.handle_redirect(peer_id),
            ChannelOp::Close => Flow::Stop(None),
            ChannelOp::Terminate { error } => Flow::Stop(Some(error)),
        }
    }

    fn handle_redirect(&mut self, peer_id: String) -> Flow {
        if *self.state_tx.borrow() != ChannelState::Open {
            return Flow::Stop(Some(ChannelError::Redirect(
                "redirect requires an open channel".into(),
            )));
        }
        {
            let mut remote = lock(&self.shared.remote);
            if !remote.services.iter().any(|s| s == LOCATOR_SERVICE) {
                return Flow::Stop(Some(ChannelError::Redirect(format!(
                    "peer {} does not offer the {LOCATOR_SERVICE} service",
                    remote.peer_id
                ))));
            }
            tracing::debug!(from = %remote.peer_id, to = %peer_id, "redirecting channel");
            remote.peer_id = peer_id.clone();
            remote.services.clear();
        }
        // Tokens correlate per endpoint; the new endpoint knows nothing of
        // commands the old one was serving.
        self.inbound.clear();
        let _ = self.state_tx.send(ChannelState::Opening);
        self.enqueue(Frame::Redirect { peer_id })
    }

    fn enqueue(&mut self, frame: Frame) -> Flow {
        match self.enqueue_frame(&frame) {
            Ok(()) => Flow::Continue,
            Err(e) => Flow::Stop(Some(e)),
        }
    }

    fn enqueue_frame(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let buf = encode_frame(frame).map_err(ChannelError::io)?;
        self.tracker.enqueued(buf.len());
        self.out
            .send(buf)
            .map_err(|_| ChannelError::Protocol("writer task gone".into()))
    }

    fn protocol_error(&self, msg: &str) -> Flow {
        tracing::error!(
            peer = %lock(&self.shared.remote).peer_id,
            "protocol violation: {msg}"
        );
        Flow::Stop(Some(ChannelError::Protocol(msg.to_string())))
    }

    fn teardown(mut self, cause: Option<ChannelError>) {
        *lock(&self.shared.close_cause) = cause.clone();
        self.tracker.set_closed();

        // Best-effort close frame; on a dead transport the writer drops it.
        // Routed through the tracker like any other frame so the queued-byte
        // accounting stays balanced when the writer flushes it.
        let close = Frame::Close {
            cause: cause.as_ref().map(|e| e.to_string()),
        };
        let _ = self.enqueue_frame(&close);
        let _ = self.state_tx.send(ChannelState::Closed);

        // Ops raced in before the close are honored for their completion
        // guarantees: commands terminate, late listeners hear the close.
        self.ops.close();
        while let Ok(op) = self.ops.try_recv() {
            match op {
                ChannelOp::Command { token, handler, .. } => {
                    self.pending.insert(token.raw(), handler);
                }
                ChannelOp::AddChannelListener { id, events } => {
                    self.channel_listeners.push((id, events));
                }
                _ => {}
            }
        }

        let failure = cause.clone().unwrap_or(ChannelError::Closed);
        for (raw, mut handler) in self.pending.drain() {
            if let Some(done) = handler.on_done.take() {
                done(
                    Token::new(raw),
                    CommandOutcome::Terminated(failure.clone()),
                );
            }
        }

        for (_, mut events) in self.channel_listeners.drain(..) {
            if let Some(f) = events.on_closed.take() {
                f(cause.clone());
            }
        }

        match &cause {
            None => tracing::debug!(
                peer = %lock(&self.shared.remote).peer_id,
                "channel closed"
            ),
            Some(e) => tracing::debug!(
                peer = %lock(&self.shared.remote).peer_id,
                "channel terminated: {e}"
            ),
        }
        // Dropping `out` stops the writer once the close frame is flushed.
    }
}
