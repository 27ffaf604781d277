//! Connection lifecycle.
//!
//! A [`Connection`] owns one duplex transport for the life of the process:
//!
//! ```text
//! Disconnected -> Handshaking -> Connected -> Closed
//!                      |                        ^
//!                      +------------------------+  (handshake failure)
//! ```
//!
//! The transport is split on entry. A reader task pumps inbound envelopes
//! into a queue and a writer task owns the write half, so a frame is always
//! written whole even when the caller that queued it goes away.
//!
//! During the handshake the plugin sends its registration and waits for the
//! panel's acknowledgement. Once connected, the optional start hook runs on
//! a blocking worker while the loop keeps reading: replies still reach
//! outbound calls made by the hook, and inbound calls are held back and
//! dispatched in arrival order once the hook returns. After that the loop
//! reads envelopes one at a time:
//!
//! - reply-shaped envelopes fulfill a pending outbound call,
//! - `Shutdown` ends the loop without a reply,
//! - inbound calls are handed to a blocking worker and the reply is written
//!   back with the inbound correlation id,
//! - malformed frames and anything else are logged and skipped.
//!
//! Whatever ends the loop, every pending outbound call is failed with
//! [`Error::ConnectionClosed`] before `run` returns.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use anyhow::Context;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::data_dir::DataDir;
use crate::data_dir::StartupArgs;
use crate::dispatch::CallKind;
use crate::dispatch::Dispatcher;
use crate::envelope::Envelope;
use crate::envelope::HostCall;
use crate::envelope::LogRecord;
use crate::envelope::Payload;
use crate::error::Error;
use crate::error::Result;
use crate::error::TransportError;
use crate::pending::PendingCalls;
use crate::registry::HandlerRegistry;
use crate::registry::Plugin;
use crate::registry::StartHook;
use crate::transport::EnvelopeReader;
use crate::transport::EnvelopeWriter;
use crate::transport::FrameTransport;
use crate::transport::Transport;

/// Log level used by [`PanelClient::log`].
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Inbound envelopes buffered between the reader task and the loop.
const INBOUND_QUEUE: usize = 64;

thread_local! {
    static HANDLER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` marked as handler code on a blocking worker, where
/// [`PanelClient::call_blocking`] may block the thread outright.
fn as_handler<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);
    impl Drop for Restore {
        fn drop(&mut self) {
            HANDLER_THREAD.with(|flag| flag.set(self.0));
        }
    }
    let _restore = Restore(HANDLER_THREAD.with(|flag| flag.replace(true)));
    f()
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Observable lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Closed,
}

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }

    fn set(&self, state: ConnectionState) {
        let value = match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Handshaking => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Closed => 3,
        };
        self.0.store(value, Ordering::Release);
    }
}

/// How the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The panel sent a shutdown envelope.
    Shutdown,
    /// The panel closed the stream.
    EndOfStream,
    /// [`ShutdownHandle::shutdown`] was called.
    Cancelled,
}

/// Cloneable handle to a connection that may be running elsewhere.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<watch::Sender<bool>>,
    state: Arc<StateCell>,
}

impl ShutdownHandle {
    /// Ask the receive loop to stop. It takes the same close-out path as a
    /// shutdown envelope. Works before the loop has started.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle").field("state", &self.state()).finish()
    }
}

// ---------------------------------------------------------------------------
// Session and outbound client
// ---------------------------------------------------------------------------

/// One queued write and the slot its outcome is reported to.
struct Outbound {
    envelope: Envelope,
    written: oneshot::Sender<std::result::Result<(), TransportError>>,
}

/// Shared state of an open connection.
struct Session {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: PendingCalls,
    runtime: Handle,
}

impl Session {
    /// Spawn the writer task on the current runtime.
    fn new(plugin_id: &str, writer: Box<dyn EnvelopeWriter>) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(plugin_id.to_string(), writer, queue));
        Self {
            outbound,
            pending: PendingCalls::new(plugin_id),
            runtime: Handle::current(),
        }
    }

    /// Queue one envelope for the writer task without waiting for it.
    fn enqueue(&self, envelope: Envelope) -> Result<oneshot::Receiver<std::result::Result<(), TransportError>>> {
        let (written, outcome) = oneshot::channel();
        self.outbound
            .send(Outbound { envelope, written })
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(outcome)
    }

    /// Write one envelope and wait until it is on the wire. Dropping the
    /// returned future does not cut the frame short.
    async fn send(&self, envelope: Envelope) -> Result<()> {
        match self.enqueue(envelope)?.await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

/// Owns the write half; frames go out whole and in queue order.
async fn write_loop(plugin_id: String, mut writer: Box<dyn EnvelopeWriter>, mut queue: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { envelope, written }) = queue.recv().await {
        let outcome = writer.send(&envelope).await;
        if let Err(e) = &outcome {
            debug!(plugin = %plugin_id, kind = envelope.payload.kind_name(), error = %e, "write failed");
        }
        let _ = written.send(outcome);
    }
    debug!(plugin = %plugin_id, "writer stopped");
}

type Inbound = std::result::Result<Option<Envelope>, TransportError>;

/// Owns the read half and forwards everything it reads until end of stream
/// or an unrecoverable error.
async fn read_loop(plugin_id: String, mut reader: Box<dyn EnvelopeReader>, inbound: mpsc::Sender<Inbound>) {
    loop {
        let received = reader.recv().await;
        let keep_reading = match &received {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => e.is_recoverable(),
        };
        if inbound.send(received).await.is_err() || !keep_reading {
            break;
        }
    }
    debug!(plugin = %plugin_id, "reader stopped");
}

/// Next inbound item. A reader task that is gone reads as end of stream.
async fn next_inbound(inbound: &mut mpsc::Receiver<Inbound>) -> Inbound {
    inbound.recv().await.unwrap_or(Ok(None))
}

/// Handle for calls the plugin makes toward the panel.
///
/// Obtained from [`Plugin::client`] before the connection opens and usable
/// from any handler once it is connected.
#[derive(Clone)]
pub struct PanelClient {
    plugin_id: String,
    session: Arc<OnceLock<Arc<Session>>>,
    data_dir: Arc<OnceLock<DataDir>>,
}

impl PanelClient {
    pub(crate) fn new(plugin_id: String) -> Self {
        Self {
            plugin_id,
            session: Arc::new(OnceLock::new()),
            data_dir: Arc::new(OnceLock::new()),
        }
    }

    fn bind_data_dir(&self, dir: DataDir) {
        // Only the first start binds a directory.
        let _ = self.data_dir.set(dir);
    }

    fn attach(&self, session: Arc<Session>) {
        if self.session.set(session).is_err() {
            warn!(plugin = %self.plugin_id, "panel client already attached to a session");
        }
    }

    fn session(&self) -> Result<&Arc<Session>> {
        self.session.get().ok_or(Error::NotConnected)
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// The plugin's data directory, known once [`Plugin::start`] resolved
    /// it from the launch arguments.
    pub fn data_dir(&self) -> Option<&DataDir> {
        self.data_dir.get()
    }

    /// Whether a live session is attached.
    pub fn is_connected(&self) -> bool {
        self.session.get().is_some_and(|s| !s.pending.is_closed())
    }

    /// Call `method` on the panel and wait for its reply.
    ///
    /// Fails with [`Error::NotConnected`] before the handshake completes and
    /// with [`Error::ConnectionClosed`] once the connection is gone.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let session = self.session()?;
        let call = session.pending.register()?;
        let envelope = Envelope::new(call.id(), Payload::HostCall(HostCall {
            method: method.to_string(),
            params,
        }));

        // Dropping `call` on any early exit forgets the pending entry.
        session.send(envelope).await?;
        debug!(plugin = %self.plugin_id, method, request_id = %call.id(), "waiting for panel reply");

        let reply = call.wait().await?;
        match reply.payload {
            Payload::HostReply(reply) => match reply.error {
                Some(message) => Err(Error::Host(message)),
                None => Ok(reply.result),
            },
            other => Err(Error::UnexpectedReply(other.kind_name())),
        }
    }

    /// Blocking form of [`PanelClient::call`] for synchronous handlers.
    ///
    /// Handlers and the start hook can always use it, as can threads outside
    /// any runtime. On a multi-thread runtime worker the wait goes through
    /// [`tokio::task::block_in_place`]. Any other async context gets
    /// [`Error::BlockingInAsync`] instead of a panic.
    pub fn call_blocking(&self, method: &str, params: Value) -> Result<Value> {
        let runtime = self.session()?.runtime.clone();
        if HANDLER_THREAD.with(Cell::get) {
            return runtime.block_on(self.call(method, params));
        }
        match Handle::try_current() {
            Err(_) => runtime.block_on(self.call(method, params)),
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| runtime.block_on(self.call(method, params)))
            }
            Ok(_) => Err(Error::BlockingInAsync),
        }
    }

    /// Forward an info-level log line to the panel.
    pub fn log(&self, message: impl Into<String>) {
        self.log_at(DEFAULT_LOG_LEVEL, message);
    }

    /// Forward a log line at `level` to the panel. Fire-and-forget.
    pub fn log_at(&self, level: &str, message: impl Into<String>) {
        let message = message.into();
        let Some(session) = self.session.get() else {
            debug!(plugin = %self.plugin_id, %message, "not connected, dropping panel log line");
            return;
        };

        let envelope = Envelope::uncorrelated(Payload::Log(LogRecord {
            plugin_id: self.plugin_id.clone(),
            level: level.to_string(),
            message,
        }));
        if let Err(e) = session.enqueue(envelope) {
            debug!(plugin = %self.plugin_id, error = %e, "failed to forward log line");
        }
    }
}

impl fmt::Debug for PanelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelClient")
            .field("plugin_id", &self.plugin_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A plugin ready to be driven over a transport.
pub struct Connection {
    registry: HandlerRegistry,
    on_start: Option<StartHook>,
    client: PanelClient,
    state: Arc<StateCell>,
    stop: Arc<watch::Sender<bool>>,
}

impl Connection {
    pub fn new(plugin: Plugin) -> Self {
        let (registry, on_start, client) = plugin.into_parts();
        let (stop, _) = watch::channel(false);
        Self {
            registry,
            on_start,
            client,
            state: Arc::new(StateCell::default()),
            stop: Arc::new(stop),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn client(&self) -> PanelClient {
        self.client.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            state: Arc::clone(&self.state),
        }
    }

    /// Handshake, run the start hook, then serve inbound calls until the
    /// panel shuts the plugin down or the stream ends.
    pub async fn run<T: Transport>(self, transport: T) -> Result<Exit> {
        let Connection {
            registry,
            on_start,
            client,
            state,
            stop,
        } = self;
        let plugin_id = registry.plugin_id().to_string();
        let (reader, writer) = transport.split();
        let session = Arc::new(Session::new(&plugin_id, writer));
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let reader_task = tokio::spawn(read_loop(plugin_id.clone(), reader, inbound_tx));

        let mut driver = Driver {
            plugin_id,
            session: Arc::clone(&session),
            inbound,
            state: Arc::clone(&state),
            stop: stop.subscribe(),
        };
        let outcome = driver.drive(registry, on_start, &client).await;

        reader_task.abort();
        session.pending.close_all();
        state.set(ConnectionState::Closed);
        match &outcome {
            Ok(exit) => info!(plugin = %driver.plugin_id, ?exit, "connection closed"),
            Err(e) => error!(plugin = %driver.plugin_id, error = %e, "connection failed"),
        }
        outcome
    }
}

/// What the loop does with one inbound item.
enum Step {
    Skip,
    Call(CallKind, Envelope),
    Exit(Exit),
}

struct Driver {
    plugin_id: String,
    session: Arc<Session>,
    inbound: mpsc::Receiver<Inbound>,
    state: Arc<StateCell>,
    stop: watch::Receiver<bool>,
}

impl Driver {
    async fn drive(
        &mut self,
        registry: HandlerRegistry,
        on_start: Option<StartHook>,
        client: &PanelClient,
    ) -> Result<Exit> {
        self.state.set(ConnectionState::Handshaking);
        let registration = Envelope::uncorrelated(Payload::Registration(registry.info()));
        let acknowledged = tokio::select! {
            biased;
            _ = stopped(&mut self.stop) => return Ok(Exit::Cancelled),
            outcome = handshake(&self.session, &mut self.inbound, registration) => outcome,
        };
        acknowledged?;

        self.state.set(ConnectionState::Connected);
        client.attach(Arc::clone(&self.session));
        info!(plugin = %self.plugin_id, version = registry.version(), "registered with panel");

        let mut held = VecDeque::new();
        if let Some(hook) = on_start {
            if let Some(exit) = self.run_start_hook(hook, client, &mut held).await? {
                return Ok(exit);
            }
        }

        let started = Envelope::uncorrelated(Payload::Log(LogRecord {
            plugin_id: self.plugin_id.clone(),
            level: DEFAULT_LOG_LEVEL.to_string(),
            message: format!("{} v{} started", registry.name(), registry.version()),
        }));
        if let Err(e) = self.session.send(started).await {
            warn!(plugin = %self.plugin_id, error = %e, "failed to send start log");
        }

        let dispatcher = Dispatcher::new(Arc::new(registry));
        if !held.is_empty() {
            debug!(plugin = %self.plugin_id, held = held.len(), "dispatching calls received during start");
        }
        for (kind, envelope) in held {
            self.spawn_call(&dispatcher, kind, envelope);
        }
        self.serve(&dispatcher).await
    }

    /// Run the start hook to completion while still reading, so replies
    /// reach calls the hook makes. Inbound calls are held in `held`.
    ///
    /// Returns an exit when the connection ends before the hook does. The
    /// hook keeps running detached in that case and its calls fail once the
    /// pending table closes.
    async fn run_start_hook(
        &mut self,
        hook: StartHook,
        client: &PanelClient,
        held: &mut VecDeque<(CallKind, Envelope)>,
    ) -> Result<Option<Exit>> {
        let hook_client = client.clone();
        let mut task = tokio::task::spawn_blocking(move || as_handler(|| hook(&hook_client)));
        loop {
            let received = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => {
                    info!(plugin = %self.plugin_id, "shutdown requested during start hook");
                    return Ok(Some(Exit::Cancelled));
                }
                finished = &mut task => {
                    if let Err(e) = finished {
                        error!(plugin = %self.plugin_id, error = %e, "start hook panicked");
                    }
                    return Ok(None);
                }
                received = next_inbound(&mut self.inbound) => received,
            };
            match self.step(received)? {
                Step::Skip => {}
                Step::Call(kind, envelope) => held.push_back((kind, envelope)),
                Step::Exit(exit) => return Ok(Some(exit)),
            }
        }
    }

    async fn serve(&mut self, dispatcher: &Dispatcher) -> Result<Exit> {
        loop {
            let received = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => {
                    info!(plugin = %self.plugin_id, "shutdown requested locally");
                    return Ok(Exit::Cancelled);
                }
                received = next_inbound(&mut self.inbound) => received,
            };
            match self.step(received)? {
                Step::Skip => {}
                Step::Call(kind, envelope) => self.spawn_call(dispatcher, kind, envelope),
                Step::Exit(exit) => return Ok(exit),
            }
        }
    }

    /// Route replies and recognize terminal envelopes. Calls are returned
    /// to the caller to dispatch or hold.
    fn step(&self, received: Inbound) -> Result<Step> {
        let envelope = match received {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                info!(plugin = %self.plugin_id, "panel closed the connection");
                return Ok(Step::Exit(Exit::EndOfStream));
            }
            Err(e) if e.is_recoverable() => {
                warn!(plugin = %self.plugin_id, error = %e, "skipping malformed frame");
                return Ok(Step::Skip);
            }
            Err(e) => return Err(e.into()),
        };

        if envelope.payload.is_reply() {
            self.session.pending.fulfill(envelope);
            return Ok(Step::Skip);
        }
        if matches!(envelope.payload, Payload::Shutdown) {
            info!(plugin = %self.plugin_id, "panel requested shutdown");
            return Ok(Step::Exit(Exit::Shutdown));
        }
        match CallKind::of(&envelope.payload) {
            Some(kind) => Ok(Step::Call(kind, envelope)),
            None => {
                debug!(
                    plugin = %self.plugin_id,
                    kind = envelope.payload.kind_name(),
                    request_id = %envelope.request_id,
                    "ignoring envelope"
                );
                Ok(Step::Skip)
            }
        }
    }

    /// Run the handler on a blocking worker and write its reply.
    fn spawn_call(&self, dispatcher: &Dispatcher, kind: CallKind, envelope: Envelope) {
        let dispatcher = dispatcher.clone();
        let session = Arc::clone(&self.session);
        let plugin_id = self.plugin_id.clone();
        let request_id = envelope.request_id.clone();

        tokio::spawn(async move {
            let handled = tokio::task::spawn_blocking(move || as_handler(|| dispatcher.dispatch(envelope))).await;
            let reply = match handled {
                Ok(Some(reply)) => reply,
                Ok(None) => return,
                Err(e) => {
                    error!(plugin = %plugin_id, ?kind, %request_id, error = %e, "handler failed");
                    kind.failure_reply()
                }
            };
            if let Err(e) = session.send(Envelope::new(request_id.clone(), reply)).await {
                warn!(plugin = %plugin_id, %request_id, error = %e, "failed to send reply");
            }
        });
    }
}

/// Resolves once a local stop has been requested.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    // The sender outlives the run loop, so an error here cannot happen early.
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Send the registration and wait for the acknowledgement.
async fn handshake(session: &Session, inbound: &mut mpsc::Receiver<Inbound>, registration: Envelope) -> Result<()> {
    session
        .send(registration)
        .await
        .map_err(|e| Error::Handshake(format!("failed to send registration: {e}")))?;

    match next_inbound(inbound).await {
        Ok(Some(Envelope {
            payload: Payload::RegistrationAck,
            ..
        })) => Ok(()),
        Ok(Some(other)) => Err(Error::Handshake(format!(
            "expected registration_ack, got {}",
            other.payload.kind_name()
        ))),
        Ok(None) => Err(Error::Handshake("connection closed before registration was acknowledged".to_string())),
        Err(e) => Err(Error::Handshake(e.to_string())),
    }
}

impl Plugin {
    /// Open a [`Connection`] for this plugin, to observe or cancel it while
    /// it runs.
    pub fn connection(self) -> Connection {
        Connection::new(self)
    }

    /// Serve this plugin over `transport` until shutdown or end of stream.
    pub async fn run<T: Transport>(self, transport: T) -> Result<Exit> {
        Connection::new(self).run(transport).await
    }

    /// Parse the process arguments, connect to the panel and serve.
    pub async fn start(self, default_addr: &str) -> anyhow::Result<()> {
        self.start_with(StartupArgs::from_env(default_addr)).await
    }

    /// Like [`Plugin::start`] with explicit startup arguments.
    pub async fn start_with(self, args: StartupArgs) -> anyhow::Result<()> {
        let data_dir = DataDir::resolve(self.id(), args.data_base.as_deref());
        if self.wants_data_dir() {
            data_dir.ensure();
        }
        self.client().bind_data_dir(data_dir);

        info!(plugin = %self.id(), addr = %args.panel_addr, "connecting to panel");
        let transport = FrameTransport::connect(args.panel_addr.as_str())
            .await
            .with_context(|| format!("failed to connect to panel at {}", args.panel_addr))?;

        let exit = self.run(transport).await.context("plugin connection failed")?;
        debug!(?exit, "plugin stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::envelope::HostReply;
    use crate::transport::ChannelTransport;
    use crate::transport::FrameLimits;
    use crate::transport::HostEnd;
    use crate::transport::read_frame;

    const WAIT: Duration = Duration::from_secs(5);

    fn attached(writer: Box<dyn EnvelopeWriter>) -> (Arc<Session>, PanelClient) {
        let session = Arc::new(Session::new("p", writer));
        let client = PanelClient::new("p".to_string());
        client.attach(Arc::clone(&session));
        (session, client)
    }

    fn host_reply(request_id: String, result: Value) -> Envelope {
        Envelope::new(request_id, Payload::HostReply(HostReply { result, error: None }))
    }

    /// Answer the next host call on `host` with `result`.
    async fn answer_next(host: &mut HostEnd, session: &Session, result: Value) -> String {
        let sent = tokio::time::timeout(WAIT, host.recv()).await.expect("timed out").expect("host call");
        let Payload::HostCall(call) = sent.payload else {
            panic!("expected host call, got {}", sent.payload.kind_name());
        };
        assert!(session.pending.fulfill(host_reply(sent.request_id, result)));
        call.method
    }

    #[test]
    fn state_cell_round_trips_every_state() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        for state in [
            ConnectionState::Handshaking,
            ConnectionState::Connected,
            ConnectionState::Closed,
            ConnectionState::Disconnected,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[tokio::test]
    async fn call_before_connect_is_not_connected() {
        let client = PanelClient::new("early".to_string());
        assert!(!client.is_connected());
        let err = client.call("servers.list", Value::Null).await.expect_err("not connected");
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn call_resolves_with_host_result_or_error() {
        let (transport, mut host) = ChannelTransport::pair();
        let (_reader, writer) = transport.split();
        let (session, client) = attached(writer);

        let caller = client.clone();
        let ok = tokio::spawn(async move { caller.call("servers.count", Value::Null).await });
        let sent = host.recv().await.expect("host call");
        assert!(matches!(sent.payload, Payload::HostCall(ref c) if c.method == "servers.count"));
        session.pending.fulfill(Envelope::new(sent.request_id, Payload::HostReply(HostReply {
            result: Value::from(3),
            error: None,
        })));
        assert_eq!(ok.await.expect("join").expect("result"), Value::from(3));

        let caller = client.clone();
        let failing = tokio::spawn(async move { caller.call("servers.delete", Value::Null).await });
        let sent = host.recv().await.expect("host call");
        session.pending.fulfill(Envelope::new(sent.request_id, Payload::HostReply(HostReply {
            result: Value::Null,
            error: Some("forbidden".into()),
        })));
        let err = failing.await.expect("join").expect_err("host error");
        assert!(matches!(err, Error::Host(ref m) if m == "forbidden"));
    }

    #[tokio::test]
    async fn shutdown_before_run_cancels_handshake() {
        let (transport, _host) = ChannelTransport::pair();
        let connection = Plugin::new("p", "0.1.0").connection();
        let handle = connection.shutdown_handle();
        handle.shutdown();

        let exit = connection.run(transport).await.expect("run");
        assert_eq!(exit, Exit::Cancelled);
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn abandoned_call_still_writes_a_whole_frame() {
        let (plugin_io, mut panel_io) = tokio::io::duplex(256);
        let (_reader, writer) = FrameTransport::new(tokio::io::empty(), plugin_io).split();
        let (session, client) = attached(writer);

        // The panel is not reading yet, so the big frame cannot finish.
        let blob = "x".repeat(4096);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), client.call("big", json!({ "blob": blob.as_str() }))).await;
        assert!(abandoned.is_err());
        assert!(session.pending.is_empty());

        let caller = client.clone();
        let small = tokio::spawn(async move { caller.call("small", Value::from(1)).await });

        let limits = FrameLimits::default();
        let first = tokio::time::timeout(WAIT, read_frame(&mut panel_io, &limits))
            .await
            .expect("first frame")
            .expect("first frame decodes")
            .expect("first frame present");
        assert!(matches!(first.payload, Payload::HostCall(ref c) if c.method == "big" && c.params["blob"] == blob));

        let second = tokio::time::timeout(WAIT, read_frame(&mut panel_io, &limits))
            .await
            .expect("second frame")
            .expect("second frame decodes")
            .expect("second frame present");
        assert!(matches!(second.payload, Payload::HostCall(ref c) if c.method == "small"));

        // A late answer to the abandoned call goes nowhere.
        assert!(!session.pending.fulfill(host_reply(first.request_id, Value::Null)));
        assert!(session.pending.fulfill(host_reply(second.request_id, Value::from(2))));
        assert_eq!(small.await.expect("join").expect("result"), Value::from(2));
    }

    #[tokio::test]
    async fn log_lines_need_no_runtime_on_the_calling_thread() {
        let (transport, mut host) = ChannelTransport::pair();
        let (_reader, writer) = transport.split();
        let (_session, client) = attached(writer);

        let logger = client.clone();
        std::thread::spawn(move || logger.log("from a plain thread")).join().expect("thread");

        let sent = tokio::time::timeout(WAIT, host.recv()).await.expect("timed out").expect("log");
        assert!(matches!(sent.payload, Payload::Log(ref log) if log.message == "from a plain thread"));
    }

    // -------------------------------------------------------------------------
    // Blocking calls
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn blocking_call_on_a_current_thread_runtime_is_refused() {
        let (transport, _host) = ChannelTransport::pair();
        let (_reader, writer) = transport.split();
        let (session, client) = attached(writer);

        let err = client.call_blocking("servers.count", Value::Null).expect_err("must not block");
        assert!(matches!(err, Error::BlockingInAsync));
        assert!(session.pending.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_call_on_a_multi_thread_worker_completes() {
        let (transport, mut host) = ChannelTransport::pair();
        let (_reader, writer) = transport.split();
        let (session, client) = attached(writer);

        let panel_session = Arc::clone(&session);
        let panel = tokio::spawn(async move { answer_next(&mut host, &panel_session, Value::from(4)).await });

        let value = client.call_blocking("servers.count", Value::Null).expect("result");
        assert_eq!(value, Value::from(4));
        assert_eq!(panel.await.expect("join"), "servers.count");
    }

    #[tokio::test]
    async fn blocking_call_from_a_plain_thread_completes() {
        let (transport, mut host) = ChannelTransport::pair();
        let (_reader, writer) = transport.split();
        let (session, client) = attached(writer);

        let caller = std::thread::spawn(move || client.call_blocking("settings.get", json!({ "key": "motd" })));
        assert_eq!(answer_next(&mut host, &session, json!("hello")).await, "settings.get");

        let outcome = tokio::task::spawn_blocking(move || caller.join())
            .await
            .expect("join")
            .expect("thread");
        assert_eq!(outcome.expect("result"), json!("hello"));
    }
}
