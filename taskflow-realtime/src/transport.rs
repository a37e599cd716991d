//! Transport connection: the single persistent socket and its state machine.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──open──► Connected ──drop──► Reconnecting
//!      ▲                        │                    ▲                 │      │
//!      │                        └──refused──► Failed ◄──retries spent──┘      │
//!      └──────────── disconnect (from any state) ────────────── retry ok ─────┘
//! ```
//!
//! The state is published on a `watch` channel; that is the only way other
//! components learn about connectivity. Everything the socket delivers is
//! forwarded, in order, as [`TransportEvent`]s on a single mpsc channel so
//! the router sees `Opened` strictly before any frame of the new link.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_tungstenite::tungstenite::Message;

use crate::config::BackoffPolicy;
use crate::error::RealtimeError;
use crate::protocol::Frame;

/// Connection lifecycle state. Exactly one value is live at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// What the socket delivered, in arrival order.
///
/// The receiver must be drained: the connection does not report
/// `Connected` until the `Opened` sender has been used or dropped.
#[derive(Debug)]
pub enum TransportEvent {
    /// A link is open. Emitted before any frame of that link. Signal (or
    /// drop) the sender once link setup such as resubscription is done.
    Opened(oneshot::Sender<()>),
    /// One inbound text frame.
    Frame(String),
    /// The link dropped or was torn down.
    Closed,
}

/// Duplex text channel over one physical connection.
///
/// The link is closed when `inbound` yields `None`; dropping `outbound`
/// closes it from our side.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens physical links. The seam between the state machine and the socket.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &str) -> Result<Link, RealtimeError>;
}

/// WebSocket connector (text frames).
pub struct WsConnector {
    buffer: usize,
}

impl WsConnector {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<Link, RealtimeError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| RealtimeError::TransportFailure(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<String>(self.buffer);

        // Writer task: runs until the outbound sender is dropped.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: dropping `in_tx` signals link closure.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            log::warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

struct Inner {
    /// Bumped by every connect/disconnect; stale supervisors compare against it.
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    supervisor: Option<JoinHandle<()>>,
    failure: Option<RealtimeError>,
}

struct Shared {
    endpoint: String,
    connector: Arc<dyn Connector>,
    backoff: BackoffPolicy,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<TransportEvent>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Apply `state` only if `generation` is still the live one.
    fn transition(&self, generation: u64, state: ConnectionState) -> bool {
        let inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }

    fn fail(&self, generation: u64, error: RealtimeError) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.outbound = None;
        inner.failure = Some(error);
        self.state_tx.send_replace(ConnectionState::Failed);
    }

    /// Install `outbound`, announce the link, wait for the consumer to finish
    /// link setup, then flip to `Connected`.
    async fn go_live(&self, generation: u64, outbound: mpsc::Sender<String>) -> bool {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return false;
            }
            inner.outbound = Some(outbound);
            inner.failure = None;
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        if self.events_tx.send(TransportEvent::Opened(ready_tx)).await.is_err() {
            return false;
        }
        let _ = ready_rx.await;
        self.transition(generation, ConnectionState::Connected)
    }

    fn begin_reconnect(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.outbound = None;
        self.state_tx.send_replace(ConnectionState::Reconnecting);
        true
    }
}

/// Owner of the single persistent connection.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a disconnected connection. The returned receiver yields every
    /// [`TransportEvent`] in arrival order.
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        backoff: BackoffPolicy,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            endpoint: endpoint.into(),
            connector,
            backoff,
            state_tx,
            events_tx,
            inner: Mutex::new(Inner {
                generation: 0,
                outbound: None,
                supervisor: None,
                failure: None,
            }),
        });
        (Self { shared }, events_rx)
    }

    /// Open the connection, or join the attempt already in progress.
    ///
    /// Resolves once the connection is `Connected` (Ok) or has reached
    /// `Failed`/`Disconnected` (Err).
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        {
            let mut inner = self.shared.lock();
            let current = *self.shared.state_tx.borrow();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    inner.generation += 1;
                    inner.failure = None;
                    let generation = inner.generation;
                    self.shared.state_tx.send_replace(ConnectionState::Connecting);
                    log::info!("Connecting to {}", self.shared.endpoint);
                    inner.supervisor = Some(tokio::spawn(supervise(
                        self.shared.clone(),
                        generation,
                    )));
                }
            }
        }

        let outcome = *state_rx
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Connected
                        | ConnectionState::Failed
                        | ConnectionState::Disconnected
                )
            })
            .await
            .map_err(|_| RealtimeError::NotConnected)?;

        match outcome {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Failed => Err(self
                .last_failure()
                .unwrap_or_else(|| RealtimeError::TransportFailure("connection failed".into()))),
            _ => Err(RealtimeError::NotConnected),
        }
    }

    /// Tear down the socket and cancel any reconnect timer.
    ///
    /// No further transitions happen until `connect()` is called again.
    /// Returns whether a link was open or being established.
    pub fn disconnect(&self) -> bool {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        if let Some(handle) = inner.supervisor.take() {
            handle.abort();
        }
        inner.outbound = None;
        let previous = self.shared.state_tx.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            log::info!("Disconnected from {}", self.shared.endpoint);
        }
        matches!(
            previous,
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch handle on the connection state.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Connection state as a `Stream`, starting with the current value.
    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.shared.state_tx.subscribe())
    }

    /// Why the connection last entered `Failed`.
    pub fn last_failure(&self) -> Option<RealtimeError> {
        self.shared.lock().failure.clone()
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    fn outbound(&self) -> Result<mpsc::Sender<String>, RealtimeError> {
        if !self.state().is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        self.shared
            .lock()
            .outbound
            .clone()
            .ok_or(RealtimeError::NotConnected)
    }

    /// Send a frame. Fails fast with `NotConnected` outside `Connected`.
    pub async fn send(&self, frame: &Frame) -> Result<(), RealtimeError> {
        let tx = self.outbound()?;
        let text = frame.encode()?;
        tx.send(text)
            .await
            .map_err(|_| RealtimeError::TransportFailure("connection closed".into()))
    }

    /// Send without waiting for queue space. `Ok(false)` means the frame was dropped.
    pub fn try_send(&self, frame: &Frame) -> Result<bool, RealtimeError> {
        let tx = self.outbound()?;
        let text = frame.encode()?;
        match tx.try_send(text) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RealtimeError::TransportFailure("connection closed".into()))
            }
        }
    }

    /// Send on the live link regardless of the published state.
    ///
    /// Used for resubscription replay, which runs between `Opened` and the
    /// flip to `Connected`.
    pub(crate) async fn send_on_link(&self, frame: &Frame) -> Result<(), RealtimeError> {
        let tx = self
            .shared
            .lock()
            .outbound
            .clone()
            .ok_or(RealtimeError::NotConnected)?;
        let text = frame.encode()?;
        tx.send(text)
            .await
            .map_err(|_| RealtimeError::TransportFailure("connection closed".into()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        if let Some(handle) = inner.supervisor.take() {
            handle.abort();
        }
        inner.outbound = None;
    }
}

/// Supervisor task: owns the current link, pumps inbound frames and runs
/// the reconnect loop when the link drops.
async fn supervise(shared: Arc<Shared>, generation: u64) {
    let mut link = match shared.connector.open(&shared.endpoint).await {
        Ok(link) => link,
        Err(e) => {
            log::warn!("Failed to connect to {}: {e}", shared.endpoint);
            shared.fail(generation, e);
            return;
        }
    };

    loop {
        if !shared.go_live(generation, link.outbound.clone()).await {
            return;
        }
        log::info!("Connected to {}", shared.endpoint);

        while let Some(text) = link.inbound.recv().await {
            if shared.events_tx.send(TransportEvent::Frame(text)).await.is_err() {
                return;
            }
        }

        if !shared.begin_reconnect(generation) {
            return;
        }
        log::warn!("Connection to {} lost", shared.endpoint);
        let _ = shared.events_tx.send(TransportEvent::Closed).await;

        match reconnect(&shared, generation).await {
            Some(next) => link = next,
            None => return,
        }
    }
}

async fn reconnect(shared: &Shared, generation: u64) -> Option<Link> {
    let policy = &shared.backoff;
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        log::info!(
            "Reconnecting to {} in {:.1}s (attempt {attempt}/{})",
            shared.endpoint,
            delay.as_secs_f32(),
            policy.max_attempts
        );
        tokio::time::sleep(delay).await;

        if !shared.is_current(generation) {
            return None;
        }
        match shared.connector.open(&shared.endpoint).await {
            Ok(link) => return Some(link),
            Err(e) => log::warn!("Reconnect attempt {attempt} failed: {e}"),
        }
    }

    log::error!(
        "Giving up on {} after {} reconnect attempts",
        shared.endpoint,
        policy.max_attempts
    );
    shared.fail(
        generation,
        RealtimeError::ReconnectExhausted {
            attempts: policy.max_attempts,
        },
    );
    None
}

/// In-process connector whose server ends are handed to the test or host.
pub mod memory {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Server half of an in-process link. Dropping it closes the link.
    pub struct MemoryPeer {
        pub from_client: mpsc::Receiver<String>,
        pub to_client: mpsc::Sender<String>,
    }

    impl MemoryPeer {
        /// Next frame the client sent, `None` once the client side closed.
        pub async fn recv_frame(&mut self) -> Option<Frame> {
            let text = self.from_client.recv().await?;
            Frame::decode(&text).ok()
        }

        /// Frame already queued by the client, without waiting.
        pub fn try_recv_frame(&mut self) -> Option<Frame> {
            let text = self.from_client.try_recv().ok()?;
            Frame::decode(&text).ok()
        }

        pub async fn send_frame(&self, frame: &Frame) -> Result<(), RealtimeError> {
            self.to_client
                .send(frame.encode()?)
                .await
                .map_err(|_| RealtimeError::TransportFailure("client gone".into()))
        }
    }

    pub struct MemoryConnector {
        accept_tx: mpsc::UnboundedSender<MemoryPeer>,
        refuse: AtomicBool,
        opened: AtomicUsize,
        buffer: usize,
    }

    impl MemoryConnector {
        /// Connector plus the receiver on which each accepted link's server end arrives.
        pub fn new(buffer: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
            let (accept_tx, accept_rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                accept_tx,
                refuse: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
                buffer: buffer.max(1),
            });
            (connector, accept_rx)
        }

        /// Make subsequent `open` calls fail, as if the server were down.
        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }

        /// Number of links successfully opened.
        pub fn open_count(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn open(&self, _endpoint: &str) -> Result<Link, RealtimeError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(RealtimeError::TransportFailure("connection refused".into()));
            }
            let (client_tx, server_rx) = mpsc::channel(self.buffer);
            let (server_tx, client_rx) = mpsc::channel(self.buffer);
            self.accept_tx
                .send(MemoryPeer {
                    from_client: server_rx,
                    to_client: server_tx,
                })
                .map_err(|_| RealtimeError::TransportFailure("listener gone".into()))?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Link {
                outbound: client_tx,
                inbound: client_rx,
            })
        }
    }
}
