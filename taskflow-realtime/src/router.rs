//! Channel router: the single consumer of transport events.
//!
//! Events are handled strictly in arrival order, so on `Opened` the full
//! resubscription replay is written to the new link before the next inbound
//! frame is looked at, and before the connection reports `Connected`.
//! Wire subscription changes from the registry share that one task, are
//! filtered against what the current link already holds, and go out on any
//! live link, including the one still finishing its replay.
//! Frames carrying a `requestId` complete the matching pending request;
//! everything else that is not protocol plumbing is dispatched through the
//! subscription registry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::RealtimeError;
use crate::protocol::{channels, Frame};
use crate::registry::{ChannelMessage, SubscriptionKey, SubscriptionRegistry, WireChange};
use crate::transport::{Connection, TransportEvent};

/// What the server holds for the current link.
#[derive(Default)]
struct LinkView {
    /// Set once `Opened` has been handled; cleared when the link goes away.
    open: bool,
    subscribed: HashSet<SubscriptionKey>,
}

pub struct Router {
    connection: Arc<Connection>,
    registry: Arc<SubscriptionRegistry>,
    link: Mutex<LinkView>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
}

impl Router {
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<SubscriptionRegistry>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            registry,
            link: Mutex::new(LinkView::default()),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            request_timeout,
        })
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Frame>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self) -> MutexGuard<'_, LinkView> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the router task.
    ///
    /// `control` carries the registry's wire subscribes and unsubscribes.
    pub fn spawn(
        self: &Arc<Self>,
        events: mpsc::Receiver<TransportEvent>,
        control: mpsc::UnboundedReceiver<WireChange>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(events, control))
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        mut control: mpsc::UnboundedReceiver<WireChange>,
    ) {
        loop {
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },

                Some(change) = control.recv() => self.apply_wire_change(change).await,
            }
        }
        self.link_down();
        log::debug!("Router stopped");
    }

    pub(crate) async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened(ready) => {
                self.replay_subscriptions().await;
                let _ = ready.send(());
            }
            TransportEvent::Frame(text) => self.route(&text),
            TransportEvent::Closed => self.link_down(),
        }
    }

    /// Send one registry change if it alters what the server holds.
    ///
    /// Before `Opened` is handled the change is dropped: the key is already
    /// in (or already gone from) the registry, so the replay covers it.
    async fn apply_wire_change(&self, change: WireChange) {
        let frame = change.frame();
        let WireChange { key, subscribe, sent } = change;
        let needed = {
            let mut link = self.link();
            if !link.open {
                None
            } else if subscribe {
                Some(link.subscribed.insert(key.clone()))
            } else {
                Some(link.subscribed.remove(&key))
            }
        };

        let delivered = match needed {
            None => false,
            Some(false) => true,
            Some(true) => match self.connection.send_on_link(&frame).await {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Dropping {} for {}: {e}", frame.channel, key.channel);
                    if subscribe {
                        self.link().subscribed.remove(&key);
                    }
                    false
                }
            },
        };
        if let Some(sent) = sent {
            let _ = sent.send(delivered);
        }
    }

    /// Re-issue a wire subscribe for every held key, in registration order.
    async fn replay_subscriptions(&self) -> usize {
        {
            let mut link = self.link();
            link.open = true;
            link.subscribed.clear();
        }
        let keys = self.registry.keys_in_order();
        let mut sent = 0;
        for key in &keys {
            if let Err(e) = self.connection.send_on_link(&key.subscribe_frame()).await {
                log::warn!("Resubscription replay interrupted after {sent} keys: {e}");
                return sent;
            }
            self.link().subscribed.insert(key.clone());
            sent += 1;
        }
        if sent > 0 {
            log::info!("Replayed {sent} subscriptions");
        }
        sent
    }

    fn route(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };

        if let Some(request_id) = frame.request_id {
            match self.pending().remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => log::debug!(
                    "Discarding late response {request_id} on {}",
                    frame.channel
                ),
            }
            return;
        }

        if frame.channel == channels::PING {
            let _ = self.connection.try_send(&Frame::pong());
            return;
        }
        if frame.is_system() {
            log::trace!("Ignoring system frame {}", frame.channel);
            return;
        }

        self.registry.dispatch(&ChannelMessage::from(frame));
    }

    /// Forget the current link: nothing is subscribed on it any more and
    /// every in-flight request fails.
    pub fn link_down(&self) {
        *self.link() = LinkView::default();
        self.fail_pending();
    }

    /// Drop every in-flight request; their callers see an unknown outcome.
    fn fail_pending(&self) {
        let drained = std::mem::take(&mut *self.pending());
        if !drained.is_empty() {
            log::warn!(
                "Connection lost with {} requests in flight; outcomes unknown",
                drained.len()
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Send a request on `channel` and wait for the correlated response.
    ///
    /// Fails fast with `NotConnected` when the connection is not up. A
    /// dropped link or a timeout yields an error whose outcome is unknown.
    pub async fn request<T, R>(&self, channel: &str, payload: &T) -> Result<R, RealtimeError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        if !self.connection.state().is_connected() {
            return Err(RealtimeError::NotConnected);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::request(channel, request_id, payload)?;
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, tx);

        if let Err(e) = self.connection.send(&frame).await {
            self.pending().remove(&request_id);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => {
                return Err(RealtimeError::TransportFailure(
                    "connection lost before a response arrived".into(),
                ))
            }
            Err(_) => {
                self.pending().remove(&request_id);
                return Err(RealtimeError::Timeout(self.request_timeout));
            }
        };

        if response.channel == channels::ERROR {
            let message = response
                .data
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unspecified server error");
            return Err(RealtimeError::Rejected(format!("{channel}: {message}")));
        }
        response.payload()
    }
}
