//! Subscription registry: `(channel, resourceId)` → ordered listener set.
//!
//! - The first listener on a key produces a wire-level subscribe; removing
//!   the last one produces a wire-level unsubscribe and deletes the key.
//!   Both are queued as [`WireChange`]s while the registry lock is held, so
//!   the router sees them in the same order the registry applied them.
//! - Keys keep their registration order, which is the order used when the
//!   router replays subscriptions after a reconnect.
//! - Dispatch iterates a snapshot, so a listener may unsubscribe itself (or
//!   a sibling) from inside its own invocation. A sibling removed mid-dispatch
//!   is skipped; nobody else is.
//! - A panicking listener is isolated and logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::Frame;

/// Channel name that matches every inbound message. Never sent on the wire.
pub const WILDCARD: &str = "*";

/// Listener callback.
pub type Listener = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// An inbound application message as delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: String,
    pub resource_id: Option<String>,
    pub data: Value,
}

impl From<Frame> for ChannelMessage {
    fn from(frame: Frame) -> Self {
        Self {
            channel: frame.channel,
            resource_id: frame.resource_id,
            data: frame.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel: String,
    pub resource_id: Option<String>,
}

impl SubscriptionKey {
    pub fn new(channel: impl Into<String>, resource_id: Option<String>) -> Self {
        Self {
            channel: channel.into(),
            resource_id,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.channel == WILDCARD
    }

    /// Channel must match; a key without a resource id accepts any resource.
    pub fn matches(&self, channel: &str, resource_id: Option<&str>) -> bool {
        if self.is_wildcard() {
            return true;
        }
        self.channel == channel
            && match &self.resource_id {
                None => true,
                Some(wanted) => resource_id == Some(wanted.as_str()),
            }
    }

    pub fn subscribe_frame(&self) -> Frame {
        Frame::subscribe(&self.channel, self.resource_id.as_deref())
    }

    pub fn unsubscribe_frame(&self) -> Frame {
        Frame::unsubscribe(&self.channel, self.resource_id.as_deref())
    }
}

/// A wire-level subscription change, queued in registry order.
#[derive(Debug)]
pub struct WireChange {
    pub key: SubscriptionKey,
    pub subscribe: bool,
    /// Resolved with whether the frame was written to a live link.
    pub sent: Option<oneshot::Sender<bool>>,
}

impl WireChange {
    pub fn frame(&self) -> Frame {
        if self.subscribe {
            self.key.subscribe_frame()
        } else {
            self.key.unsubscribe_frame()
        }
    }
}

struct Entry {
    id: u64,
    listener: Listener,
}

#[derive(Default)]
struct State {
    keys: IndexMap<SubscriptionKey, Vec<Entry>>,
    next_id: u64,
}

/// Result of registering a listener.
pub struct Registration {
    pub subscription: Subscription,
    /// The key had no listeners before; a wire subscribe was queued.
    pub first_on_key: bool,
    /// Resolves once the router has handled that subscribe. `None` when
    /// nothing went to the wire.
    pub sent: Option<oneshot::Receiver<bool>>,
}

pub struct SubscriptionRegistry {
    state: Mutex<State>,
    /// Wire subscribes and unsubscribes, in the order they were applied.
    control_tx: mpsc::UnboundedSender<WireChange>,
}

impl SubscriptionRegistry {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WireChange>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            state: Mutex::new(State::default()),
            control_tx,
        });
        (registry, control_rx)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold the state lock.
    fn queue_wire(&self, key: &SubscriptionKey, subscribe: bool) -> Option<oneshot::Receiver<bool>> {
        if key.is_wildcard() {
            return None;
        }
        let (sent, ack) = if subscribe {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let change = WireChange {
            key: key.clone(),
            subscribe,
            sent,
        };
        if self.control_tx.send(change).is_err() {
            log::trace!("Router gone; wire change for {} not queued", key.channel);
        }
        ack
    }

    /// Add `listener` under `key`.
    ///
    /// Registering the identical callback twice on the same key returns a
    /// handle to the existing registration.
    pub fn add_listener(self: &Arc<Self>, key: SubscriptionKey, listener: Listener) -> Registration {
        let mut guard = self.lock();
        let state = &mut *guard;
        let entries = state.keys.entry(key.clone()).or_default();
        let first_on_key = entries.is_empty();

        let existing = entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.listener, &listener))
            .map(|e| e.id);
        let id = match existing {
            Some(id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                entries.push(Entry { id, listener });
                id
            }
        };
        let sent = if first_on_key {
            self.queue_wire(&key, true)
        } else {
            None
        };
        drop(guard);

        Registration {
            subscription: Subscription {
                key,
                id,
                registry: Arc::downgrade(self),
            },
            first_on_key,
            sent,
        }
    }

    /// Remove one listener, queueing the wire unsubscribe when the key
    /// empties. Returns `true` if it was the last on its key.
    fn remove_listener(&self, key: &SubscriptionKey, id: u64) -> bool {
        let mut state = self.lock();
        let Some(entries) = state.keys.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before || !entries.is_empty() {
            return false;
        }
        state.keys.shift_remove(key);
        self.queue_wire(key, false);
        if !key.is_wildcard() {
            log::debug!("Last listener left {}, unsubscribing", key.channel);
        }
        true
    }

    /// Remove every listener on `key`, queueing the wire unsubscribe.
    /// Returns whether the key existed.
    pub fn remove_key(&self, key: &SubscriptionKey) -> bool {
        let mut state = self.lock();
        if state.keys.shift_remove(key).is_none() {
            return false;
        }
        self.queue_wire(key, false);
        true
    }

    pub fn contains_key(&self, key: &SubscriptionKey) -> bool {
        self.lock().keys.contains_key(key)
    }

    fn is_registered(&self, key: &SubscriptionKey, id: u64) -> bool {
        self.lock()
            .keys
            .get(key)
            .is_some_and(|entries| entries.iter().any(|e| e.id == id))
    }

    /// Wire-subscribable keys in registration order.
    pub fn keys_in_order(&self) -> Vec<SubscriptionKey> {
        self.lock()
            .keys
            .keys()
            .filter(|k| !k.is_wildcard())
            .cloned()
            .collect()
    }

    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.lock().keys.get(key).map_or(0, Vec::len)
    }

    pub fn key_count(&self) -> usize {
        self.lock().keys.len()
    }

    /// Deliver `msg` to every matching listener. Returns how many ran to completion.
    pub fn dispatch(&self, msg: &ChannelMessage) -> usize {
        let snapshot: Vec<(SubscriptionKey, u64, Listener)> = {
            let state = self.lock();
            state
                .keys
                .iter()
                .filter(|(key, _)| key.matches(&msg.channel, msg.resource_id.as_deref()))
                .flat_map(|(key, entries)| {
                    entries
                        .iter()
                        .map(move |e| (key.clone(), e.id, e.listener.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        for (key, id, listener) in snapshot {
            if !self.is_registered(&key, id) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| listener(msg))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    log::error!(
                        "Listener on {} panicked while handling a message; continuing",
                        key.channel
                    );
                }
            }
        }
        delivered
    }
}

/// Stable disposer for one listener registration.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    key: SubscriptionKey,
    id: u64,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    /// Remove this listener. Safe to call from inside the listener itself
    /// and idempotent. Returns `true` if the call removed the last listener
    /// on the key.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove_listener(&self.key, self.id),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|r| r.is_registered(&self.key, self.id))
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
