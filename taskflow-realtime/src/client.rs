//! Realtime client: one persistent connection per instance plus the
//! coordination services layered on it.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - Channel subscriptions with resubscription after reconnect
//! - Edit locks and optimistic operation submission
//! - Presence and typing signals
//!
//! Every coordination call fails fast with [`RealtimeError::NotConnected`]
//! outside `Connected`; nothing is queued for later.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::locks::EditLockManager;
use crate::operations::OperationSubmitter;
use crate::presence::PresenceBroadcaster;
use crate::protocol::{
    EditOperation, Frame, LockGrant, LockResult, PresenceStatus, ResourceRef, SubmitOutcome, Version,
};
use crate::registry::{
    ChannelMessage, Listener, Subscription, SubscriptionKey, SubscriptionRegistry, WireChange, WILDCARD,
};
use crate::router::Router;
use crate::transport::{ConnectionState, Connection, Connector, TransportEvent, WsConnector};

type PendingStart = (mpsc::Receiver<TransportEvent>, mpsc::UnboundedReceiver<WireChange>);

pub struct RealtimeClient {
    config: RealtimeConfig,
    connection: Arc<Connection>,
    registry: Arc<SubscriptionRegistry>,
    router: Arc<Router>,
    locks: EditLockManager,
    operations: OperationSubmitter,
    presence: PresenceBroadcaster,
    /// Receivers waiting for `init()` to hand them to the router task.
    pending_start: Mutex<Option<PendingStart>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Client speaking WebSocket to the endpoint derived from `config`.
    pub fn new(config: RealtimeConfig) -> Result<Self, RealtimeError> {
        let connector = Arc::new(WsConnector::new(config.outbound_buffer));
        Self::with_connector(config, connector)
    }

    /// Client over a custom [`Connector`].
    pub fn with_connector(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RealtimeError> {
        config.validate()?;
        let endpoint = config.ws_endpoint()?;

        let (connection, events) = Connection::new(
            endpoint,
            connector,
            config.backoff.clone(),
            config.inbound_buffer,
        );
        let connection = Arc::new(connection);
        let (registry, control) = SubscriptionRegistry::new();
        let router = Router::new(connection.clone(), registry.clone(), config.request_timeout());

        let user = config.user.clone();
        Ok(Self {
            locks: EditLockManager::new(router.clone(), user.clone()),
            operations: OperationSubmitter::new(router.clone(), user.clone()),
            presence: PresenceBroadcaster::new(connection.clone(), user, config.typing_refresh()),
            config,
            connection,
            registry,
            router,
            pending_start: Mutex::new(Some((events, control))),
            router_task: Mutex::new(None),
        })
    }

    fn router_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.router_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start routing inbound traffic. Must run inside a Tokio runtime.
    ///
    /// Idempotent; `connect()` calls it on first use.
    pub fn init(&self) {
        let start = self
            .pending_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((events, control)) = start {
            *self.router_task() = Some(self.router.spawn(events, control));
            log::debug!("Realtime client initialised for {}", self.config.user.id);
        }
    }

    /// Close the connection and stop the router. The client cannot be
    /// reused afterwards.
    pub fn shutdown(&self) {
        self.connection.disconnect();
        if let Some(task) = self.router_task().take() {
            task.abort();
        }
        self.router.link_down();
        self.locks.forget_all();
        log::info!("Realtime client shut down");
    }

    /// Open the connection, or join the attempt already in progress.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.init();
        self.connection.connect().await
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// Subscriptions are kept and replayed on the next `connect()`. Requests
    /// still waiting on a response fail at once with an unknown outcome.
    /// Locally tracked locks are forgotten; the server releases them with the
    /// session.
    pub fn disconnect(&self) {
        self.connection.disconnect();
        self.router.link_down();
        self.locks.forget_all();
        self.presence.reset_typing();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_receiver()
    }

    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        self.connection.state_stream()
    }

    /// Why the connection last entered `Failed`.
    pub fn last_failure(&self) -> Option<RealtimeError> {
        self.connection.last_failure()
    }

    pub fn endpoint(&self) -> &str {
        self.connection.endpoint()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    // ─── Channels ───

    /// Listen on `channel`, optionally narrowed to one resource.
    ///
    /// The first listener on a key sends the wire subscribe; the call
    /// resolves once that frame has been handed to the transport. If the
    /// link goes away first, the registration is rolled back and the call
    /// fails.
    pub async fn subscribe<F>(
        &self,
        channel: &str,
        resource_id: Option<&str>,
        handler: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.subscribe_listener(channel, resource_id, Arc::new(handler))
            .await
    }

    /// Like [`subscribe`](Self::subscribe) for a shared listener. Registering
    /// the same `Arc` twice on one key yields a single registration.
    pub async fn subscribe_listener(
        &self,
        channel: &str,
        resource_id: Option<&str>,
        listener: Listener,
    ) -> Result<Subscription, RealtimeError> {
        if !self.connection.state().is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        if channel == WILDCARD {
            return Ok(self.on(WILDCARD, listener));
        }

        let key = SubscriptionKey::new(channel, resource_id.map(str::to_string));
        let registration = self.registry.add_listener(key, listener);
        if let Some(sent) = registration.sent {
            if !sent.await.unwrap_or(false) {
                registration.subscription.unsubscribe();
                return Err(RealtimeError::TransportFailure(format!(
                    "link closed before the subscribe to {channel} was sent"
                )));
            }
            log::debug!("Subscribed to {channel}");
        }
        Ok(registration.subscription)
    }

    /// Register a listener without waiting on the wire.
    ///
    /// `"*"` receives every inbound application message and is never sent
    /// to the server. Any other channel is subscribed as soon as the link is
    /// up, or on the next (re)connect.
    pub fn on(&self, channel: &str, listener: Listener) -> Subscription {
        self.registry
            .add_listener(SubscriptionKey::new(channel, None), listener)
            .subscription
    }

    /// Drop every listener on a key and unsubscribe on the wire.
    ///
    /// The unsubscribe is queued behind any earlier subscribe for the same
    /// key. Returns whether the key was subscribed.
    pub async fn unsubscribe(
        &self,
        channel: &str,
        resource_id: Option<&str>,
    ) -> Result<bool, RealtimeError> {
        let key = SubscriptionKey::new(channel, resource_id.map(str::to_string));
        Ok(self.registry.remove_key(&key))
    }

    /// Publish `data` on `channel` to every subscriber.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<(), RealtimeError> {
        self.connection.send(&Frame::publish(channel, None, data)).await
    }

    /// Publish `data` on `channel`, scoped to one resource.
    pub async fn publish_to(
        &self,
        channel: &str,
        resource_id: &str,
        data: Value,
    ) -> Result<(), RealtimeError> {
        self.connection
            .send(&Frame::publish(channel, Some(resource_id.to_string()), data))
            .await
    }

    // ─── Locks ───

    pub async fn acquire_edit_lock(
        &self,
        resource_type: &str,
        resource_id: &str,
        section_id: Option<&str>,
    ) -> Result<LockResult, RealtimeError> {
        self.locks
            .acquire_edit_lock(resource_type, resource_id, section_id)
            .await
    }

    pub async fn release_edit_lock(
        &self,
        resource_type: &str,
        resource_id: &str,
        section_id: Option<&str>,
    ) -> Result<bool, RealtimeError> {
        self.locks
            .release_edit_lock(resource_type, resource_id, section_id)
            .await
    }

    pub fn held_locks(&self) -> Vec<(ResourceRef, LockGrant)> {
        self.locks.held_locks()
    }

    // ─── Operations ───

    pub async fn submit_operation(
        &self,
        operation: &EditOperation,
        version: Version,
    ) -> Result<SubmitOutcome, RealtimeError> {
        self.operations.submit_operation(operation, version).await
    }

    // ─── Presence ───

    pub fn update_presence(
        &self,
        status: PresenceStatus,
        current_view: Option<&str>,
    ) -> Result<bool, RealtimeError> {
        self.presence.update_presence(status, current_view)
    }

    pub fn update_typing_status(
        &self,
        is_typing: bool,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<bool, RealtimeError> {
        self.presence
            .update_typing_status(is_typing, resource_type, resource_id)
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(task) = self.router_task().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::protocol::{channels, UserRef};
    use crate::transport::memory::{MemoryConnector, MemoryPeer};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config() -> RealtimeConfig {
        let mut config = RealtimeConfig::new("http://localhost:3000/api", UserRef::new("ada", "Ada"));
        config.backoff = BackoffPolicy {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            max_attempts: 3,
            jitter: false,
        };
        config.request_timeout_ms = 500;
        config
    }

    fn client() -> (RealtimeClient, Arc<MemoryConnector>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (connector, accept) = MemoryConnector::new(64);
        let client = RealtimeClient::with_connector(config(), connector.clone()).unwrap();
        (client, connector, accept)
    }

    fn collector() -> (Listener, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |msg: &ChannelMessage| {
            let _ = tx.send(msg.clone());
        });
        (listener, rx)
    }

    #[test]
    fn test_client_rejects_invalid_config() {
        let (connector, _accept) = MemoryConnector::new(4);
        let mut bad = config();
        bad.user.id.clear();
        assert!(matches!(
            RealtimeClient::with_connector(bad, connector),
            Err(RealtimeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let (client, _connector, _accept) = client();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(client.endpoint(), "ws://localhost:3000/api/ws");
        assert!(client.held_locks().is_empty());
    }

    #[tokio::test]
    async fn test_coordination_calls_fail_fast_offline() {
        let (client, _connector, _accept) = client();
        client.init();

        let sub = client.subscribe("task.updated", None, |_| {}).await;
        assert_eq!(sub.unwrap_err(), RealtimeError::NotConnected);
        assert_eq!(
            client.acquire_edit_lock("task", "t-1", None).await.unwrap_err(),
            RealtimeError::NotConnected
        );
        let op = EditOperation::new(ResourceRef::new("task", "t-1"), json!({}));
        assert_eq!(
            client.submit_operation(&op, Version::INITIAL).await.unwrap_err(),
            RealtimeError::NotConnected
        );
        assert_eq!(
            client.update_presence(PresenceStatus::Online, None).unwrap_err(),
            RealtimeError::NotConnected
        );
        assert_eq!(
            client.publish("chat", json!("hi")).await.unwrap_err(),
            RealtimeError::NotConnected
        );
        // Nothing registered by the failed subscribe.
        assert_eq!(client.registry().key_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_sends_one_wire_frame_per_key() {
        let (client, _connector, mut accept) = client();
        client.connect().await.unwrap();
        let mut peer = accept.recv().await.unwrap();

        client.subscribe("task.updated", Some("t-1"), |_| {}).await.unwrap();
        client.subscribe("task.updated", Some("t-1"), |_| {}).await.unwrap();

        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame.channel, channels::SUBSCRIBE);
        assert_eq!(frame.data, json!({"channel": "task.updated", "resourceId": "t-1"}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.try_recv_frame().is_none());
    }

    #[tokio::test]
    async fn test_last_unsubscribe_sends_wire_unsubscribe() {
        let (client, _connector, mut accept) = client();
        client.connect().await.unwrap();
        let mut peer = accept.recv().await.unwrap();

        let a = client.subscribe("comments", None, |_| {}).await.unwrap();
        let b = client.subscribe("comments", None, |_| {}).await.unwrap();
        assert_eq!(peer.recv_frame().await.unwrap().channel, channels::SUBSCRIBE);

        assert!(!a.unsubscribe());
        assert!(b.unsubscribe());
        let frame = timeout(Duration::from_secs(1), peer.recv_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.channel, channels::UNSUBSCRIBE);
        assert_eq!(frame.data["channel"], "comments");
    }

    #[tokio::test]
    async fn test_inbound_dispatch_and_wildcard() {
        let (client, _connector, mut accept) = client();
        client.connect().await.unwrap();
        let mut peer = accept.recv().await.unwrap();

        let (listener, mut rx) = collector();
        client
            .subscribe_listener("task.updated", Some("t-1"), listener)
            .await
            .unwrap();
        let (tap, mut all) = collector();
        client.on(WILDCARD, tap);
        let _ = peer.recv_frame().await;

        peer.send_frame(&Frame::publish("task.updated", Some("t-1".into()), json!({"n": 1})))
            .await
            .unwrap();
        peer.send_frame(&Frame::publish("task.updated", Some("t-2".into()), json!({"n": 2})))
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.data, json!({"n": 1}));
        let a = timeout(Duration::from_secs(1), all.recv()).await.unwrap().unwrap();
        let b = timeout(Duration::from_secs(1), all.recv()).await.unwrap().unwrap();
        assert_eq!((a.data["n"].clone(), b.data["n"].clone()), (json!(1), json!(2)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_key_removes_all_listeners() {
        let (client, _connector, mut accept) = client();
        client.connect().await.unwrap();
        let mut peer = accept.recv().await.unwrap();

        client.subscribe("board", None, |_| {}).await.unwrap();
        client.subscribe("board", None, |_| {}).await.unwrap();
        let _ = peer.recv_frame().await;

        assert!(client.unsubscribe("board", None).await.unwrap());
        assert!(!client.unsubscribe("board", None).await.unwrap());
        assert_eq!(peer.recv_frame().await.unwrap().channel, channels::UNSUBSCRIBE);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let (client, _connector, mut accept) = client();
        client.connect().await.unwrap();
        let _peer = accept.recv().await.unwrap();
        client.shutdown();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            client.acquire_edit_lock("task", "t-1", None).await.unwrap_err(),
            RealtimeError::NotConnected
        );
    }
}
