//! Reference WebSocket relay and coordination server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── subscription filter ──► Client A
//!            ├── publish ── BroadcastGroup ── subscription filter ──► Client B
//! Client B ──┘                       └── subscription filter ──► Client C
//!      │
//!      └── edit.lock.* / edit.operation.submit ──► Coordinator
//!                                                    ├── lock table (TTL, per connection)
//!                                                    └── version arbiter (per resource)
//! ```
//!
//! Publishes are fanned out to every connection subscribed to the channel,
//! the publisher included. Lock and operation requests are answered on the
//! requesting connection only; an accepted operation is additionally
//! announced on `edit.operation.applied`. A connection's locks are released
//! when it closes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, PeerSession};
use crate::protocol::{
    channels, now_millis, Frame, LockRequest, LockResult, OperationApplied, OperationRequest,
    OperationResult, ReleaseResult, ResourceRef, SubscriptionRequest, UserRef, Version,
};
use crate::registry::SubscriptionKey;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it lags
    pub broadcast_capacity: usize,
    /// Lifetime of an edit lock that is not refreshed
    pub lock_ttl_secs: u64,
    /// Connections beyond this are refused
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            lock_ttl_secs: 300,
            max_connections: 1000,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub locks_granted: u64,
    pub locks_denied: u64,
    pub operations_accepted: u64,
    pub operations_conflicted: u64,
}

// ───────────────────────────────────────────────────────────────────
// Coordination state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LockRecord {
    lock_id: String,
    holder: UserRef,
    connection_id: Uuid,
    expires_at: u64,
}

#[derive(Debug, Clone)]
struct ResourceState {
    version: Version,
    state: Value,
}

/// Authoritative lock table and per-resource version arbiter.
pub struct Coordinator {
    locks: HashMap<ResourceRef, LockRecord>,
    resources: HashMap<(String, String), ResourceState>,
    lock_ttl_ms: u64,
}

impl Coordinator {
    pub fn new(lock_ttl: Duration) -> Self {
        Self {
            locks: HashMap::new(),
            resources: HashMap::new(),
            lock_ttl_ms: lock_ttl.as_millis() as u64,
        }
    }

    /// Grant, refresh or deny a lock. Expired locks are treated as free.
    pub fn acquire(&mut self, request: &LockRequest, connection_id: Uuid, now: u64) -> LockResult {
        let existing = self
            .locks
            .get(&request.resource)
            .filter(|record| record.expires_at > now);

        let lock_id = match existing {
            Some(record) if record.holder.id != request.user.id => {
                return LockResult::denied(
                    Some(record.holder.clone()),
                    format!("{} is being edited by {}", request.resource, record.holder.display_name()),
                );
            }
            Some(record) => record.lock_id.clone(),
            None => Uuid::new_v4().to_string(),
        };

        let expires_at = now + self.lock_ttl_ms;
        self.locks.insert(
            request.resource.clone(),
            LockRecord {
                lock_id: lock_id.clone(),
                holder: request.user.clone(),
                connection_id,
                expires_at,
            },
        );
        LockResult::granted(lock_id, Some(expires_at))
    }

    /// Release a lock held by the requesting user. Returns whether one was dropped.
    pub fn release(&mut self, request: &LockRequest) -> bool {
        match self.locks.get(&request.resource) {
            Some(record) if record.holder.id == request.user.id => {
                self.locks.remove(&request.resource);
                true
            }
            _ => false,
        }
    }

    /// Drop every lock taken over `connection_id`.
    pub fn release_connection(&mut self, connection_id: Uuid) -> Vec<ResourceRef> {
        let released: Vec<ResourceRef> = self
            .locks
            .iter()
            .filter(|(_, record)| record.connection_id == connection_id)
            .map(|(resource, _)| resource.clone())
            .collect();
        for resource in &released {
            self.locks.remove(resource);
        }
        released
    }

    pub fn holder(&self, resource: &ResourceRef, now: u64) -> Option<&UserRef> {
        self.locks
            .get(resource)
            .filter(|record| record.expires_at > now)
            .map(|record| &record.holder)
    }

    /// Apply an operation if it was based on the current version.
    ///
    /// Object payloads are merged key by key into an object state; anything
    /// else replaces the state. Every accepted operation bumps the version
    /// by one, starting from `Version::INITIAL`.
    pub fn submit(&mut self, request: &OperationRequest) -> (OperationResult, Option<OperationApplied>) {
        let key = (
            request.resource.resource_type.clone(),
            request.resource.resource_id.clone(),
        );
        let entry = self.resources.entry(key).or_insert_with(|| ResourceState {
            version: Version::INITIAL,
            state: Value::Null,
        });

        if request.version != entry.version {
            return (OperationResult::conflict(entry.version, entry.state.clone()), None);
        }

        match (&mut entry.state, &request.operation) {
            (Value::Object(state), Value::Object(patch)) => {
                for (field, value) in patch {
                    state.insert(field.clone(), value.clone());
                }
            }
            (state, operation) => *state = operation.clone(),
        }
        entry.version = entry.version.next();

        let applied = OperationApplied {
            resource_type: request.resource.resource_type.clone(),
            version: entry.version,
            operation: request.operation.clone(),
            user: request.user.clone(),
        };
        (OperationResult::accepted(entry.version), Some(applied))
    }

    /// Current version and state of a resource.
    pub fn resource(&self, resource_type: &str, resource_id: &str) -> Option<(Version, &Value)> {
        self.resources
            .get(&(resource_type.to_string(), resource_id.to_string()))
            .map(|r| (r.version, &r.state))
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Server
// ───────────────────────────────────────────────────────────────────

/// State shared by every connection task.
#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    hub: Arc<BroadcastGroup>,
    coordinator: Arc<Mutex<Coordinator>>,
    stats: Arc<RwLock<ServerStats>>,
}

pub struct CoordinationServer {
    context: ServerContext,
}

impl CoordinationServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        let coordinator = Coordinator::new(Duration::from_secs(config.lock_ttl_secs));
        Self {
            context: ServerContext {
                config,
                hub,
                coordinator: Arc::new(Mutex::new(coordinator)),
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.context.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.context.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            {
                let mut s = self.context.stats.write().await;
                if s.active_connections as usize >= self.context.config.max_connections {
                    s.rejected_connections += 1;
                    log::warn!("Refusing {addr}: connection limit reached");
                    continue;
                }
                s.total_connections += 1;
                s.active_connections += 1;
            }

            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, &context).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                let mut s = context.stats.write().await;
                s.active_connections = s.active_connections.saturating_sub(1);
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        context: &ServerContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let session = PeerSession::new(Some(addr));
        let connection_id = session.connection_id;
        let mut hub_rx = context.hub.add_peer(session).await;
        let mut subscriptions: HashSet<SubscriptionKey> = HashSet::new();
        log::info!("WebSocket connection {connection_id} established from {addr}");

        let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = context.stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let frame = match Frame::decode(text.as_str()) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            let reply =
                                Self::handle_frame(context, connection_id, &mut subscriptions, frame).await;
                            if let Some(reply) = reply {
                                let encoded = match reply.encode() {
                                    Ok(encoded) => encoded,
                                    Err(e) => break Err(e.into()),
                                };
                                if let Err(e) = ws_sender.send(Message::Text(encoded.into())).await {
                                    break Err(e.into());
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {connection_id} closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }

                        _ => {}
                    }
                }

                frame = hub_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            let wanted = subscriptions
                                .iter()
                                .any(|key| key.matches(&frame.channel, frame.resource_id.as_deref()));
                            if !wanted {
                                continue;
                            }
                            let encoded = match frame.encode() {
                                Ok(encoded) => encoded,
                                Err(e) => break Err(e.into()),
                            };
                            if let Err(e) = ws_sender.send(Message::Text(encoded.into())).await {
                                break Err(e.into());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {connection_id} lagged by {n} frames");
                            context.hub.record_dropped(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        context.hub.remove_peer(&connection_id).await;
        let released = context.coordinator.lock().await.release_connection(connection_id);
        if !released.is_empty() {
            log::info!(
                "Released {} edit locks held by connection {connection_id}",
                released.len()
            );
        }
        outcome
    }

    async fn handle_frame(
        context: &ServerContext,
        connection_id: Uuid,
        subscriptions: &mut HashSet<SubscriptionKey>,
        frame: Frame,
    ) -> Option<Frame> {
        match frame.channel.as_str() {
            channels::SUBSCRIBE | channels::UNSUBSCRIBE => {
                match frame.payload::<SubscriptionRequest>() {
                    Ok(request) => {
                        let key = SubscriptionKey::new(request.channel, request.resource_id);
                        if frame.channel == channels::SUBSCRIBE {
                            log::debug!("{connection_id} subscribed to {}", key.channel);
                            subscriptions.insert(key);
                        } else {
                            subscriptions.remove(&key);
                        }
                    }
                    Err(e) => log::warn!("Malformed {} from {connection_id}: {e}", frame.channel),
                }
                None
            }

            channels::PING => Some(Frame::pong()),
            channels::PONG => None,

            channels::LOCK_ACQUIRE => {
                let result = match frame.payload::<LockRequest>() {
                    Ok(request) => {
                        let result = context
                            .coordinator
                            .lock()
                            .await
                            .acquire(&request, connection_id, now_millis());
                        let mut s = context.stats.write().await;
                        if result.success {
                            s.locks_granted += 1;
                        } else {
                            s.locks_denied += 1;
                        }
                        result
                    }
                    Err(e) => LockResult::denied(None, format!("malformed lock request: {e}")),
                };
                respond(&frame, &result)
            }

            channels::LOCK_RELEASE => {
                let released = match frame.payload::<LockRequest>() {
                    Ok(request) => context.coordinator.lock().await.release(&request),
                    Err(e) => {
                        log::warn!("Malformed lock release from {connection_id}: {e}");
                        false
                    }
                };
                respond(&frame, &ReleaseResult { released })
            }

            channels::OPERATION_SUBMIT => {
                let request = match frame.payload::<OperationRequest>() {
                    Ok(request) => request,
                    Err(e) => {
                        return respond(
                            &frame,
                            &OperationResult::failed(format!("malformed operation: {e}")),
                        )
                    }
                };
                let (result, applied) = context.coordinator.lock().await.submit(&request);
                {
                    let mut s = context.stats.write().await;
                    if result.success {
                        s.operations_accepted += 1;
                    } else if result.conflict {
                        s.operations_conflicted += 1;
                    }
                }
                if let Some(applied) = applied {
                    match serde_json::to_value(&applied) {
                        Ok(data) => {
                            context.hub.broadcast(Frame::publish(
                                channels::OPERATION_APPLIED,
                                Some(request.resource.resource_id.clone()),
                                data,
                            ));
                        }
                        Err(e) => log::error!("Failed to encode applied operation: {e}"),
                    }
                }
                respond(&frame, &result)
            }

            _ if frame.request_id.is_some() => Some(Frame {
                channel: channels::ERROR.to_string(),
                resource_id: None,
                data: json!({ "error": format!("unknown request channel {}", frame.channel) }),
                request_id: frame.request_id,
            }),

            _ if frame.is_system() => {
                log::debug!("Ignoring {} from {connection_id}", frame.channel);
                None
            }

            _ => {
                context.hub.broadcast(frame);
                None
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.context.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.context.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<BroadcastGroup> {
        &self.context.hub
    }

    pub fn coordinator(&self) -> &Arc<Mutex<Coordinator>> {
        &self.context.coordinator
    }
}

fn respond<T: serde::Serialize>(request: &Frame, payload: &T) -> Option<Frame> {
    match request.respond(payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Failed to encode {} response: {e}", request.channel);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubmitOutcome;

    fn lock_request(user: &str, resource: ResourceRef) -> LockRequest {
        LockRequest {
            resource,
            user: UserRef::new(user, user.to_uppercase()),
        }
    }

    fn op(version: u64, operation: Value) -> OperationRequest {
        OperationRequest {
            operation,
            resource: ResourceRef::new("task", "t-1"),
            version: Version(version),
            user: UserRef::new("ada", "Ada"),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.lock_ttl_secs, 300);
        assert_eq!(config.max_connections, 1000);
    }

    #[test]
    fn test_server_creation() {
        let server = CoordinationServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.hub().capacity(), 256);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CoordinationServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.locks_granted, 0);
    }

    #[test]
    fn test_lock_conflict_reports_holder() {
        let mut coordinator = Coordinator::new(Duration::from_secs(60));
        let resource = ResourceRef::new("task", "t-1");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = coordinator.acquire(&lock_request("ada", resource.clone()), a, 1_000);
        assert!(first.success);
        let second = coordinator.acquire(&lock_request("bob", resource.clone()), b, 1_001);
        assert!(!second.success);
        assert_eq!(second.held_by.unwrap().id, "ada");
        assert_eq!(coordinator.holder(&resource, 1_002).unwrap().id, "ada");
    }

    #[test]
    fn test_lock_reacquire_by_holder_keeps_id() {
        let mut coordinator = Coordinator::new(Duration::from_secs(60));
        let resource = ResourceRef::new("task", "t-1");
        let conn = Uuid::new_v4();

        let first = coordinator.acquire(&lock_request("ada", resource.clone()), conn, 1_000);
        let again = coordinator.acquire(&lock_request("ada", resource), conn, 2_000);
        assert!(again.success);
        assert_eq!(first.lock_id, again.lock_id);
        assert_eq!(again.expires_at, Some(62_000));
    }

    #[test]
    fn test_lock_expiry_frees_resource() {
        let mut coordinator = Coordinator::new(Duration::from_millis(100));
        let resource = ResourceRef::new("doc", "d-1");
        coordinator.acquire(&lock_request("ada", resource.clone()), Uuid::new_v4(), 1_000);

        let taken = coordinator.acquire(&lock_request("bob", resource), Uuid::new_v4(), 1_200);
        assert!(taken.success);
    }

    #[test]
    fn test_section_locks_are_independent() {
        let mut coordinator = Coordinator::new(Duration::from_secs(60));
        let title = ResourceRef::new("doc", "d-1").with_section("title");
        let body = ResourceRef::new("doc", "d-1").with_section("body");
        assert!(coordinator.acquire(&lock_request("ada", title), Uuid::new_v4(), 0).success);
        assert!(coordinator.acquire(&lock_request("bob", body), Uuid::new_v4(), 0).success);
    }

    #[test]
    fn test_release_only_by_holder() {
        let mut coordinator = Coordinator::new(Duration::from_secs(60));
        let resource = ResourceRef::new("task", "t-1");
        coordinator.acquire(&lock_request("ada", resource.clone()), Uuid::new_v4(), 0);

        assert!(!coordinator.release(&lock_request("bob", resource.clone())));
        assert!(coordinator.release(&lock_request("ada", resource.clone())));
        assert!(!coordinator.release(&lock_request("ada", resource)));
    }

    #[test]
    fn test_connection_close_releases_its_locks() {
        let mut coordinator = Coordinator::new(Duration::from_secs(60));
        let conn = Uuid::new_v4();
        let other = Uuid::new_v4();
        coordinator.acquire(&lock_request("ada", ResourceRef::new("task", "1")), conn, 0);
        coordinator.acquire(&lock_request("ada", ResourceRef::new("task", "2")), conn, 0);
        coordinator.acquire(&lock_request("bob", ResourceRef::new("task", "3")), other, 0);

        assert_eq!(coordinator.release_connection(conn).len(), 2);
        assert_eq!(coordinator.lock_count(), 1);
    }

    #[test]
    fn test_submit_versions_advance_by_one() {
        let mut coordinator = Coordinator::new(Duration::from_secs(60));
        let (first, applied) = coordinator.submit(&op(0, json!({"title": "A"})));
        assert_eq!(SubmitOutcome::from(first), SubmitOutcome::Accepted { new_version: Version(1) });
        assert_eq!(applied.unwrap().version, Version(1));

        let (second, _) = coordinator.submit(&op(1, json!({"done": true})));
        assert_eq!(second.new_version, Some(Version(2)));
        let (version, state) = coordinator.resource("task", "t-1").unwrap();
        assert_eq!(version, Version(2));
        assert_eq!(state, &json!({"title": "A", "done": true}));
    }

    #[test]
    fn test_submit_stale_version_conflicts_without_applying() {
        let mut coordinator = Coordinator::new(Duration::from_secs(60));
        coordinator.submit(&op(0, json!({"title": "A"})));

        let (stale, applied) = coordinator.submit(&op(0, json!({"title": "B"})));
        assert!(applied.is_none());
        match SubmitOutcome::from(stale) {
            SubmitOutcome::Conflict {
                current_version,
                server_state,
            } => {
                assert_eq!(current_version, Some(Version(1)));
                assert_eq!(server_state, Some(json!({"title": "A"})));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(coordinator.resource("task", "t-1").unwrap().0, Version(1));
    }

    #[test]
    fn test_submit_non_object_replaces_state() {
        let mut coordinator = Coordinator::new(Duration::from_secs(60));
        coordinator.submit(&op(0, json!({"title": "A"})));
        coordinator.submit(&op(1, json!("plain text")));
        assert_eq!(coordinator.resource("task", "t-1").unwrap().1, &json!("plain text"));
    }
}
