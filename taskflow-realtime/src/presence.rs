//! Presence and typing awareness.
//!
//! ## Architecture
//!
//! ```text
//! update_presence() / update_typing_status()
//!       │  (typing deduplicated per resource)
//!       ▼
//! Connection::try_send()   ── queue full → dropped, Ok(false)
//!       │
//!       ▼   (relay fans out to every `presence` / `typing` subscriber)
//! Remote PresenceRoster::handle_message()
//!       │  (last write wins by sender timestamp)
//!       ▼
//! online() / typing_in()
//! ```
//!
//! Both signals are best effort: they are never queued behind a full
//! outbound buffer and never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::RealtimeError;
use crate::protocol::{
    channels, now_millis, Frame, PresenceStatus, PresenceUpdate, TypingUpdate, UserRef,
};
use crate::registry::ChannelMessage;
use crate::transport::{Connection, ConnectionState};

// ───────────────────────────────────────────────────────────────────
// Outgoing
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct SentTyping {
    is_typing: bool,
    at: Instant,
}

/// Publishes the local user's presence and typing state.
pub struct PresenceBroadcaster {
    connection: Arc<Connection>,
    user: UserRef,
    /// A repeated `is_typing: true` inside this window is suppressed.
    typing_refresh: Duration,
    typing: Mutex<HashMap<(String, String), SentTyping>>,
    /// Last connection state the typing map was valid for.
    seen_state: Mutex<watch::Receiver<ConnectionState>>,
}

impl PresenceBroadcaster {
    pub fn new(connection: Arc<Connection>, user: UserRef, typing_refresh: Duration) -> Self {
        let seen_state = Mutex::new(connection.state_receiver());
        Self {
            connection,
            user,
            typing_refresh,
            typing: Mutex::new(HashMap::new()),
            seen_state,
        }
    }

    fn typing(&self) -> MutexGuard<'_, HashMap<(String, String), SentTyping>> {
        self.typing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget what was sent. The next typing signal for any resource goes
    /// out regardless of what preceded it.
    pub fn reset_typing(&self) {
        self.typing().clear();
    }

    /// Clears the typing map if the connection changed state since the last call.
    fn sync_with_link(&self) {
        let mut seen = self.seen_state.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.has_changed().unwrap_or(true) {
            seen.borrow_and_update();
            self.reset_typing();
        }
    }

    /// Announce the local user's status and, optionally, what they are looking at.
    ///
    /// `Ok(false)` means the outbound queue was full and the update was dropped.
    pub fn update_presence(
        &self,
        status: PresenceStatus,
        current_view: Option<&str>,
    ) -> Result<bool, RealtimeError> {
        let update = PresenceUpdate {
            user: self.user.clone(),
            status,
            current_view: current_view.map(str::to_string),
            timestamp: now_millis(),
        };
        let frame = Frame::publish(channels::PRESENCE, None, serde_json::to_value(&update)?);
        let sent = self.connection.try_send(&frame)?;
        if !sent {
            log::trace!("Presence update dropped: outbound queue full");
        }
        Ok(sent)
    }

    /// Signal that the local user started or stopped typing in a resource.
    ///
    /// Repeats of the last sent state are suppressed, except that "still
    /// typing" is re-sent once the refresh window has elapsed so receivers
    /// can expire stale indicators.
    pub fn update_typing_status(
        &self,
        is_typing: bool,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<bool, RealtimeError> {
        if !self.connection.state().is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        self.sync_with_link();

        let key = (resource_type.to_string(), resource_id.to_string());
        let now = Instant::now();
        if let Some(last) = self.typing().get(&key) {
            let fresh = now.duration_since(last.at) < self.typing_refresh;
            if last.is_typing == is_typing && (!is_typing || fresh) {
                return Ok(true);
            }
        }

        let update = TypingUpdate {
            user: self.user.clone(),
            resource_type: resource_type.to_string(),
            is_typing,
            timestamp: now_millis(),
        };
        let frame = Frame::publish(
            channels::TYPING,
            Some(resource_id.to_string()),
            serde_json::to_value(&update)?,
        );
        let sent = self.connection.try_send(&frame)?;
        if sent {
            self.typing().insert(key, SentTyping { is_typing, at: now });
        } else {
            log::trace!("Typing update for {resource_type}/{resource_id} dropped");
        }
        Ok(sent)
    }
}

// ───────────────────────────────────────────────────────────────────
// Incoming
// ───────────────────────────────────────────────────────────────────

/// Last known presence of a remote user.
#[derive(Debug, Clone)]
pub struct RemotePresence {
    pub user: UserRef,
    pub status: PresenceStatus,
    pub current_view: Option<String>,
    /// Sender timestamp of the update currently held.
    pub timestamp: u64,
    last_seen: Instant,
}

impl RemotePresence {
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

#[derive(Debug, Clone)]
struct Typist {
    user: UserRef,
    timestamp: u64,
    seen: Instant,
}

/// Aggregated view of who is online and who is typing where.
///
/// Fed from `presence` and `typing` channel messages. Updates older than the
/// one already held for a user are ignored.
pub struct PresenceRoster {
    local_user_id: String,
    peers: HashMap<String, RemotePresence>,
    typing: HashMap<(String, String), HashMap<String, Typist>>,
    idle_timeout: Duration,
    typing_timeout: Duration,
}

impl PresenceRoster {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
            typing: HashMap::new(),
            idle_timeout: Duration::from_secs(60),
            typing_timeout: Duration::from_secs(6),
        }
    }

    /// Custom expiry windows (for testing).
    pub fn with_timeouts(
        local_user_id: impl Into<String>,
        idle_timeout: Duration,
        typing_timeout: Duration,
    ) -> Self {
        let mut roster = Self::new(local_user_id);
        roster.idle_timeout = idle_timeout;
        roster.typing_timeout = typing_timeout;
        roster
    }

    /// Apply a routed message. Returns whether it changed the roster.
    pub fn handle_message(&mut self, msg: &ChannelMessage) -> bool {
        match msg.channel.as_str() {
            channels::PRESENCE => match serde_json::from_value::<PresenceUpdate>(msg.data.clone()) {
                Ok(update) => self.apply_presence(update),
                Err(e) => {
                    log::debug!("Ignoring malformed presence update: {e}");
                    false
                }
            },
            channels::TYPING => {
                let Some(resource_id) = msg.resource_id.clone() else {
                    return false;
                };
                match serde_json::from_value::<TypingUpdate>(msg.data.clone()) {
                    Ok(update) => self.apply_typing(resource_id, update),
                    Err(e) => {
                        log::debug!("Ignoring malformed typing update: {e}");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    pub fn apply_presence(&mut self, update: PresenceUpdate) -> bool {
        if update.user.id == self.local_user_id {
            return false;
        }
        if let Some(existing) = self.peers.get(&update.user.id) {
            if existing.timestamp > update.timestamp {
                return false;
            }
        }

        if update.status == PresenceStatus::Offline {
            return self.peers.remove(&update.user.id).is_some();
        }

        self.peers.insert(
            update.user.id.clone(),
            RemotePresence {
                user: update.user,
                status: update.status,
                current_view: update.current_view,
                timestamp: update.timestamp,
                last_seen: Instant::now(),
            },
        );
        true
    }

    pub fn apply_typing(&mut self, resource_id: String, update: TypingUpdate) -> bool {
        if update.user.id == self.local_user_id {
            return false;
        }
        let key = (update.resource_type.clone(), resource_id);
        let typists = self.typing.entry(key.clone()).or_default();
        if let Some(existing) = typists.get(&update.user.id) {
            if existing.timestamp > update.timestamp {
                return false;
            }
        }

        let changed = if update.is_typing {
            typists.insert(
                update.user.id.clone(),
                Typist {
                    user: update.user,
                    timestamp: update.timestamp,
                    seen: Instant::now(),
                },
            );
            true
        } else {
            typists.remove(&update.user.id).is_some()
        };
        if typists.is_empty() {
            self.typing.remove(&key);
        }
        changed
    }

    pub fn peer(&self, user_id: &str) -> Option<&RemotePresence> {
        self.peers.get(user_id)
    }

    /// Remote users with a live presence entry.
    pub fn online(&self) -> Vec<&RemotePresence> {
        self.peers
            .values()
            .filter(|p| !p.is_idle(self.idle_timeout))
            .collect()
    }

    /// Users currently typing in a resource, oldest signal first.
    pub fn typing_in(&self, resource_type: &str, resource_id: &str) -> Vec<UserRef> {
        let key = (resource_type.to_string(), resource_id.to_string());
        let Some(typists) = self.typing.get(&key) else {
            return Vec::new();
        };
        let mut live: Vec<&Typist> = typists
            .values()
            .filter(|t| t.seen.elapsed() <= self.typing_timeout)
            .collect();
        live.sort_by_key(|t| t.timestamp);
        live.into_iter().map(|t| t.user.clone()).collect()
    }

    /// Drop idle peers and expired typing indicators. Returns the removed peer ids.
    pub fn cleanup_idle(&mut self) -> Vec<String> {
        let idle_timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(idle_timeout))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }

        let typing_timeout = self.typing_timeout;
        self.typing.retain(|_, typists| {
            typists.retain(|_, t| t.seen.elapsed() <= typing_timeout);
            !typists.is_empty()
        });

        stale
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::transport::memory::{MemoryConnector, MemoryPeer};
    use serde_json::json;

    fn presence(id: &str, status: PresenceStatus, timestamp: u64) -> PresenceUpdate {
        PresenceUpdate {
            user: UserRef::new(id, id.to_uppercase()),
            status,
            current_view: Some("board".into()),
            timestamp,
        }
    }

    fn typing(id: &str, is_typing: bool, timestamp: u64) -> TypingUpdate {
        TypingUpdate {
            user: UserRef::new(id, id),
            resource_type: "task".into(),
            is_typing,
            timestamp,
        }
    }

    // ─── Roster ───

    #[test]
    fn test_roster_ignores_own_updates() {
        let mut roster = PresenceRoster::new("me");
        assert!(!roster.apply_presence(presence("me", PresenceStatus::Online, 1)));
        assert_eq!(roster.peer_count(), 0);
    }

    #[test]
    fn test_roster_last_write_wins() {
        let mut roster = PresenceRoster::new("me");
        assert!(roster.apply_presence(presence("bob", PresenceStatus::Busy, 20)));
        assert!(!roster.apply_presence(presence("bob", PresenceStatus::Online, 10)));
        assert_eq!(roster.peer("bob").unwrap().status, PresenceStatus::Busy);

        assert!(roster.apply_presence(presence("bob", PresenceStatus::Away, 30)));
        assert_eq!(roster.peer("bob").unwrap().status, PresenceStatus::Away);
    }

    #[test]
    fn test_roster_offline_removes_peer() {
        let mut roster = PresenceRoster::new("me");
        roster.apply_presence(presence("bob", PresenceStatus::Online, 1));
        assert!(roster.apply_presence(presence("bob", PresenceStatus::Offline, 2)));
        assert!(roster.peer("bob").is_none());
        assert!(roster.online().is_empty());
    }

    #[test]
    fn test_roster_handles_channel_messages() {
        let mut roster = PresenceRoster::new("me");
        let msg = ChannelMessage {
            channel: channels::PRESENCE.into(),
            resource_id: None,
            data: serde_json::to_value(presence("eve", PresenceStatus::Online, 5)).unwrap(),
        };
        assert!(roster.handle_message(&msg));
        assert_eq!(roster.online().len(), 1);

        let garbage = ChannelMessage {
            channel: channels::PRESENCE.into(),
            resource_id: None,
            data: json!({"nope": true}),
        };
        assert!(!roster.handle_message(&garbage));

        let typing_msg = ChannelMessage {
            channel: channels::TYPING.into(),
            resource_id: Some("t-1".into()),
            data: serde_json::to_value(typing("eve", true, 6)).unwrap(),
        };
        assert!(roster.handle_message(&typing_msg));
        assert_eq!(roster.typing_in("task", "t-1"), vec![UserRef::new("eve", "eve")]);
    }

    #[test]
    fn test_roster_typing_start_stop() {
        let mut roster = PresenceRoster::new("me");
        roster.apply_typing("t-1".into(), typing("a", true, 1));
        roster.apply_typing("t-1".into(), typing("b", true, 2));
        let names: Vec<String> = roster
            .typing_in("task", "t-1")
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(roster.apply_typing("t-1".into(), typing("a", false, 3)));
        assert_eq!(roster.typing_in("task", "t-1").len(), 1);
        // Stale "started" after "stopped" is ignored.
        assert!(!roster.apply_typing("t-1".into(), typing("b", true, 1)));
        assert!(roster.typing_in("task", "t-2").is_empty());
    }

    #[test]
    fn test_roster_cleanup_expires_entries() {
        let mut roster =
            PresenceRoster::with_timeouts("me", Duration::from_millis(1), Duration::from_millis(1));
        roster.apply_presence(presence("bob", PresenceStatus::Online, 1));
        roster.apply_typing("t-1".into(), typing("bob", true, 1));
        std::thread::sleep(Duration::from_millis(10));

        assert!(roster.online().is_empty());
        assert!(roster.typing_in("task", "t-1").is_empty());
        let removed = roster.cleanup_idle();
        assert_eq!(removed, vec!["bob".to_string()]);
        assert_eq!(roster.peer_count(), 0);
    }

    // ─── Broadcaster ───

    async fn connected(
        refresh: Duration,
        buffer: usize,
    ) -> (PresenceBroadcaster, MemoryPeer, Arc<Connection>) {
        let (connector, mut accept) = MemoryConnector::new(buffer);
        let (connection, mut events) =
            Connection::new("mem://", connector, BackoffPolicy::default(), 16);
        tokio::spawn(async move { while events.recv().await.is_some() {} });
        let connection = Arc::new(connection);
        connection.connect().await.unwrap();
        let peer = accept.recv().await.unwrap();
        (
            PresenceBroadcaster::new(connection.clone(), UserRef::new("me", "Me"), refresh),
            peer,
            connection,
        )
    }

    #[tokio::test]
    async fn test_presence_publishes_frame() {
        let (broadcaster, mut peer, _conn) = connected(Duration::from_secs(3), 16).await;
        assert!(broadcaster
            .update_presence(PresenceStatus::Away, Some("task/t-1"))
            .unwrap());

        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame.channel, channels::PRESENCE);
        let update: PresenceUpdate = frame.payload().unwrap();
        assert_eq!(update.status, PresenceStatus::Away);
        assert_eq!(update.current_view.as_deref(), Some("task/t-1"));
        assert_eq!(update.user.id, "me");
    }

    #[tokio::test]
    async fn test_typing_deduplicated_within_refresh_window() {
        let (broadcaster, mut peer, _conn) = connected(Duration::from_secs(60), 16).await;

        assert!(broadcaster.update_typing_status(true, "task", "t-1").unwrap());
        assert!(broadcaster.update_typing_status(true, "task", "t-1").unwrap());
        assert!(broadcaster.update_typing_status(true, "task", "t-2").unwrap());
        assert!(broadcaster.update_typing_status(false, "task", "t-1").unwrap());
        // Already stopped: suppressed.
        assert!(broadcaster.update_typing_status(false, "task", "t-1").unwrap());

        let mut seen = Vec::new();
        while let Some(frame) = peer.try_recv_frame() {
            let update: TypingUpdate = frame.payload().unwrap();
            seen.push((frame.resource_id.unwrap(), update.is_typing));
        }
        assert_eq!(
            seen,
            vec![
                ("t-1".to_string(), true),
                ("t-2".to_string(), true),
                ("t-1".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_typing_refreshed_after_window() {
        let (broadcaster, mut peer, _conn) = connected(Duration::from_millis(20), 16).await;
        assert!(broadcaster.update_typing_status(true, "doc", "d-1").unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(broadcaster.update_typing_status(true, "doc", "d-1").unwrap());

        assert!(peer.try_recv_frame().is_some());
        assert!(peer.try_recv_frame().is_some());
        assert!(peer.try_recv_frame().is_none());
    }

    #[tokio::test]
    async fn test_typing_resent_after_reconnect() {
        let (connector, mut accept) = MemoryConnector::new(16);
        let (connection, mut events) =
            Connection::new("mem://", connector, BackoffPolicy::default(), 16);
        tokio::spawn(async move { while events.recv().await.is_some() {} });
        let connection = Arc::new(connection);
        let broadcaster =
            PresenceBroadcaster::new(connection.clone(), UserRef::new("me", "Me"), Duration::from_secs(60));

        connection.connect().await.unwrap();
        let mut first = accept.recv().await.unwrap();
        assert!(broadcaster.update_typing_status(true, "task", "t-1").unwrap());
        assert!(broadcaster.update_typing_status(false, "task", "t-2").unwrap());
        assert!(first.try_recv_frame().is_some());
        assert!(first.try_recv_frame().is_some());

        connection.disconnect();
        connection.connect().await.unwrap();
        let mut second = accept.recv().await.unwrap();
        // Same states as before, but the new link has not seen them.
        assert!(broadcaster.update_typing_status(true, "task", "t-1").unwrap());
        assert!(broadcaster.update_typing_status(false, "task", "t-2").unwrap());
        assert!(broadcaster.update_typing_status(false, "task", "t-2").unwrap());

        let mut seen = Vec::new();
        while let Some(frame) = second.try_recv_frame() {
            let update: TypingUpdate = frame.payload().unwrap();
            seen.push((frame.resource_id.unwrap(), update.is_typing));
        }
        assert_eq!(
            seen,
            vec![("t-1".to_string(), true), ("t-2".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_reset_typing_forgets_sent_state() {
        let (broadcaster, mut peer, _conn) = connected(Duration::from_secs(60), 16).await;
        assert!(broadcaster.update_typing_status(true, "task", "t-1").unwrap());
        broadcaster.reset_typing();
        assert!(broadcaster.update_typing_status(true, "task", "t-1").unwrap());

        assert!(peer.try_recv_frame().is_some());
        assert!(peer.try_recv_frame().is_some());
        assert!(peer.try_recv_frame().is_none());
    }

    #[tokio::test]
    async fn test_presence_dropped_when_queue_full() {
        let (broadcaster, _peer, _conn) = connected(Duration::from_secs(3), 1).await;
        let mut results = Vec::new();
        for _ in 0..64 {
            results.push(broadcaster.update_presence(PresenceStatus::Online, None).unwrap());
        }
        assert!(results.contains(&false));
    }

    #[tokio::test]
    async fn test_presence_requires_connection() {
        let (broadcaster, _peer, conn) = connected(Duration::from_secs(3), 16).await;
        conn.disconnect();
        assert_eq!(
            broadcaster.update_presence(PresenceStatus::Online, None).unwrap_err(),
            RealtimeError::NotConnected
        );
        assert_eq!(
            broadcaster.update_typing_status(true, "task", "t-1").unwrap_err(),
            RealtimeError::NotConnected
        );
    }
}
