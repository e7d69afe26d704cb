//! Connection Manager: the authenticated client-connection table
//! (`spec.md` §4.4).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use sellia_transport_websocket::ControlChannel;

/// An authenticated, live client connection. Owned by the
/// [`ConnectionManager`]; unique by `id`.
pub struct ClientConnection {
    pub id: String,
    pub account_id: String,
    pub channel: ControlChannel,
    last_activity_ms: AtomicI64,
}

impl ClientConnection {
    fn new(id: String, account_id: String, channel: ControlChannel) -> Self {
        Self {
            id,
            account_id,
            channel,
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_activity_ms.load(Ordering::Relaxed)
    }
}

/// The authenticated client-connection table. `spec.md` §4.4: issues ids on
/// register, tracks `last_activity` updated on every inbound message.
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Arc<ClientConnection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, account_id: String, channel: ControlChannel) -> Arc<ClientConnection> {
        let id = Uuid::new_v4().to_string();
        let connection = Arc::new(ClientConnection::new(id.clone(), account_id, channel));
        self.connections.insert(id, connection.clone());
        connection
    }

    pub fn unregister(&self, client_id: &str) {
        self.connections.remove(client_id);
    }

    pub fn lookup(&self, client_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.get(client_id).map(|e| e.value().clone())
    }

    /// Snapshot of all connections, used by the heartbeat sweep.
    pub fn iter(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_channel() -> (ControlChannel, tokio::sync::mpsc::Receiver<sellia_proto::Message>) {
        ControlChannel::for_testing("test")
    }

    #[test]
    fn register_assigns_unique_ids_and_tracks_account() {
        let manager = ConnectionManager::new();
        let (channel_a, _rx_a) = direct_channel();
        let (channel_b, _rx_b) = direct_channel();

        let a = manager.register("acct-a".to_string(), channel_a);
        let b = manager.register("acct-b".to_string(), channel_b);

        assert_ne!(a.id, b.id);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.lookup(&a.id).unwrap().account_id, "acct-a");
    }

    #[test]
    fn unregister_removes_the_connection() {
        let manager = ConnectionManager::new();
        let (channel, _rx) = direct_channel();
        let conn = manager.register("acct".to_string(), channel);

        manager.unregister(&conn.id);
        assert!(manager.lookup(&conn.id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn touch_updates_idle_duration() {
        let manager = ConnectionManager::new();
        let (channel, _rx) = direct_channel();
        let conn = manager.register("acct".to_string(), channel);

        conn.touch();
        assert!(conn.idle_for_ms() < 1000);
    }
}
