use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use kindred_types::events::{ConnectionId, RelayEvent};

use crate::registry::{Registration, SocketRegistry};

/// Owns every live connection and the identity registry, and routes
/// targeted events to the connections of a username.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Per-connection send channels: conn_id -> sender
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<RelayEvent>>>,

    /// Username <-> connection table. Every mutation happens under this
    /// one write lock, which serializes back-to-back events for a connection.
    registry: RwLock<SocketRegistry>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
                registry: RwLock::new(SocketRegistry::new()),
            }),
        }
    }

    /// Allocate a connection id and its outbound channel.
    pub async fn open_connection(&self) -> (ConnectionId, mpsc::UnboundedReceiver<RelayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Tear down a connection: drop its identity binding and its channel.
    /// Returns the username it was registered under, if any.
    pub async fn close_connection(&self, conn_id: ConnectionId) -> Option<String> {
        let username = self.inner.registry.write().await.remove_by_connection(conn_id);
        self.inner.connections.write().await.remove(&conn_id);
        username
    }

    pub async fn register(&self, username: &str, conn_id: ConnectionId) -> Registration {
        let outcome = self.inner.registry.write().await.register(username, conn_id);
        match &outcome {
            Registration::Added => info!("{} registered on connection {}", username, conn_id),
            Registration::Moved { previous } => info!(
                "connection {} moved from {} to {}",
                conn_id, previous, username
            ),
            Registration::Unchanged | Registration::Ignored => {}
        }
        outcome
    }

    /// Unbind every connection of `username`. Returns how many were unbound.
    pub async fn remove_user(&self, username: &str) -> usize {
        let removed = self.inner.registry.write().await.remove(username);
        if !removed.is_empty() {
            info!("{} deregistered ({} connections)", username, removed.len());
        }
        removed.len()
    }

    pub async fn rename(
        &self,
        old_username: &str,
        new_username: &str,
        conn_id: ConnectionId,
    ) -> Registration {
        let outcome = self
            .inner
            .registry
            .write()
            .await
            .rename(old_username, new_username, conn_id);
        info!("{} renamed to {} on connection {}", old_username, new_username, conn_id);
        outcome
    }

    pub async fn username_of(&self, conn_id: ConnectionId) -> Option<String> {
        self.inner
            .registry
            .read()
            .await
            .username_of(conn_id)
            .map(str::to_string)
    }

    /// Send an event to every live connection of `username` except `except`.
    /// Returns the number of connections it was handed to; zero when the user
    /// has no live session, which is not an error.
    pub async fn send_to_user(
        &self,
        username: &str,
        event: RelayEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let targets = self.inner.registry.read().await.connections_of(username);
        if targets.is_empty() {
            debug!("no live session for {}, dropping {}", username, event.name());
            return 0;
        }

        let connections = self.inner.connections.read().await;
        let mut delivered = 0;
        for conn_id in targets {
            if Some(conn_id) == except {
                continue;
            }
            if let Some(tx) = connections.get(&conn_id) {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!("{} -> {} ({} connections)", event.name(), username, delivered);
        delivered
    }

    /// (live connections, registered usernames)
    pub async fn stats(&self) -> (usize, usize) {
        let connections = self.inner.connections.read().await.len();
        let users = self.inner.registry.read().await.user_count();
        (connections, users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_event(username: &str) -> RelayEvent {
        RelayEvent::GetUpdatedNotificationCounter {
            username: username.to_string(),
        }
    }

    #[tokio::test]
    async fn routes_to_every_tab_except_sender() {
        let dispatcher = Dispatcher::new();
        let (tab1, mut rx1) = dispatcher.open_connection().await;
        let (tab2, mut rx2) = dispatcher.open_connection().await;
        dispatcher.register("ana", tab1).await;
        dispatcher.register("ana", tab2).await;

        let delivered = dispatcher
            .send_to_user("ana", counter_event("ana"), Some(tab1))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(rx2.recv().await, Some(counter_event("ana")));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_user_delivers_nothing() {
        let dispatcher = Dispatcher::new();
        let delivered = dispatcher.send_to_user("ghost", counter_event("ghost"), None).await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn rename_then_route_reaches_new_name() {
        let dispatcher = Dispatcher::new();
        let (conn, mut rx) = dispatcher.open_connection().await;
        dispatcher.register("ana", conn).await;
        dispatcher.rename("ana", "ana_b", conn).await;

        assert_eq!(dispatcher.send_to_user("ana", counter_event("ana"), None).await, 0);
        assert_eq!(
            dispatcher.send_to_user("ana_b", counter_event("ana_b"), None).await,
            1
        );
        assert_eq!(rx.recv().await, Some(counter_event("ana_b")));
    }

    #[tokio::test]
    async fn close_connection_unbinds_identity() {
        let dispatcher = Dispatcher::new();
        let (conn, _rx) = dispatcher.open_connection().await;
        dispatcher.register("ana", conn).await;

        assert_eq!(dispatcher.close_connection(conn).await.as_deref(), Some("ana"));
        assert_eq!(dispatcher.username_of(conn).await, None);
        assert_eq!(dispatcher.stats().await, (0, 0));
    }

    #[tokio::test]
    async fn concurrent_registrations_do_not_corrupt_table() {
        let dispatcher = Dispatcher::new();
        let mut conns = Vec::new();
        for _ in 0..8 {
            conns.push(dispatcher.open_connection().await.0);
        }

        let mut tasks = Vec::new();
        for (i, conn) in conns.iter().copied().enumerate() {
            let d = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..50 {
                    let name = format!("user{}", (i + round) % 3);
                    d.register(&name, conn).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let (connections, _) = dispatcher.stats().await;
        assert_eq!(connections, 8);
        for conn in conns {
            assert!(dispatcher.username_of(conn).await.is_some());
        }
    }
}
