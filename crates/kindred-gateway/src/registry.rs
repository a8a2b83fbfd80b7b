use std::collections::{HashMap, HashSet};

use kindred_types::events::ConnectionId;

/// Outcome of binding a connection to a username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The connection was not registered before
    Added,
    /// The connection was already bound to this username
    Unchanged,
    /// The connection was bound to another username and has been moved
    Moved { previous: String },
    /// Blank usernames are never registered
    Ignored,
}

/// Socket identity table: which live connections belong to which username.
///
/// The primary table is keyed by connection id so a connection can only ever
/// belong to one username; `by_username` is the secondary index used for
/// fan-out. Both are always updated together. This type does no locking of
/// its own; the dispatcher owns it behind a single lock.
#[derive(Debug, Default)]
pub struct SocketRegistry {
    by_connection: HashMap<ConnectionId, String>,
    by_username: HashMap<String, HashSet<ConnectionId>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn_id` to `username`, replacing any previous binding of the
    /// same connection. Idempotent.
    pub fn register(&mut self, username: &str, conn_id: ConnectionId) -> Registration {
        if username.trim().is_empty() {
            return Registration::Ignored;
        }

        let outcome = match self.by_connection.get(&conn_id) {
            Some(current) if current == username => return Registration::Unchanged,
            Some(_) => {
                let previous = self.detach(conn_id).unwrap_or_default();
                Registration::Moved { previous }
            }
            None => Registration::Added,
        };

        self.by_connection.insert(conn_id, username.to_string());
        self.by_username
            .entry(username.to_string())
            .or_default()
            .insert(conn_id);

        outcome
    }

    /// Drop every connection registered under `username`. Returns the
    /// connections that were unbound; empty if the username was unknown.
    pub fn remove(&mut self, username: &str) -> Vec<ConnectionId> {
        let Some(conns) = self.by_username.remove(username) else {
            return Vec::new();
        };
        for conn_id in &conns {
            self.by_connection.remove(conn_id);
        }
        conns.into_iter().collect()
    }

    /// Drop the binding of a single connection. Returns the username it was
    /// registered under, if any.
    pub fn remove_by_connection(&mut self, conn_id: ConnectionId) -> Option<String> {
        self.detach(conn_id)
    }

    /// Move every connection of `old_username` to `new_username`, and bind
    /// `conn_id` there too. The user's other tabs follow the rename.
    ///
    /// Callers hold the registry lock across the whole call, so no routing
    /// lookup can observe the state between the removal and the insert.
    pub fn rename(
        &mut self,
        old_username: &str,
        new_username: &str,
        conn_id: ConnectionId,
    ) -> Registration {
        if new_username.trim().is_empty() {
            return Registration::Ignored;
        }
        for other in self.remove(old_username) {
            if other != conn_id {
                self.register(new_username, other);
            }
        }
        self.register(new_username, conn_id)
    }

    /// Live connections of `username`. Empty means "no live session", which
    /// is never an error for callers.
    pub fn connections_of(&self, username: &str) -> Vec<ConnectionId> {
        self.by_username
            .get(username)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn username_of(&self, conn_id: ConnectionId) -> Option<&str> {
        self.by_connection.get(&conn_id).map(String::as_str)
    }

    pub fn user_count(&self) -> usize {
        self.by_username.len()
    }

    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    fn detach(&mut self, conn_id: ConnectionId) -> Option<String> {
        let username = self.by_connection.remove(&conn_id)?;
        if let Some(conns) = self.by_username.get_mut(&username) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                self.by_username.remove(&username);
            }
        }
        Some(username)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (conn_id, username) in &self.by_connection {
            assert!(
                self.by_username
                    .get(username)
                    .is_some_and(|set| set.contains(conn_id)),
                "{conn_id} missing from index of {username}"
            );
        }
        for (username, conns) in &self.by_username {
            assert!(!conns.is_empty(), "empty index entry for {username}");
            for conn_id in conns {
                assert_eq!(self.by_connection.get(conn_id), Some(username));
            }
        }
    }
}
