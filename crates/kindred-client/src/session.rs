use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use kindred_types::events::{ConnectionId, RelayCommand};

use crate::link::RelayLink;

/// Binds the signed-in username to this client's relay connection, so the
/// relay can route other users' events here.
///
/// The username is kept across connection drops; every new connection id the
/// link reports gets the registration again.
pub struct RelaySession {
    link: Arc<dyn RelayLink>,
    connection_id: Mutex<Option<ConnectionId>>,
    username: Mutex<Option<String>>,
}

impl RelaySession {
    /// `connection_id` is the id from the relay's `ready` frame, or `None`
    /// when running without a relay.
    pub fn new(link: Arc<dyn RelayLink>, connection_id: Option<ConnectionId>) -> Self {
        Self {
            link,
            connection_id: Mutex::new(connection_id),
            username: Mutex::new(None),
        }
    }

    pub fn username(&self) -> Option<String> {
        self.username.lock().expect("session lock poisoned").clone()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        *self.connection_id.lock().expect("session lock poisoned")
    }

    /// Register `username` for this connection. Signing in again under the
    /// same name re-sends the registration, which the relay treats as a no-op.
    /// Returns false when there is no live connection; the name is still
    /// registered once one comes up.
    pub fn sign_in(&self, username: &str) -> bool {
        *self.username.lock().expect("session lock poisoned") = Some(username.to_string());
        self.register(username)
    }

    /// Drop every relay registration for the signed-in user.
    pub fn sign_out(&self) -> Option<String> {
        let username = self.username.lock().expect("session lock poisoned").take()?;
        info!("unregistering {}", username);
        self.link.emit(RelayCommand::RemoveUserSocketId {
            username: username.clone(),
        });
        Some(username)
    }

    /// Move the registration after a successful username change.
    pub fn rename(&self, new_username: &str) -> bool {
        let old_username = {
            let mut current = self.username.lock().expect("session lock poisoned");
            match current.replace(new_username.to_string()) {
                Some(old) if old == new_username => return false,
                Some(old) => old,
                None => {
                    drop(current);
                    return self.register(new_username);
                }
            }
        };
        let Some(connection_id) = self.connection_id() else {
            return false;
        };
        info!("renaming {} -> {} on {}", old_username, new_username, connection_id);
        self.link.emit(RelayCommand::UpdateUserSocketId {
            old_username,
            new_username: new_username.to_string(),
            connection_id,
        });
        true
    }

    /// Adopt the link's current connection. A new id re-registers the
    /// signed-in user, since the relay forgot them with the old connection.
    pub fn reconnected(&self, connection_id: Option<ConnectionId>) -> bool {
        *self.connection_id.lock().expect("session lock poisoned") = connection_id;
        match (connection_id, self.username()) {
            (Some(_), Some(username)) => self.register(&username),
            _ => false,
        }
    }

    /// Re-register on every connection id published on `ids`.
    pub fn follow(self: &Arc<Self>, mut ids: watch::Receiver<Option<ConnectionId>>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            while ids.changed().await.is_ok() {
                let connection_id = *ids.borrow_and_update();
                session.reconnected(connection_id);
            }
        })
    }

    fn register(&self, username: &str) -> bool {
        let Some(connection_id) = self.connection_id() else {
            debug!("no relay connection, {} stays REST-only for now", username);
            return false;
        };
        info!("registering {} on {}", username, connection_id);
        self.link.emit(RelayCommand::StoreUserSocketId {
            username: username.to_string(),
            connection_id,
        });
        true
    }
}
