use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use kindred_types::events::{RelayCommand, RelayEvent};

use crate::link::RelayLink;
use crate::listeners::{ListenerGuard, ListenerRegistry};

/// Last typing signal seen from the peer of a thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingSignal {
    pub from_username: String,
    pub draft_length: usize,
}

impl TypingSignal {
    pub fn is_typing(&self) -> bool {
        self.draft_length > 0
    }
}

/// Typing indicator for one conversation. Outbound, every draft change is
/// sent as-is; inbound, the peer's latest draft replaces the previous one.
pub struct TypingChannel {
    link: Arc<dyn RelayLink>,
    peer: String,
    signal: Arc<watch::Sender<TypingSignal>>,
}

impl TypingChannel {
    pub fn new(link: Arc<dyn RelayLink>, peer: &str) -> Self {
        let (signal, _) = watch::channel(TypingSignal {
            from_username: peer.to_string(),
            draft_length: 0,
        });
        Self {
            link,
            peer: peer.to_string(),
            signal: Arc::new(signal),
        }
    }

    /// Report the viewer's current draft to the peer.
    pub fn draft_changed(&self, draft: &str) {
        self.link.emit(RelayCommand::UserTypingMsg {
            username: self.peer.clone(),
            message: draft.to_string(),
        });
    }

    pub fn peer_is_typing(&self) -> bool {
        self.signal.borrow().is_typing()
    }

    pub fn signal(&self) -> TypingSignal {
        self.signal.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TypingSignal> {
        self.signal.subscribe()
    }

    pub fn subscribe(&self, listeners: &ListenerRegistry) -> ListenerGuard {
        let signal = self.signal.clone();
        let peer = self.peer.clone();
        listeners.on("user-is-typing-msg", move |event| {
            let RelayEvent::UserIsTypingMsg { username, message } = event else {
                return;
            };
            if *username != peer {
                trace!("typing from {} outside this thread", username);
                return;
            }
            let draft_length = message.chars().count();
            signal.send_if_modified(|s| {
                let changed = s.draft_length != draft_length;
                s.draft_length = draft_length;
                changed
            });
        })
    }
}
