use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use kindred_types::events::{RelayCommand, RelayEvent};
use kindred_types::models::{MessageLogEntry, RecentConversation};

use crate::api::Backend;
use crate::error::{ClientError, ClientResult, LoadStatus};
use crate::link::RelayLink;
use crate::listeners::{ListenerGuard, ListenerRegistry};
use crate::notifications::NotificationSync;
use crate::route::RouteTracker;

pub const MAX_MESSAGE_CHARS: usize = 200;

/// Reject a body the backend would refuse anyway.
pub fn validate_body(body: &str) -> ClientResult<()> {
    if body.trim().is_empty() {
        return Err(ClientError::Validation("message is empty".into()));
    }
    let len = body.chars().count();
    if len > MAX_MESSAGE_CHARS {
        return Err(ClientError::Validation(format!(
            "message is {len} characters, limit is {MAX_MESSAGE_CHARS}"
        )));
    }
    Ok(())
}

/// A conversation as displayed: entries in order plus the index of the first
/// entry of each day, where a date separator goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    entries: Vec<MessageLogEntry>,
    date_set: BTreeMap<String, usize>,
}

/// Every change to a `MessageLog` goes through `MessageLog::apply`.
#[derive(Debug, Clone)]
pub enum LogUpdate {
    /// Optimistic local append
    Append(MessageLogEntry),
    /// Authoritative log from REST, or a pushed log for display
    Replace(Vec<MessageLogEntry>),
    /// Take back an optimistic entry whose send failed. Anything else in the
    /// log, including messages confirmed since, stays.
    Retract(MessageLogEntry),
}

impl MessageLog {
    pub fn new(entries: Vec<MessageLogEntry>) -> Self {
        let mut log = Self::default();
        log.apply(LogUpdate::Replace(entries));
        log
    }

    pub fn apply(&mut self, update: LogUpdate) {
        match update {
            LogUpdate::Append(entry) => {
                if let Some(day) = entry.date_key() {
                    self.date_set.entry(day).or_insert(self.entries.len());
                }
                self.entries.push(entry);
            }
            LogUpdate::Replace(entries) => {
                self.entries = entries;
                self.reindex();
            }
            LogUpdate::Retract(entry) => {
                if let Some(i) = self.entries.iter().rposition(|e| *e == entry) {
                    self.entries.remove(i);
                    self.reindex();
                }
            }
        }
    }

    pub fn entries(&self) -> &[MessageLogEntry] {
        &self.entries
    }

    pub fn date_set(&self) -> &BTreeMap<String, usize> {
        &self.date_set
    }

    /// Date to print above entry `index`, if it opens a new day.
    pub fn separator_before(&self, index: usize) -> Option<&str> {
        let day = self.entries.get(index)?.date_key()?;
        self.date_set
            .get_key_value(&day)
            .filter(|(_, first)| **first == index)
            .map(|(day, _)| day.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reindex(&mut self) {
        self.date_set.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(day) = entry.date_key() {
                self.date_set.entry(day).or_insert(i);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub peer: String,
    pub log: MessageLog,
    pub load: LoadStatus,
    pub sending: bool,
}

/// One open conversation: loads it, sends into it, and takes pushed updates
/// from the peer.
pub struct MessageThread<B> {
    backend: Arc<B>,
    link: Arc<dyn RelayLink>,
    viewer: String,
    view: Arc<watch::Sender<ThreadView>>,
}

impl<B> Clone for MessageThread<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            link: self.link.clone(),
            viewer: self.viewer.clone(),
            view: self.view.clone(),
        }
    }
}

impl<B: Backend> MessageThread<B> {
    pub fn new(backend: Arc<B>, link: Arc<dyn RelayLink>, viewer: &str, peer: &str) -> Self {
        let (view, _) = watch::channel(ThreadView {
            peer: peer.to_string(),
            log: MessageLog::default(),
            load: LoadStatus::loading(),
            sending: false,
        });
        Self {
            backend,
            link,
            viewer: viewer.to_string(),
            view: Arc::new(view),
        }
    }

    pub fn view(&self) -> ThreadView {
        self.view.borrow().clone()
    }

    pub fn log(&self) -> MessageLog {
        self.view.borrow().log.clone()
    }

    pub fn watch(&self) -> watch::Receiver<ThreadView> {
        self.view.subscribe()
    }

    pub fn peer(&self) -> String {
        self.view.borrow().peer.clone()
    }

    pub async fn load(&self) -> ClientResult<()> {
        let result = self.backend.messages(&self.peer()).await;
        self.view.send_modify(|v| {
            if let Ok(entries) = &result {
                v.log.apply(LogUpdate::Replace(entries.clone()));
            }
            v.load = LoadStatus::settled(&result);
        });
        result.map(drop)
    }

    /// Send `body` to the peer.
    ///
    /// The entry shows up at once; once REST has it the log is replaced with
    /// the backend's copy and the relay is told to refresh the peer's counter
    /// and thread and the viewer's own conversation list. If REST refuses it
    /// only that entry is taken back and nothing is emitted.
    pub async fn send(&self, body: &str) -> ClientResult<()> {
        if let Err(e) = validate_body(body) {
            self.view.send_modify(|v| v.load.error = Some(e.clone()));
            return Err(e);
        }
        let peer = self.peer();

        let pending = MessageLogEntry::new(self.viewer.clone(), body, Utc::now());
        self.view.send_modify(|v| {
            v.log.apply(LogUpdate::Append(pending.clone()));
            v.sending = true;
        });

        match self.backend.post_message(&peer, body).await {
            Ok(log) => {
                debug!("{} -> {}: message stored, {} entries", self.viewer, peer, log.len());
                self.view.send_modify(|v| {
                    v.log.apply(LogUpdate::Replace(log.clone()));
                    v.load = LoadStatus::settled::<()>(&Ok(()));
                    v.sending = false;
                });
                self.link.emit(RelayCommand::UpdateNotificationCounter {
                    username: peer.clone(),
                });
                self.link.emit(RelayCommand::SenderMessage {
                    log,
                    username: peer,
                });
                self.link.emit(RelayCommand::ReceiveUpdateProfileRequest {
                    username: self.viewer.clone(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("sending to {} failed, retracting it: {}", peer, e);
                self.view.send_modify(|v| {
                    v.log.apply(LogUpdate::Retract(pending));
                    v.load.error = Some(e.clone());
                    v.sending = false;
                });
                Err(e)
            }
        }
    }

    /// Handle a log pushed by the peer: show it, then re-read the thread from
    /// REST. If the viewer is reading this thread right now, the unread count
    /// is cleared too.
    pub async fn receive(
        &self,
        pushed: Vec<MessageLogEntry>,
        routes: &RouteTracker,
        counter: &NotificationSync<B>,
    ) -> ClientResult<()> {
        self.view
            .send_modify(|v| v.log.apply(LogUpdate::Replace(pushed)));
        let loaded = self.load().await;
        if routes.current().is_thread_with(&self.peer()) {
            counter.clear().await;
        }
        loaded
    }

    pub fn subscribe(
        &self,
        listeners: &ListenerRegistry,
        routes: &RouteTracker,
        counter: &NotificationSync<B>,
    ) -> ListenerGuard {
        let thread = self.clone();
        let routes = routes.clone();
        let counter = counter.clone();
        listeners.on("recipient-message", move |event| {
            let RelayEvent::RecipientMessage { log, from_username } = event else {
                return;
            };
            if *from_username != thread.peer() {
                debug!("message from {} outside the open thread", from_username);
                return;
            }
            let thread = thread.clone();
            let routes = routes.clone();
            let counter = counter.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let _ = thread.receive(log, &routes, &counter).await;
            });
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationsView {
    pub conversations: Vec<RecentConversation>,
    pub load: LoadStatus,
}

/// The viewer's recent-conversations list.
pub struct RecentConversations<B> {
    backend: Arc<B>,
    view: Arc<watch::Sender<ConversationsView>>,
}

impl<B> Clone for RecentConversations<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            view: self.view.clone(),
        }
    }
}

impl<B: Backend> RecentConversations<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let (view, _) = watch::channel(ConversationsView {
            conversations: Vec::new(),
            load: LoadStatus::loading(),
        });
        Self {
            backend,
            view: Arc::new(view),
        }
    }

    pub fn view(&self) -> ConversationsView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConversationsView> {
        self.view.subscribe()
    }

    pub async fn refresh(&self) -> ClientResult<()> {
        let result = self.backend.recent_conversations().await;
        self.view.send_modify(|v| {
            if let Ok(rows) = &result {
                v.conversations = rows.clone();
            }
            v.load = LoadStatus::settled(&result);
        });
        result.map(drop)
    }

    pub fn subscribe(&self, listeners: &ListenerRegistry) -> ListenerGuard {
        let list = self.clone();
        listeners.on("receive-update-profile-request", move |_| {
            info!("recent conversations changed elsewhere, reloading");
            let list = list.clone();
            tokio::spawn(async move {
                let _ = list.refresh().await;
            });
        })
    }
}
