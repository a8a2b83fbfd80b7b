//! In-memory stand-ins for the REST backend and the relay link.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use tokio::sync::oneshot;

use kindred_types::api::ChatRequestDecision;
use kindred_types::events::RelayCommand;
use kindred_types::models::{
    ChatRequestStatus, ChatRequestSummary, MessageLogEntry, RecentConversation,
};

use crate::api::Backend;
use crate::error::{ClientError, ClientResult};
use crate::link::RelayLink;

/// Durable state shared by every fake session, standing in for the database
/// behind the REST API.
#[derive(Default)]
pub(crate) struct FakeStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    counters: HashMap<String, u32>,
    /// (requestor, requestee) -> approved
    requests: HashMap<(String, String), bool>,
    /// (from, to, entry) in insertion order
    messages: Vec<(String, String, MessageLogEntry)>,
    fail_next: HashMap<&'static str, ClientError>,
    count_gates: VecDeque<oneshot::Receiver<u32>>,
    post_gates: VecDeque<oneshot::Receiver<ClientResult<()>>>,
    calls: Vec<String>,
    clock: i64,
}

impl FakeStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn session(self: &Arc<Self>, viewer: &str) -> Arc<FakeBackend> {
        Arc::new(FakeBackend {
            viewer: viewer.to_string(),
            store: self.clone(),
        })
    }

    pub(crate) fn set_counter(&self, username: &str, value: u32) {
        self.lock().counters.insert(username.to_string(), value);
    }

    pub(crate) fn counter(&self, username: &str) -> u32 {
        self.lock().counters.get(username).copied().unwrap_or(0)
    }

    pub(crate) fn insert_request(&self, requestor: &str, requestee: &str, approved: bool) {
        self.lock()
            .requests
            .insert((requestor.to_string(), requestee.to_string()), approved);
    }

    pub(crate) fn request(&self, requestor: &str, requestee: &str) -> Option<bool> {
        self.lock()
            .requests
            .get(&(requestor.to_string(), requestee.to_string()))
            .copied()
    }

    /// Make the next call of `op` (a `Backend` method name) fail with `err`.
    pub(crate) fn fail_next(&self, op: &'static str, err: ClientError) {
        self.lock().fail_next.insert(op, err);
    }

    /// Hold the next `notification_count` response until the returned sender
    /// fires; the value sent is what the call resolves to.
    pub(crate) fn gate_count(&self) -> oneshot::Sender<u32> {
        let (tx, rx) = oneshot::channel();
        self.lock().count_gates.push_back(rx);
        tx
    }

    /// Hold the next `post_message` until the returned sender fires. `Ok`
    /// stores the message, `Err` fails the call without storing anything.
    pub(crate) fn gate_post(&self) -> oneshot::Sender<ClientResult<()>> {
        let (tx, rx) = oneshot::channel();
        self.lock().post_gates.push_back(rx);
        tx
    }

    /// Operation names in call order, as `op:viewer`.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub(crate) fn calls_of(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("fake store lock poisoned")
    }
}

impl StoreState {
    fn enter(&mut self, op: &'static str, viewer: &str) -> ClientResult<()> {
        self.calls.push(format!("{op}:{viewer}"));
        match self.fail_next.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn conversation(&self, a: &str, b: &str) -> Vec<MessageLogEntry> {
        self.messages
            .iter()
            .filter(|(from, to, _)| (from == a && to == b) || (from == b && to == a))
            .map(|(_, _, entry)| entry.clone())
            .collect()
    }

    fn inbox(&self, viewer: &str) -> Vec<ChatRequestSummary> {
        let mut rows: Vec<_> = self
            .requests
            .iter()
            .filter(|((_, requestee), _)| requestee == viewer)
            .map(|((requestor, _), approved)| ChatRequestSummary {
                username: requestor.clone(),
                first_name: String::new(),
                request_made: String::new(),
                request_accepted: *approved,
                uri: String::new(),
            })
            .collect();
        rows.sort_by(|a, b| a.username.cmp(&b.username));
        rows
    }

    fn pair_key(&self, a: &str, b: &str) -> Option<(String, String)> {
        [(a, b), (b, a)]
            .into_iter()
            .map(|(x, y)| (x.to_string(), y.to_string()))
            .find(|key| self.requests.contains_key(key))
    }
}

/// One viewer's authenticated session against the shared store.
pub(crate) struct FakeBackend {
    viewer: String,
    store: Arc<FakeStore>,
}

impl Backend for FakeBackend {
    async fn notification_count(&self, username: &str) -> ClientResult<u32> {
        let gate = {
            let mut state = self.store.lock();
            state.enter("notification_count", &self.viewer)?;
            match state.count_gates.pop_front() {
                Some(gate) => gate,
                None => return Ok(state.counters.get(username).copied().unwrap_or(0)),
            }
        };
        gate.await
            .map_err(|_| ClientError::Transient("gate dropped".into()))
    }

    async fn clear_notification_count(&self, username: &str) -> ClientResult<u32> {
        let mut state = self.store.lock();
        state.enter("clear_notification_count", &self.viewer)?;
        state.counters.insert(username.to_string(), 0);
        Ok(0)
    }

    async fn chat_request_status(&self, requestee: &str) -> ClientResult<ChatRequestStatus> {
        let mut state = self.store.lock();
        state.enter("chat_request_status", &self.viewer)?;
        let Some(key) = state.pair_key(&self.viewer, requestee) else {
            return Ok(ChatRequestStatus {
                requestee: requestee.to_string(),
                ..Default::default()
            });
        };
        Ok(ChatRequestStatus {
            requestee: requestee.to_string(),
            is_requestor: key.0 == self.viewer,
            sent: true,
            approved: state.requests[&key],
            ..Default::default()
        })
    }

    async fn make_chat_request(&self, requestee: &str) -> ClientResult<()> {
        let mut state = self.store.lock();
        state.enter("make_chat_request", &self.viewer)?;
        if state.pair_key(&self.viewer, requestee).is_some() {
            return Err(ClientError::StateConflict("request already exists".into()));
        }
        state
            .requests
            .insert((self.viewer.clone(), requestee.to_string()), false);
        Ok(())
    }

    async fn delete_chat_request(&self, requestee: &str) -> ClientResult<()> {
        let mut state = self.store.lock();
        state.enter("delete_chat_request", &self.viewer)?;
        if let Some(key) = state.pair_key(&self.viewer, requestee) {
            state.requests.remove(&key);
        }
        Ok(())
    }

    async fn respond_chat_request(
        &self,
        requestor: &str,
        decision: ChatRequestDecision,
    ) -> ClientResult<Vec<ChatRequestSummary>> {
        let mut state = self.store.lock();
        state.enter("respond_chat_request", &self.viewer)?;
        let key = (requestor.to_string(), self.viewer.clone());
        match state.requests.get(&key).copied() {
            Some(false) => {}
            _ => return Err(ClientError::StateConflict("no pending request".into())),
        }
        match decision {
            ChatRequestDecision::Approve => {
                state.requests.insert(key, true);
            }
            ChatRequestDecision::Deny => {
                state.requests.remove(&key);
            }
        }
        Ok(state.inbox(&self.viewer))
    }

    async fn chat_requests(&self) -> ClientResult<Vec<ChatRequestSummary>> {
        let mut state = self.store.lock();
        state.enter("chat_requests", &self.viewer)?;
        Ok(state.inbox(&self.viewer))
    }

    async fn chat_request_count(&self) -> ClientResult<u32> {
        let mut state = self.store.lock();
        state.enter("chat_request_count", &self.viewer)?;
        let pending = state
            .inbox(&self.viewer)
            .iter()
            .filter(|r| !r.request_accepted)
            .count();
        Ok(pending as u32)
    }

    async fn post_message(&self, recipient: &str, body: &str) -> ClientResult<Vec<MessageLogEntry>> {
        let gate = {
            let mut state = self.store.lock();
            state.enter("post_message", &self.viewer)?;
            state.post_gates.pop_front()
        };
        if let Some(gate) = gate {
            gate.await
                .map_err(|_| ClientError::Transient("gate dropped".into()))??;
        }
        let mut state = self.store.lock();
        state.clock += 1;
        let sent_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(state.clock);
        state.messages.push((
            self.viewer.clone(),
            recipient.to_string(),
            MessageLogEntry::new(self.viewer.clone(), body, sent_at),
        ));
        *state.counters.entry(recipient.to_string()).or_default() += 1;
        Ok(state.conversation(&self.viewer, recipient))
    }

    async fn messages(&self, counterpart: &str) -> ClientResult<Vec<MessageLogEntry>> {
        let mut state = self.store.lock();
        state.enter("messages", &self.viewer)?;
        Ok(state.conversation(&self.viewer, counterpart))
    }

    async fn recent_conversations(&self) -> ClientResult<Vec<RecentConversation>> {
        let mut state = self.store.lock();
        state.enter("recent_conversations", &self.viewer)?;
        let mut rows: Vec<RecentConversation> = Vec::new();
        for (from, to, entry) in state.messages.iter().rev() {
            let other = if *from == self.viewer {
                to
            } else if *to == self.viewer {
                from
            } else {
                continue;
            };
            if rows.iter().any(|r| r.username == *other) {
                continue;
            }
            rows.push(RecentConversation {
                username: other.clone(),
                message: entry.body.clone(),
                sent_time: entry.date_key().unwrap_or_default(),
                first_name: String::new(),
                uri: String::new(),
            });
        }
        Ok(rows)
    }
}

/// Relay link that records every emit instead of sending it.
pub(crate) struct RecordingLink {
    sent: Mutex<Vec<RelayCommand>>,
    active: Mutex<bool>,
}

impl RecordingLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            active: Mutex::new(true),
        })
    }

    pub(crate) fn set_active(&self, active: bool) {
        *self.active.lock().expect("link lock poisoned") = active;
    }

    pub(crate) fn sent(&self) -> Vec<RelayCommand> {
        self.sent.lock().expect("link lock poisoned").clone()
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.sent().iter().map(RelayCommand::name).collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().expect("link lock poisoned").clear();
    }
}

impl RelayLink for RecordingLink {
    fn emit(&self, command: RelayCommand) {
        if self.is_active() {
            self.sent.lock().expect("link lock poisoned").push(command);
        }
    }

    fn is_active(&self) -> bool {
        *self.active.lock().expect("link lock poisoned")
    }
}
