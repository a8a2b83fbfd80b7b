use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use kindred_types::api::ChatRequestDecision;
use kindred_types::events::{RelayCommand, RelayEvent};
use kindred_types::models::{ChatRequestStatus, ChatRequestSummary};

use crate::api::Backend;
use crate::error::{ClientError, ClientResult, LoadStatus};
use crate::link::RelayLink;
use crate::listeners::{ListenerGuard, ListenerRegistry};

const UPDATE_CHAT_REQUEST: &str = "update-chat-request";

/// Consent state between the viewer and one counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChatRequestState {
    #[default]
    None,
    Requested { requestor: String },
    Approved,
}

impl ChatRequestState {
    pub fn from_status(status: &ChatRequestStatus, viewer: &str, counterpart: &str) -> Self {
        match (status.sent, status.approved) {
            (true, true) => Self::Approved,
            (true, false) => Self::Requested {
                requestor: if status.is_requestor { viewer } else { counterpart }.to_string(),
            },
            (false, _) => Self::None,
        }
    }

    pub fn can_message(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequestView {
    pub counterpart: String,
    pub state: ChatRequestState,
    pub load: LoadStatus,
}

/// Chat-request state for the viewer and one counterpart, as shown on the
/// counterpart's profile.
///
/// Nothing here is optimistic: each action waits for REST, then moves the
/// state, then tells the counterpart to re-check. A failed action leaves the
/// state where it was.
pub struct ChatRequestMachine<B> {
    backend: Arc<B>,
    link: Arc<dyn RelayLink>,
    viewer: String,
    view: Arc<watch::Sender<ChatRequestView>>,
}

impl<B> Clone for ChatRequestMachine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            link: self.link.clone(),
            viewer: self.viewer.clone(),
            view: self.view.clone(),
        }
    }
}

impl<B: Backend> ChatRequestMachine<B> {
    pub fn new(backend: Arc<B>, link: Arc<dyn RelayLink>, viewer: &str, counterpart: &str) -> Self {
        let (view, _) = watch::channel(ChatRequestView {
            counterpart: counterpart.to_string(),
            state: ChatRequestState::None,
            load: LoadStatus::loading(),
        });
        Self {
            backend,
            link,
            viewer: viewer.to_string(),
            view: Arc::new(view),
        }
    }

    pub fn view(&self) -> ChatRequestView {
        self.view.borrow().clone()
    }

    pub fn state(&self) -> ChatRequestState {
        self.view.borrow().state.clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChatRequestView> {
        self.view.subscribe()
    }

    pub fn counterpart(&self) -> String {
        self.view.borrow().counterpart.clone()
    }

    /// Path of the message thread, present only once the request is approved.
    pub fn message_link(&self) -> Option<String> {
        let view = self.view.borrow();
        view.state
            .can_message()
            .then(|| format!("/message/{}", view.counterpart))
    }

    /// Re-read the status from REST. Run on route entry and whenever the
    /// counterpart signals a change.
    pub async fn refresh(&self) -> ClientResult<ChatRequestState> {
        let counterpart = self.counterpart();
        let result = self
            .backend
            .chat_request_status(&counterpart)
            .await
            .map(|status| ChatRequestState::from_status(&status, &self.viewer, &counterpart));
        self.view.send_modify(|v| {
            if let Ok(state) = &result {
                v.state = state.clone();
            }
            v.load = LoadStatus::settled(&result);
        });
        result
    }

    /// Send a request to the counterpart.
    pub async fn make(&self) -> ClientResult<ChatRequestState> {
        let counterpart = self.counterpart();
        self.transition(
            |state| *state == ChatRequestState::None,
            self.backend.make_chat_request(&counterpart),
            ChatRequestState::Requested {
                requestor: self.viewer.clone(),
            },
        )
        .await
    }

    /// Rescind a pending request or revoke an approved one. Either party may.
    pub async fn withdraw(&self) -> ClientResult<ChatRequestState> {
        let counterpart = self.counterpart();
        self.transition(
            |state| *state != ChatRequestState::None,
            self.backend.delete_chat_request(&counterpart),
            ChatRequestState::None,
        )
        .await
    }

    pub async fn approve(&self) -> ClientResult<ChatRequestState> {
        self.respond(ChatRequestDecision::Approve, ChatRequestState::Approved)
            .await
    }

    pub async fn deny(&self) -> ClientResult<ChatRequestState> {
        self.respond(ChatRequestDecision::Deny, ChatRequestState::None)
            .await
    }

    /// Re-check whenever the counterpart reports a change.
    pub fn subscribe(&self, listeners: &ListenerRegistry) -> ListenerGuard {
        let machine = self.clone();
        listeners.on_scoped(UPDATE_CHAT_REQUEST, "profile", move |event| {
            let RelayEvent::UpdateChatRequest { from_username } = event else {
                return;
            };
            if *from_username != machine.counterpart() {
                return;
            }
            let machine = machine.clone();
            tokio::spawn(async move {
                let _ = machine.refresh().await;
            });
        })
    }

    async fn respond(
        &self,
        decision: ChatRequestDecision,
        next: ChatRequestState,
    ) -> ClientResult<ChatRequestState> {
        let counterpart = self.counterpart();
        let call = async {
            self.backend
                .respond_chat_request(&counterpart, decision)
                .await
                .map(drop)
        };
        // Only the requestee answers; a requestor cannot approve itself.
        self.transition(
            |state| matches!(state, ChatRequestState::Requested { requestor } if *requestor == counterpart),
            call,
            next,
        )
        .await
    }

    async fn transition(
        &self,
        allowed: impl FnOnce(&ChatRequestState) -> bool,
        call: impl Future<Output = ClientResult<()>>,
        next: ChatRequestState,
    ) -> ClientResult<ChatRequestState> {
        let current = self.state();
        if !allowed(&current) {
            let err = ClientError::StateConflict(format!("not allowed from {current:?}"));
            debug!("chat request action blocked locally, re-reading status");
            let _ = self.refresh().await;
            self.view.send_modify(|v| v.load.error = Some(err.clone()));
            return Err(err);
        }

        self.view.send_modify(|v| v.load = LoadStatus::loading());
        match call.await {
            Ok(()) => {
                let counterpart = self.counterpart();
                info!("chat request {} / {} -> {:?}", self.viewer, counterpart, next);
                self.view.send_modify(|v| {
                    v.state = next.clone();
                    v.load = LoadStatus::settled::<()>(&Ok(()));
                });
                self.link.emit(RelayCommand::ChatRequest {
                    username: counterpart,
                });
                Ok(next)
            }
            Err(ClientError::StateConflict(reason)) => {
                warn!("chat request action rejected: {}", reason);
                let err = ClientError::StateConflict(reason);
                let _ = self.refresh().await;
                self.view.send_modify(|v| v.load.error = Some(err.clone()));
                Err(err)
            }
            Err(e) => {
                warn!("chat request action failed: {}", e);
                let result = Err(e);
                self.view.send_modify(|v| v.load = LoadStatus::settled::<()>(&result));
                result.map(|()| next)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxView {
    pub requests: Vec<ChatRequestSummary>,
    /// Requests awaiting the viewer's answer; drives the nav badge
    pub pending: u32,
    pub load: LoadStatus,
}

/// The viewer's received chat requests and the pending badge count.
pub struct ChatRequestInbox<B> {
    backend: Arc<B>,
    link: Arc<dyn RelayLink>,
    view: Arc<watch::Sender<InboxView>>,
}

impl<B> Clone for ChatRequestInbox<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            link: self.link.clone(),
            view: self.view.clone(),
        }
    }
}

impl<B: Backend> ChatRequestInbox<B> {
    pub fn new(backend: Arc<B>, link: Arc<dyn RelayLink>) -> Self {
        let (view, _) = watch::channel(InboxView {
            requests: Vec::new(),
            pending: 0,
            load: LoadStatus::loading(),
        });
        Self {
            backend,
            link,
            view: Arc::new(view),
        }
    }

    pub fn view(&self) -> InboxView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<InboxView> {
        self.view.subscribe()
    }

    pub async fn refresh(&self) -> ClientResult<()> {
        let result = self.load().await;
        self.view.send_modify(|v| {
            if let Ok((requests, pending)) = &result {
                v.requests = requests.clone();
                v.pending = *pending;
            }
            v.load = LoadStatus::settled(&result);
        });
        result.map(drop)
    }

    pub async fn approve(&self, requestor: &str) -> ClientResult<()> {
        self.respond(requestor, ChatRequestDecision::Approve).await
    }

    pub async fn deny(&self, requestor: &str) -> ClientResult<()> {
        self.respond(requestor, ChatRequestDecision::Deny).await
    }

    pub fn subscribe(&self, listeners: &ListenerRegistry) -> ListenerGuard {
        let inbox = self.clone();
        listeners.on_scoped(UPDATE_CHAT_REQUEST, "inbox", move |event| {
            if let RelayEvent::UpdateChatRequest { from_username } = event {
                debug!("chat requests changed by {}", from_username);
            }
            let inbox = inbox.clone();
            tokio::spawn(async move {
                let _ = inbox.refresh().await;
            });
        })
    }

    async fn load(&self) -> ClientResult<(Vec<ChatRequestSummary>, u32)> {
        let requests = self.backend.chat_requests().await?;
        let pending = self.backend.chat_request_count().await?;
        Ok((requests, pending))
    }

    async fn respond(&self, requestor: &str, decision: ChatRequestDecision) -> ClientResult<()> {
        self.view.send_modify(|v| v.load = LoadStatus::loading());
        let result = self.backend.respond_chat_request(requestor, decision).await;
        let pending = match &result {
            Ok(_) => self.backend.chat_request_count().await.ok(),
            Err(_) => None,
        };
        self.view.send_modify(|v| {
            if let Ok(requests) = &result {
                v.requests = requests.clone();
            }
            if let Some(pending) = pending {
                v.pending = pending;
            }
            v.load = LoadStatus::settled(&result);
        });

        match result {
            Ok(_) => {
                self.link.emit(RelayCommand::ChatRequest {
                    username: requestor.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("answering {}'s chat request failed: {}", requestor, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeStore, RecordingLink};

    fn machine(
        store: &Arc<FakeStore>,
        viewer: &str,
        counterpart: &str,
    ) -> (ChatRequestMachine<FakeBackend>, Arc<RecordingLink>) {
        let link = RecordingLink::new();
        let m = ChatRequestMachine::new(store.session(viewer), link.clone(), viewer, counterpart);
        (m, link)
    }

    #[test]
    fn maps_wire_status() {
        let mut status = ChatRequestStatus::default();
        assert_eq!(ChatRequestState::from_status(&status, "ana", "bo"), ChatRequestState::None);

        status.sent = true;
        assert_eq!(
            ChatRequestState::from_status(&status, "ana", "bo"),
            ChatRequestState::Requested { requestor: "bo".into() }
        );
        status.is_requestor = true;
        assert_eq!(
            ChatRequestState::from_status(&status, "ana", "bo"),
            ChatRequestState::Requested { requestor: "ana".into() }
        );
        status.approved = true;
        assert!(ChatRequestState::from_status(&status, "ana", "bo").can_message());
    }

    #[tokio::test]
    async fn request_then_approve_by_requestee() {
        let store = FakeStore::new();
        let (ana, ana_link) = machine(&store, "ana", "bo");
        let (bo, bo_link) = machine(&store, "bo", "ana");

        ana.refresh().await.unwrap();
        assert_eq!(ana.message_link(), None);

        assert_eq!(
            ana.make().await.unwrap(),
            ChatRequestState::Requested { requestor: "ana".into() }
        );
        assert_eq!(
            ana_link.sent(),
            vec![RelayCommand::ChatRequest { username: "bo".into() }]
        );

        bo.refresh().await.unwrap();
        assert_eq!(bo.approve().await.unwrap(), ChatRequestState::Approved);
        assert_eq!(bo.message_link().as_deref(), Some("/message/ana"));
        assert_eq!(bo_link.names(), vec!["chat-request"]);

        ana.refresh().await.unwrap();
        assert!(ana.state().can_message());
    }

    #[tokio::test]
    async fn requestor_cannot_approve_its_own_request() {
        let store = FakeStore::new();
        let (ana, link) = machine(&store, "ana", "bo");
        ana.make().await.unwrap();
        link.clear();

        let err = ana.approve().await.unwrap_err();
        assert!(matches!(err, ClientError::StateConflict(_)));
        assert_eq!(store.calls_of("respond_chat_request"), 0);
        assert_eq!(ana.state(), ChatRequestState::Requested { requestor: "ana".into() });
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn only_requested_is_reachable_from_none() {
        let store = FakeStore::new();
        let (ana, _) = machine(&store, "ana", "bo");
        ana.refresh().await.unwrap();

        assert!(ana.approve().await.is_err());
        assert!(ana.deny().await.is_err());
        assert!(ana.withdraw().await.is_err());
        assert_eq!(ana.state(), ChatRequestState::None);
        assert!(store.calls().iter().all(|c| c.starts_with("chat_request_status:")));
        assert_eq!(store.calls_of("chat_request_status"), 4);
    }

    #[tokio::test]
    async fn stale_local_state_is_resynced_on_blocked_action() {
        let store = FakeStore::new();
        let (ana, _) = machine(&store, "ana", "bo");
        ana.refresh().await.unwrap();
        // bo's request arrived while the relay push was missed
        store.insert_request("bo", "ana", false);

        let err = ana.approve().await.unwrap_err();
        assert!(matches!(err, ClientError::StateConflict(_)));
        assert_eq!(
            ana.state(),
            ChatRequestState::Requested {
                requestor: "bo".into()
            }
        );
        assert_eq!(store.calls_of("chat_request_status"), 2);
        assert_eq!(store.calls_of("respond_chat_request"), 0);

        assert_eq!(ana.approve().await.unwrap(), ChatRequestState::Approved);
    }

    #[tokio::test]
    async fn deny_and_withdraw_return_to_none() {
        let store = FakeStore::new();
        store.insert_request("bo", "ana", false);
        let (ana, _) = machine(&store, "ana", "bo");
        ana.refresh().await.unwrap();
        assert_eq!(ana.deny().await.unwrap(), ChatRequestState::None);
        assert_eq!(store.request("bo", "ana"), None);

        store.insert_request("bo", "ana", true);
        let (bo, _) = machine(&store, "bo", "ana");
        bo.refresh().await.unwrap();
        assert_eq!(bo.withdraw().await.unwrap(), ChatRequestState::None);
        assert!(!bo.state().can_message());
    }

    #[tokio::test]
    async fn failed_call_leaves_state_and_emits_nothing() {
        let store = FakeStore::new();
        let (ana, link) = machine(&store, "ana", "bo");
        ana.refresh().await.unwrap();

        store.fail_next("make_chat_request", ClientError::Transient("503".into()));
        assert!(ana.make().await.is_err());
        assert_eq!(ana.state(), ChatRequestState::None);
        assert!(ana.view().load.shows_error());
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn conflict_resyncs_with_backend() {
        let store = FakeStore::new();
        let (ana, _) = machine(&store, "ana", "bo");
        ana.refresh().await.unwrap();
        // bo asked first, from another session
        store.insert_request("bo", "ana", false);

        let err = ana.make().await.unwrap_err();
        assert!(matches!(err, ClientError::StateConflict(_)));
        assert_eq!(ana.state(), ChatRequestState::Requested { requestor: "bo".into() });
    }

    #[tokio::test]
    async fn counterpart_signal_triggers_refetch() {
        let store = FakeStore::new();
        let (ana, _) = machine(&store, "ana", "bo");
        ana.refresh().await.unwrap();
        let listeners = ListenerRegistry::new();
        let _guard = ana.subscribe(&listeners);
        let mut rx = ana.watch();

        store.insert_request("bo", "ana", false);
        listeners.dispatch(&RelayEvent::UpdateChatRequest {
            from_username: "cy".into(),
        });
        listeners.dispatch(&RelayEvent::UpdateChatRequest {
            from_username: "bo".into(),
        });

        rx.wait_for(|v| matches!(v.state, ChatRequestState::Requested { .. }))
            .await
            .unwrap();
        assert_eq!(store.calls_of("chat_request_status"), 2);
    }

    #[tokio::test]
    async fn inbox_answers_replace_list_and_badge() {
        let store = FakeStore::new();
        store.insert_request("bo", "ana", false);
        store.insert_request("cy", "ana", false);
        let link = RecordingLink::new();
        let inbox = ChatRequestInbox::new(store.session("ana"), link.clone());

        inbox.refresh().await.unwrap();
        assert_eq!(inbox.view().requests.len(), 2);
        assert_eq!(inbox.view().pending, 2);

        inbox.approve("bo").await.unwrap();
        inbox.deny("cy").await.unwrap();

        let view = inbox.view();
        assert_eq!(view.requests.len(), 1);
        assert!(view.requests[0].request_accepted);
        assert_eq!(view.pending, 0);
        assert_eq!(
            link.sent(),
            vec![
                RelayCommand::ChatRequest { username: "bo".into() },
                RelayCommand::ChatRequest { username: "cy".into() },
            ]
        );
    }

    #[tokio::test]
    async fn inbox_and_profile_both_follow_updates() {
        let store = FakeStore::new();
        let (ana, _) = machine(&store, "ana", "bo");
        let inbox = ChatRequestInbox::new(store.session("ana"), RecordingLink::new());
        let listeners = ListenerRegistry::new();
        let _profile = ana.subscribe(&listeners);
        let _inbox = inbox.subscribe(&listeners);

        store.insert_request("bo", "ana", false);
        assert_eq!(
            listeners.dispatch(&RelayEvent::UpdateChatRequest {
                from_username: "bo".into(),
            }),
            2
        );

        inbox.watch().wait_for(|v| v.pending == 1).await.unwrap();
        ana.watch()
            .wait_for(|v| v.state == ChatRequestState::Requested { requestor: "bo".into() })
            .await
            .unwrap();
    }
}
