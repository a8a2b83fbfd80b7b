use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kindred_types::events::RelayEvent;

use crate::api::Backend;
use crate::error::ClientError;
use crate::listeners::{ListenerGuard, ListenerRegistry};
use crate::route::{RouteContext, RouteTracker};

/// Unread-message counter as the view renders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Loading,
    Idle(u32),
    Error,
    /// The session is signed out; render nothing rather than an error badge
    Unauthenticated,
}

impl CounterState {
    pub fn count(&self) -> Option<u32> {
        match self {
            Self::Idle(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationState {
    pub owner: Option<String>,
    pub counter: CounterState,
    /// Error of the most recent call, including a failed clear that left the
    /// counter untouched
    pub last_error: Option<ClientError>,
    epoch: u64,
    /// What the viewer's current route calls for on (re)mount
    route_action: CounterAction,
}

impl NotificationState {
    pub fn pending(&self) -> bool {
        self.counter == CounterState::Loading
    }

    pub fn error(&self) -> bool {
        self.counter == CounterState::Error
    }
}

/// What to do about a counter that may be stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterAction {
    /// Re-read the authoritative count
    Fetch,
    /// The viewer is looking at their conversations: zero the count instead
    Clear,
}

/// Pick the action for an invalidation, given where the viewer is right now.
pub fn decide(route: &RouteContext) -> CounterAction {
    match route {
        RouteContext::RecentMessages => CounterAction::Clear,
        _ => CounterAction::Fetch,
    }
}

/// Keeps the viewer's unread counter in step with REST.
///
/// The count is only ever replaced with a value the backend returned, never
/// adjusted locally, so overlapping refreshes converge on whichever response
/// lands last. Responses that land after `unmount` or after the owner changed
/// are dropped.
pub struct NotificationSync<B> {
    backend: Arc<B>,
    state: Arc<watch::Sender<NotificationState>>,
}

impl<B> Clone for NotificationSync<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            state: self.state.clone(),
        }
    }
}

impl<B: Backend> NotificationSync<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let (state, _) = watch::channel(NotificationState {
            owner: None,
            counter: CounterState::Loading,
            last_error: None,
            epoch: 0,
            route_action: CounterAction::Fetch,
        });
        Self {
            backend,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> NotificationState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<NotificationState> {
        self.state.subscribe()
    }

    /// Start tracking `owner`'s counter. Also used when the signed-in
    /// identity changes; anything in flight for the previous owner is
    /// discarded when it resolves.
    ///
    /// Mounting on the recent-messages route clears instead of fetching.
    pub async fn mount(&self, owner: &str) -> CounterState {
        let mut action = CounterAction::Fetch;
        self.state.send_modify(|s| {
            s.owner = Some(owner.to_string());
            s.counter = CounterState::Loading;
            s.last_error = None;
            s.epoch += 1;
            action = s.route_action;
        });
        let counter = self.run(action).await;
        if counter == CounterState::Loading && action == CounterAction::Clear {
            return self.fetch().await;
        }
        counter
    }

    pub fn unmount(&self) {
        self.state.send_modify(|s| {
            s.owner = None;
            s.counter = CounterState::Loading;
            s.epoch += 1;
        });
    }

    pub async fn fetch(&self) -> CounterState {
        let Some((owner, epoch)) = self.begin(true) else {
            return self.state().counter;
        };
        let result = self.backend.notification_count(&owner).await;
        self.apply(epoch, |s| match result {
            Ok(count) => {
                s.counter = CounterState::Idle(count);
                s.last_error = None;
            }
            Err(ClientError::NotAuthenticated) => {
                s.counter = CounterState::Unauthenticated;
                s.last_error = None;
            }
            Err(e) => {
                warn!("notification count for {} failed: {}", owner, e);
                s.counter = CounterState::Error;
                s.last_error = Some(e);
            }
        })
    }

    /// Zero the counter through REST. A failed clear leaves the previous
    /// state as it was.
    pub async fn clear(&self) -> CounterState {
        let Some((owner, epoch)) = self.begin(false) else {
            return self.state().counter;
        };
        let result = self.backend.clear_notification_count(&owner).await;
        self.apply(epoch, |s| match result {
            Ok(count) => {
                s.counter = CounterState::Idle(count);
                s.last_error = None;
            }
            Err(e) => {
                warn!("clearing notifications for {} failed: {}", owner, e);
                s.last_error = Some(e);
            }
        })
    }

    pub async fn run(&self, action: CounterAction) -> CounterState {
        match action {
            CounterAction::Fetch => self.fetch().await,
            CounterAction::Clear => self.clear().await,
        }
    }

    /// React to a relay hint that `target`'s counter changed. Returns the
    /// action taken, or `None` when the hint is for someone else.
    pub async fn handle_invalidation(
        &self,
        target: &str,
        route: &RouteContext,
    ) -> Option<CounterAction> {
        if self.state.borrow().owner.as_deref() != Some(target) {
            debug!("ignoring counter invalidation for {}", target);
            return None;
        }
        let action = decide(route);
        self.run(action).await;
        Some(action)
    }

    /// Listen for counter invalidations and for navigation. Every route the
    /// viewer lands on, the current one included, runs the action `decide`
    /// picks for it. Dropping the subscription stops both.
    pub fn subscribe(
        &self,
        listeners: &ListenerRegistry,
        routes: &RouteTracker,
    ) -> CounterSubscription {
        let sync = self.clone();
        let handler_routes = routes.clone();
        let listener = listeners.on("get-updated-notification-counter", move |event| {
            let RelayEvent::GetUpdatedNotificationCounter { username } = event else {
                return;
            };
            let sync = sync.clone();
            let routes = handler_routes.clone();
            let target = username.clone();
            tokio::spawn(async move {
                let route = routes.current();
                sync.handle_invalidation(&target, &route).await;
            });
        });

        let mut nav = routes.watch();
        let initial = self.follow_route(&nav.borrow_and_update());
        let mounted = self.state.borrow().owner.is_some();

        let sync = self.clone();
        let route_task = tokio::spawn(async move {
            if mounted {
                sync.run(initial).await;
            }
            while nav.changed().await.is_ok() {
                let action = sync.follow_route(&nav.borrow_and_update());
                sync.run(action).await;
            }
        });

        CounterSubscription {
            _listener: listener,
            route_task,
        }
    }

    fn follow_route(&self, route: &RouteContext) -> CounterAction {
        let action = decide(route);
        self.state.send_if_modified(|s| {
            s.route_action = action;
            false
        });
        action
    }

    fn begin(&self, loading: bool) -> Option<(String, u64)> {
        let mut started = None;
        self.state.send_if_modified(|s| {
            let Some(owner) = s.owner.clone() else {
                return false;
            };
            started = Some((owner, s.epoch));
            if loading && s.counter != CounterState::Loading {
                s.counter = CounterState::Loading;
                return true;
            }
            false
        });
        started
    }

    fn apply(&self, epoch: u64, update: impl FnOnce(&mut NotificationState)) -> CounterState {
        self.state.send_if_modified(|s| {
            if s.epoch != epoch {
                debug!("discarding counter response from a previous mount");
                return false;
            }
            update(s);
            true
        });
        self.state().counter
    }
}

/// Live counter subscription; unsubscribes on drop.
pub struct CounterSubscription {
    _listener: ListenerGuard,
    route_task: JoinHandle<()>,
}

impl Drop for CounterSubscription {
    fn drop(&mut self) {
        self.route_task.abort();
    }
}
