use tokio::sync::watch;

pub const RECENT_MESSAGES_PATH: &str = "/profile/recent_messages";

/// Where the viewer currently is, as far as the sync logic cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteContext {
    /// The recent-conversations list; unread messages count as read here
    RecentMessages,
    /// A conversation thread with the named user
    Thread(String),
    /// The named user's profile page
    Profile(String),
    Other(String),
}

impl RouteContext {
    pub fn parse(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let trimmed = path.trim_end_matches('/');

        if trimmed == RECENT_MESSAGES_PATH {
            return Self::RecentMessages;
        }
        if let Some(user) = trimmed.strip_prefix("/message/").filter(|u| valid_segment(u)) {
            return Self::Thread(user.to_string());
        }
        if let Some(user) = trimmed.strip_prefix("/user/").filter(|u| valid_segment(u)) {
            return Self::Profile(user.to_string());
        }
        Self::Other(path.to_string())
    }

    pub fn is_thread_with(&self, username: &str) -> bool {
        matches!(self, Self::Thread(user) if user == username)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('/')
}

/// Shared, always-current route. Relay handlers read it when an event is
/// handled, never capture it when they subscribe.
#[derive(Clone)]
pub struct RouteTracker {
    tx: watch::Sender<RouteContext>,
}

impl RouteTracker {
    pub fn new(initial: RouteContext) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn navigate(&self, path: &str) -> RouteContext {
        let context = RouteContext::parse(path);
        self.tx.send_replace(context.clone());
        context
    }

    pub fn current(&self) -> RouteContext {
        self.tx.borrow().clone()
    }

    /// Receiver that wakes on every navigation.
    pub fn watch(&self) -> watch::Receiver<RouteContext> {
        self.tx.subscribe()
    }
}
