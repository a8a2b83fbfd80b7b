use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use kindred_client::api::HttpBackend;
use kindred_client::chat_request::ChatRequestInbox;
use kindred_client::config::ClientConfig;
use kindred_client::link::{DetachedLink, RelayLink, WsRelayLink};
use kindred_client::listeners::ListenerRegistry;
use kindred_client::messages::RecentConversations;
use kindred_client::notifications::NotificationSync;
use kindred_client::route::{RouteContext, RouteTracker};
use kindred_client::session::RelaySession;

/// Follows one user's badges from the terminal: unread messages, pending
/// chat requests and the recent-conversations list, kept live over the relay.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kindred=debug,kindred_client=debug".into()),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let username = config
        .username
        .clone()
        .context("KINDRED_USERNAME must be set")?;

    let backend = Arc::new(HttpBackend::new(&config)?);
    let listeners = ListenerRegistry::new();

    let (link, connection_ids) = match WsRelayLink::connect(&config.relay_url, listeners.clone()).await {
        Ok(link) => {
            let ids = link.connection_ids();
            let link: Arc<dyn RelayLink> = Arc::new(link);
            (link, Some(ids))
        }
        Err(e) => {
            warn!("relay unavailable, running REST-only: {:#}", e);
            let link: Arc<dyn RelayLink> = Arc::new(DetachedLink);
            (link, None)
        }
    };

    let connection_id = connection_ids.as_ref().and_then(|ids| *ids.borrow());
    let session = Arc::new(RelaySession::new(link.clone(), connection_id));
    session.sign_in(&username);
    let _reregister = connection_ids.map(|ids| session.follow(ids));

    let routes = RouteTracker::new(RouteContext::Other("/".into()));

    let counter = NotificationSync::new(backend.clone());
    let _counter_sub = counter.subscribe(&listeners, &routes);
    counter.mount(&username).await;

    let inbox = ChatRequestInbox::new(backend.clone(), link.clone());
    let _inbox_sub = inbox.subscribe(&listeners);
    let _ = inbox.refresh().await;

    let conversations = RecentConversations::new(backend.clone());
    let _conversations_sub = conversations.subscribe(&listeners);
    let _ = conversations.refresh().await;

    let mut counter_rx = counter.watch();
    let mut inbox_rx = inbox.watch();
    let mut conversations_rx = conversations.watch();
    info!("watching {}", username);

    loop {
        tokio::select! {
            Ok(()) = counter_rx.changed() => {
                let state = counter_rx.borrow_and_update().clone();
                info!("unread: {:?}", state.counter);
            }
            Ok(()) = inbox_rx.changed() => {
                let view = inbox_rx.borrow_and_update().clone();
                info!("chat requests: {} ({} pending)", view.requests.len(), view.pending);
            }
            Ok(()) = conversations_rx.changed() => {
                let view = conversations_rx.borrow_and_update().clone();
                for row in &view.conversations {
                    info!("  {}: {}", row.username, row.message);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("stopped watching {}", username);
    Ok(())
}
