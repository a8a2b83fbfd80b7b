//! Client-side core of the Kindred web client: keeps unread counters,
//! chat-request status, typing indicators and conversation logs in sync
//! with the REST backend, using relay pushes only as "re-fetch now" hints.

pub mod api;
pub mod chat_request;
pub mod config;
pub mod error;
pub mod link;
pub mod listeners;
pub mod messages;
pub mod notifications;
pub mod route;
pub mod session;
pub mod typing;

#[cfg(test)]
pub(crate) mod testing;
