use std::time::Duration;

use anyhow::{Context, Result};

/// Where the client finds the REST backend and the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Read API base URL
    pub api_url: String,
    /// Write API base URL; the backend may split reads and writes
    pub write_api_url: String,
    pub relay_url: String,
    pub username: Option<String>,
    pub session_cookie: Option<String>,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_url = lookup("KINDRED_API_URL").unwrap_or_else(|| "http://localhost:4000".into());
        let write_api_url = lookup("KINDRED_API_WRITE_URL").unwrap_or_else(|| api_url.clone());
        let relay_url =
            lookup("KINDRED_RELAY_URL").unwrap_or_else(|| "ws://localhost:4000/gateway".into());
        let timeout_secs: u64 = match lookup("KINDRED_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("KINDRED_REQUEST_TIMEOUT_SECS is not a number: {raw}"))?,
            None => 10,
        };

        Ok(Self {
            api_url: trim_slash(api_url),
            write_api_url: trim_slash(write_api_url),
            relay_url,
            username: lookup("KINDRED_USERNAME").filter(|u| !u.is_empty()),
            session_cookie: lookup("KINDRED_SESSION_COOKIE").filter(|c| !c.is_empty()),
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn trim_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
