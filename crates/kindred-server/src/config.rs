use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// The web client's origin; credentialed CORS needs an exact origin.
    pub cors_origin: String,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = lookup("KINDRED_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = match lookup("KINDRED_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("KINDRED_PORT is not a port number: {raw}"))?,
            None => 4000,
        };
        let cors_origin =
            lookup("KINDRED_CORS_ORIGIN").unwrap_or_else(|| "http://localhost:5173".into());

        Ok(Self {
            host,
            port,
            cors_origin,
        })
    }
}
