use thiserror::Error;

/// Failure of a REST call or a client-side check, classified by how the UI
/// should react to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// 401/403: render the signed-out state, not an error banner
    #[error("not authenticated")]
    NotAuthenticated,

    /// Network failure or unexpected status; the user can retry
    #[error("request failed: {0}")]
    Transient(String),

    /// Input rejected before or by the backend; shown inline
    #[error("invalid input: {0}")]
    Validation(String),

    /// The action no longer applies to the current state; re-fetch truth
    #[error("state changed: {0}")]
    StateConflict(String),
}

impl ClientError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::NotAuthenticated)
    }

    /// Whether a manual reload may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// The `{pending, error}` pair every async boundary collapses into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStatus {
    pub pending: bool,
    pub error: Option<ClientError>,
}

impl Default for LoadStatus {
    fn default() -> Self {
        Self::loading()
    }
}

impl LoadStatus {
    pub fn loading() -> Self {
        Self {
            pending: true,
            error: None,
        }
    }

    pub fn settled<T>(result: &ClientResult<T>) -> Self {
        Self {
            pending: false,
            error: result.as_ref().err().cloned(),
        }
    }

    /// True when the view should show its error affordance. Signed-out is a
    /// normal state, not an error.
    pub fn shows_error(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_auth())
    }
}
