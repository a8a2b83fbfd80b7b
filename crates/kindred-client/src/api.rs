use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use reqwest::cookie::Jar;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::warn;

use kindred_types::api::{
    ChatRequestDecision, ClearedCount, NotificationCount, PostMessageRequest, RequestCount,
    RequesteeBody, RequestorBody, RetrieveMessagesRequest,
};
use kindred_types::models::{
    ChatRequestStatus, ChatRequestSummary, MessageLogEntry, RecentConversation,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// The REST backend: the source of truth for every counter, request and
/// message. All calls are credentialed with the viewer's session.
pub trait Backend: Send + Sync + 'static {
    fn notification_count(&self, username: &str) -> impl Future<Output = ClientResult<u32>> + Send;

    /// Zero the counter and return its new value.
    fn clear_notification_count(
        &self,
        username: &str,
    ) -> impl Future<Output = ClientResult<u32>> + Send;

    /// Status of the chat request between the viewer and `requestee`.
    fn chat_request_status(
        &self,
        requestee: &str,
    ) -> impl Future<Output = ClientResult<ChatRequestStatus>> + Send;

    fn make_chat_request(&self, requestee: &str) -> impl Future<Output = ClientResult<()>> + Send;

    fn delete_chat_request(&self, requestee: &str) -> impl Future<Output = ClientResult<()>> + Send;

    /// Answer a request the viewer received. Returns the refreshed inbox.
    fn respond_chat_request(
        &self,
        requestor: &str,
        decision: ChatRequestDecision,
    ) -> impl Future<Output = ClientResult<Vec<ChatRequestSummary>>> + Send;

    fn chat_requests(&self) -> impl Future<Output = ClientResult<Vec<ChatRequestSummary>>> + Send;

    /// Number of requests sent to the viewer, excluding ones it made.
    fn chat_request_count(&self) -> impl Future<Output = ClientResult<u32>> + Send;

    /// Persist a message. Returns the full conversation after the insert.
    fn post_message(
        &self,
        recipient: &str,
        body: &str,
    ) -> impl Future<Output = ClientResult<Vec<MessageLogEntry>>> + Send;

    fn messages(
        &self,
        counterpart: &str,
    ) -> impl Future<Output = ClientResult<Vec<MessageLogEntry>>> + Send;

    /// Everyone the viewer has a conversation with, latest message first.
    fn recent_conversations(
        &self,
    ) -> impl Future<Output = ClientResult<Vec<RecentConversation>>> + Send;
}

/// Map a non-2xx status onto the error taxonomy.
pub fn classify_status(status: StatusCode) -> ClientError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::NotAuthenticated,
        StatusCode::CONFLICT => ClientError::StateConflict(status.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ClientError::Validation(status.to_string())
        }
        _ => ClientError::Transient(status.to_string()),
    }
}

/// `Backend` over HTTP, with the session cookie attached to every request.
pub struct HttpBackend {
    client: reqwest::Client,
    read_url: String,
    write_url: String,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());
        if let Some(cookies) = &config.session_cookie {
            for base in [&config.api_url, &config.write_api_url] {
                let url: Url = base
                    .parse()
                    .with_context(|| format!("invalid API url: {base}"))?;
                for cookie in cookies.split(';').map(str::trim).filter(|c| !c.is_empty()) {
                    jar.add_cookie_str(cookie, &url);
                }
            }
        }

        let client = reqwest::Client::builder()
            .cookie_provider(jar)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            read_url: config.api_url.clone(),
            write_url: config.write_api_url.clone(),
        })
    }

    fn read(&self, path: &str) -> String {
        format!("{}{}", self.read_url, path)
    }

    fn write(&self, path: &str) -> String {
        format!("{}{}", self.write_url, path)
    }

    async fn checked(&self, req: RequestBuilder) -> ClientResult<reqwest::Response> {
        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            Ok(res)
        } else {
            warn!("{} {} -> {}", res.url().path(), status, status.canonical_reason().unwrap_or(""));
            Err(classify_status(status))
        }
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> ClientResult<T> {
        self.checked(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ClientError::Transient(format!("undecodable response: {e}")))
    }
}

impl Backend for HttpBackend {
    async fn notification_count(&self, username: &str) -> ClientResult<u32> {
        let req = self
            .client
            .get(self.read("/retrieve_notification_count"))
            .query(&[("username", username)]);
        let count: NotificationCount = self.json(req).await?;
        Ok(count.notification_counter)
    }

    async fn clear_notification_count(&self, username: &str) -> ClientResult<u32> {
        let req = self
            .client
            .put(self.write("/clear_notification_count"))
            .query(&[("username", username)]);
        let cleared: ClearedCount = self.json(req).await?;
        Ok(cleared.value())
    }

    async fn chat_request_status(&self, requestee: &str) -> ClientResult<ChatRequestStatus> {
        let req = self
            .client
            .post(self.read("/privacy/fetch_chat_req_status"))
            .json(&RequesteeBody {
                requestee: requestee.to_string(),
            });
        self.json(req).await
    }

    async fn make_chat_request(&self, requestee: &str) -> ClientResult<()> {
        let req = self
            .client
            .post(self.write("/privacy/make_chat_request"))
            .json(&RequesteeBody {
                requestee: requestee.to_string(),
            });
        self.checked(req).await.map(drop)
    }

    async fn delete_chat_request(&self, requestee: &str) -> ClientResult<()> {
        let req = self
            .client
            .put(self.write("/privacy/delete_chat_request"))
            .json(&RequesteeBody {
                requestee: requestee.to_string(),
            });
        self.checked(req).await.map(drop)
    }

    async fn respond_chat_request(
        &self,
        requestor: &str,
        decision: ChatRequestDecision,
    ) -> ClientResult<Vec<ChatRequestSummary>> {
        let req = self
            .client
            .put(self.write("/privacy/chat_request_response"))
            .query(&[("r", decision.as_query())])
            .json(&RequestorBody {
                requestor: requestor.to_string(),
            });
        self.json(req).await
    }

    async fn chat_requests(&self) -> ClientResult<Vec<ChatRequestSummary>> {
        self.json(self.client.get(self.read("/retrieve_chat_requests")))
            .await
    }

    async fn chat_request_count(&self) -> ClientResult<u32> {
        let count: RequestCount = self
            .json(self.client.get(self.read("/retrieve_request_count")))
            .await?;
        Ok(count.request_count)
    }

    async fn post_message(&self, recipient: &str, body: &str) -> ClientResult<Vec<MessageLogEntry>> {
        let req = self
            .client
            .post(self.write("/post_message"))
            .json(&PostMessageRequest {
                recipient_user: recipient.to_string(),
                message: body.to_string(),
            });
        self.json(req).await
    }

    async fn messages(&self, counterpart: &str) -> ClientResult<Vec<MessageLogEntry>> {
        let req = self
            .client
            .post(self.read("/retrieve_messages"))
            .json(&RetrieveMessagesRequest {
                receiver: counterpart.to_string(),
            });
        self.json(req).await
    }

    async fn recent_conversations(&self) -> ClientResult<Vec<RecentConversation>> {
        self.json(self.client.get(self.read("/check_messaged_users")))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_are_distinguished() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ClientError::NotAuthenticated);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ClientError::NotAuthenticated);
        assert!(matches!(
            classify_status(StatusCode::CONFLICT),
            ClientError::StateConflict(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            ClientError::Validation(_)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY).is_retryable());
    }

    #[test]
    fn builds_with_split_urls_and_cookies() {
        let config = ClientConfig {
            api_url: "http://localhost:4000".into(),
            write_api_url: "http://localhost:5000".into(),
            relay_url: "ws://localhost:4000/gateway".into(),
            username: Some("ana".into()),
            session_cookie: Some("user_session=abc; username=ana".into()),
            request_timeout: std::time::Duration::from_secs(1),
        };
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(backend.read("/x"), "http://localhost:4000/x");
        assert_eq!(backend.write("/x"), "http://localhost:5000/x");
    }
}
