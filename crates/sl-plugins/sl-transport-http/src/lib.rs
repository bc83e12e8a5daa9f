//! # sl-transport-http
//!
//! `ChatTransport` over the gateway bridge's REST API. The bridge owns the
//! platform connection; this plugin only issues channel and message calls
//! and maps HTTP statuses onto [`TransportError`].
//!
//! Routes, relative to the bridge base URL:
//! - `POST   /channels` create, `GET`/`DELETE /channels/{id}`
//! - `GET    /channels/{id}/children` channels inside a category
//! - `POST   /channels/{id}/messages` send, `GET`/`PATCH`/`DELETE .../{message}`
//! - `PUT    /channels/{id}/messages/{message}/reactions`
//! - `POST   /channels/{id}/typing`
//! - `POST   /users/{id}/private-channel`

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sl_core::error::TransportError;
use sl_core::models::{ChannelId, ChannelInfo, ChatMessage, MessageId, OutgoingMessage, UserId};
use sl_core::traits::ChatTransport;
use tracing::debug;

pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: SecretString,
    bot_id: UserId,
}

#[derive(Serialize)]
struct CreateChannel<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<ChannelId>,
    name: &'a str,
    topic: &'a str,
}

#[derive(Serialize)]
struct Reaction<'a> {
    emoji: &'a str,
}

#[derive(Deserialize)]
struct Created<T> {
    id: T,
}

impl HttpTransport {
    /// Creates a transport for the bridge at `base_url`
    /// (e.g. `http://127.0.0.1:7070`).
    pub fn new(
        base_url: impl Into<String>,
        token: SecretString,
        bot_id: UserId,
    ) -> Result<Self, TransportError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(TransportError::Other("gateway url must not be empty".into()));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Other(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            bot_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(self.token.expose_secret())
    }

    /// Sends the request and fails on any non-2xx status.
    async fn execute(&self, request: RequestBuilder, what: &str) -> Result<Response, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Other(format!("{what}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        debug!(%status, what, detail = %detail, "gateway bridge call failed");
        Err(status_error(status, what, &detail))
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, TransportError> {
        self.execute(request, what)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Other(format!("{what}: malformed response: {e}")))
    }

    /// Like [`Self::json`], with a 404 read as absence.
    async fn optional<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Option<T>, TransportError> {
        match self.json(request, what).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn status_error(status: StatusCode, what: &str, detail: &str) -> TransportError {
    let message = if detail.is_empty() {
        what.to_string()
    } else {
        format!("{what}: {detail}")
    };
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => TransportError::NotFound(message),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => TransportError::Forbidden(message),
        other => TransportError::Other(format!("{message} (status {other})")),
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    fn bot_id(&self) -> UserId {
        self.bot_id
    }

    async fn send(
        &self,
        channel: ChannelId,
        message: OutgoingMessage,
    ) -> Result<MessageId, TransportError> {
        let created: Created<MessageId> = self
            .json(
                self.request(Method::POST, &format!("/channels/{channel}/messages"))
                    .json(&message),
                "send message",
            )
            .await?;
        Ok(created.id)
    }

    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: OutgoingMessage,
    ) -> Result<(), TransportError> {
        self.execute(
            self.request(Method::PATCH, &format!("/channels/{channel}/messages/{message}"))
                .json(&content),
            "edit message",
        )
        .await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), TransportError> {
        self.execute(
            self.request(Method::DELETE, &format!("/channels/{channel}/messages/{message}")),
            "delete message",
        )
        .await?;
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<ChatMessage>, TransportError> {
        self.optional(
            self.request(Method::GET, &format!("/channels/{channel}/messages/{message}")),
            "fetch message",
        )
        .await
    }

    async fn add_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), TransportError> {
        self.execute(
            self.request(
                Method::PUT,
                &format!("/channels/{channel}/messages/{message}/reactions"),
            )
            .json(&Reaction { emoji }),
            "add reaction",
        )
        .await?;
        Ok(())
    }

    async fn trigger_typing(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.execute(
            self.request(Method::POST, &format!("/channels/{channel}/typing")),
            "trigger typing",
        )
        .await?;
        Ok(())
    }

    async fn create_channel(
        &self,
        category: Option<ChannelId>,
        name: &str,
        topic: &str,
    ) -> Result<ChannelInfo, TransportError> {
        self.json(
            self.request(Method::POST, "/channels").json(&CreateChannel {
                category,
                name,
                topic,
            }),
            "create channel",
        )
        .await
    }

    async fn delete_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.execute(
            self.request(Method::DELETE, &format!("/channels/{channel}")),
            "delete channel",
        )
        .await?;
        Ok(())
    }

    async fn fetch_channel(&self, channel: ChannelId) -> Result<Option<ChannelInfo>, TransportError> {
        self.optional(
            self.request(Method::GET, &format!("/channels/{channel}")),
            "fetch channel",
        )
        .await
    }

    async fn category_channels(
        &self,
        category: ChannelId,
    ) -> Result<Vec<ChannelInfo>, TransportError> {
        self.json(
            self.request(Method::GET, &format!("/channels/{category}/children")),
            "list category channels",
        )
        .await
    }

    async fn private_channel(&self, user: UserId) -> Result<ChannelId, TransportError> {
        let created: Created<ChannelId> = self
            .json(
                self.request(Method::POST, &format!("/users/{user}/private-channel")),
                "open private channel",
            )
            .await?;
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(base: &str) -> HttpTransport {
        HttpTransport::new(base, SecretString::from("token"), UserId(1)).unwrap()
    }

    #[test]
    fn test_base_url_is_normalised() {
        let t = transport("http://bridge:7070/");
        assert_eq!(t.url("/channels/5"), "http://bridge:7070/channels/5");
        assert_eq!(t.bot_id(), UserId(1));
    }

    #[test]
    fn test_empty_base_url_is_rejected() {
        assert!(HttpTransport::new("  ", SecretString::from("t"), UserId(1)).is_err());
    }

    #[test]
    fn test_statuses_map_to_transport_errors() {
        assert!(status_error(StatusCode::NOT_FOUND, "fetch", "").is_not_found());
        assert!(status_error(StatusCode::GONE, "fetch", "").is_not_found());
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, "send", "dms closed"),
            TransportError::Forbidden("send: dms closed".into())
        );
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "send", ""),
            TransportError::Other(m) if m.contains("429")
        ));
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_a_transport_failure() {
        let t = transport("http://127.0.0.1:9");
        let err = t.trigger_typing(ChannelId(5)).await.unwrap_err();
        assert!(matches!(err, TransportError::Other(_)));
    }
}
