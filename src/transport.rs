//! Delivery sinks for rendered digests.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SendError;
use crate::fetch::HttpClient;
use crate::subscriptions::RecipientId;

/// Accepts a rendered payload for one recipient.
///
/// `Ok` means the transport acknowledged the message.
#[async_trait]
pub trait TransportSink: Send + Sync {
    async fn send(&self, recipient: &RecipientId, payload: &str) -> Result<(), SendError>;
}

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Deserialize)]
struct TelegramError {
    #[serde(default)]
    description: String,
}

/// Sends messages through the Telegram Bot API `sendMessage` method.
pub struct TelegramSink<C> {
    client: C,
    token: String,
    base_url: String,
}

impl<C: HttpClient> TelegramSink<C> {
    pub fn new(client: C, token: String) -> Self {
        Self {
            client,
            token,
            base_url: TELEGRAM_API.to_string(),
        }
    }

    /// Points the sink at another Bot API server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, recipient: &RecipientId, payload: &str) -> Result<reqwest::Request, SendError> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token)
            .parse()
            .map_err(|_| SendError::Rejected("invalid Bot API url".into()))?;
        let body = serde_json::to_vec(&serde_json::json!({
            "chat_id": recipient.as_str(),
            "text": payload,
        }))
        .map_err(|e| SendError::Rejected(format!("cannot encode message: {e}")))?;

        let mut req = reqwest::Request::new(reqwest::Method::POST, url);
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *req.body_mut() = Some(body.into());
        Ok(req)
    }
}

/// Maps a Bot API failure to retry-or-drop.
fn classify(status: StatusCode, description: &str) -> SendError {
    let lowered = description.to_lowercase();
    let gone = status == StatusCode::FORBIDDEN
        || (status == StatusCode::BAD_REQUEST && lowered.contains("chat not found"));

    if gone {
        SendError::RecipientGone(format!("{status}: {description}"))
    } else {
        SendError::Rejected(format!("{status}: {description}"))
    }
}

#[async_trait]
impl<C: HttpClient> TransportSink for TelegramSink<C> {
    async fn send(&self, recipient: &RecipientId, payload: &str) -> Result<(), SendError> {
        let req = self.request(recipient, payload)?;

        let resp = self
            .client
            .execute(req)
            .await
            // the token is part of the url: never echo the error's url
            .map_err(|e| SendError::Rejected(e.without_url().to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(recipient = %recipient, "Bot API accepted message");
            return Ok(());
        }

        let description = resp
            .json::<TelegramError>()
            .await
            .map(|e| e.description)
            .unwrap_or_default();
        Err(classify(status, &description))
    }
}

/// Logs payloads instead of sending them. Used for dry runs.
pub struct LogSink;

#[async_trait]
impl TransportSink for LogSink {
    async fn send(&self, recipient: &RecipientId, payload: &str) -> Result<(), SendError> {
        info!(recipient = %recipient, "Dry run, digest not sent:\n{payload}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;

    #[test]
    fn test_blocked_bot_means_recipient_gone() {
        let err = classify(StatusCode::FORBIDDEN, "Forbidden: bot was blocked by the user");
        assert!(matches!(err, SendError::RecipientGone(_)));
    }

    #[test]
    fn test_missing_chat_means_recipient_gone() {
        let err = classify(StatusCode::BAD_REQUEST, "Bad Request: chat not found");
        assert!(matches!(err, SendError::RecipientGone(_)));
    }

    #[test]
    fn test_other_failures_are_retryable() {
        let err = classify(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests: retry after 5");
        assert!(matches!(err, SendError::Rejected(_)));
        let err = classify(StatusCode::BAD_REQUEST, "Bad Request: message is too long");
        assert!(matches!(err, SendError::Rejected(_)));
    }

    #[test]
    fn test_request_shape() {
        let sink = TelegramSink::new(BasicClient::new(), "T0KEN".into())
            .with_base_url("http://localhost:8081");
        let req = sink.request(&RecipientId::new("-100"), "hello").unwrap();

        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "http://localhost:8081/botT0KEN/sendMessage");
        let body: serde_json::Value =
            serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["chat_id"], "-100");
        assert_eq!(body["text"], "hello");
    }

    #[tokio::test]
    async fn test_log_sink_always_succeeds() {
        assert!(LogSink.send(&RecipientId::new("1"), "x").await.is_ok());
    }
}
