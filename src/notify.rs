use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const COLOR_INFO: u32 = 0x3498db;
pub const COLOR_SUCCESS: u32 = 0x2ecc71;
pub const COLOR_WARNING: u32 = 0xf1c40f;
pub const COLOR_FAILURE: u32 = 0xe74c3c;

/// 一条富文本通知（Discord embed 结构）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl Embed {
    pub fn new(title: impl Into<String>, description: impl Into<String>, color: u32) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            color,
            fields: Vec::new(),
        }
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        inline: bool,
    ) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification webhook is not configured")]
    NotConfigured,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook answered {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, embed: &Embed) -> Result<(), NotifyError>;
}

/// Posts embeds to a Discord-compatible webhook URL.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    client: Client,
    webhook: Option<Url>,
    username: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    username: &'a str,
    embeds: [&'a Embed; 1],
}

impl WebhookNotifier {
    pub fn new(webhook: Option<Url>, username: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            webhook,
            username: username.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, embed: &Embed) -> Result<(), NotifyError> {
        let Some(webhook) = self.webhook.as_ref() else {
            return Err(NotifyError::NotConfigured);
        };

        let response = self
            .client
            .post(webhook.clone())
            .json(&WebhookPayload {
                username: &self.username,
                embeds: [embed],
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }
        Ok(())
    }
}

/// Sends `embed` on a detached task. Failures are logged and never reach the
/// caller.
pub fn spawn_notification(notifier: Arc<dyn Notifier>, embed: Embed) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.send(&embed).await {
            Ok(()) => debug!(title = %embed.title, "notification sent"),
            Err(err) => warn!(title = %embed.title, error = %err, "failed to send notification"),
        }
    })
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, extract::State, routing::post};
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn embed_serializes_without_empty_fields() {
        let value = serde_json::to_value(Embed::new("t", "d", COLOR_INFO)).unwrap();
        assert_eq!(value, json!({ "title": "t", "description": "d", "color": 0x3498db }));

        let with_field = Embed::new("t", "d", COLOR_SUCCESS).field("Failed", "0", true);
        let value = serde_json::to_value(with_field).unwrap();
        assert_eq!(value["fields"][0], json!({ "name": "Failed", "value": "0", "inline": true }));
    }

    #[tokio::test]
    async fn unconfigured_webhook_is_an_error() {
        let notifier = WebhookNotifier::new(None, "Analytics Cron");
        let err = notifier.send(&Embed::new("t", "d", COLOR_INFO)).await.unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured));
    }

    async fn capture_webhook(
        State(tx): State<mpsc::UnboundedSender<Value>>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        tx.send(body).ok();
        StatusCode::NO_CONTENT
    }

    #[tokio::test]
    async fn webhook_receives_username_and_embed() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let app = Router::new()
            .route("/api/webhooks/1/token", post(capture_webhook))
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = Url::parse(&format!("http://{addr}/api/webhooks/1/token")).unwrap();
        let notifier = WebhookNotifier::new(Some(url), "Analytics Cron");
        notifier
            .send(&Embed::new("Started", "go", COLOR_INFO))
            .await
            .unwrap();

        let body = rx.recv().await.unwrap();
        assert_eq!(body["username"], "Analytics Cron");
        assert_eq!(body["embeds"][0]["title"], "Started");
    }

    #[tokio::test]
    async fn spawned_notification_swallows_failures() {
        let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(None, "bot"));
        spawn_notification(notifier, Embed::new("t", "d", COLOR_FAILURE))
            .await
            .expect("task completes without panicking");
    }
}
