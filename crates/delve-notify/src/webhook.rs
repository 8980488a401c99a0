//! Chat webhook sink.
//!
//! Operator messages are plain posts. Announcements are posted with
//! `?wait=true` so the sink returns the created message id; later
//! announcements with the same correlation id PATCH that message.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::notifier::Notifier;
use crate::{NotifyError, NotifyResult};

#[derive(Serialize)]
struct WebhookMessage<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
struct CreatedMessage {
    id: String,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    /// Correlation id → message id returned by the sink.
    messages: Mutex<HashMap<String, String>>,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> NotifyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            messages: Mutex::new(HashMap::new()),
        })
    }

    fn wait_url(&self) -> String {
        if self.url.contains('?') {
            format!("{}&wait=true", self.url)
        } else {
            format!("{}?wait=true", self.url)
        }
    }

    fn message_url(&self, message_id: &str) -> String {
        match self.url.split_once('?') {
            Some((base, query)) => format!("{base}/messages/{message_id}?{query}"),
            None => format!("{}/messages/{message_id}", self.url),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, text: &str) -> NotifyResult<reqwest::Response> {
        let response = request.json(&WebhookMessage { content: text }).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn ops(&self, text: &str) -> NotifyResult<()> {
        self.send(self.client.post(&self.url), text).await?;
        Ok(())
    }

    async fn announce(&self, correlation_id: &str, text: &str) -> NotifyResult<()> {
        let existing = self.messages.lock().await.get(correlation_id).cloned();
        if let Some(message_id) = existing {
            self.send(self.client.patch(self.message_url(&message_id)), text)
                .await?;
            debug!(%correlation_id, %message_id, "announcement edited");
            return Ok(());
        }

        let response = self.send(self.client.post(self.wait_url()), text).await?;
        let created: CreatedMessage = response.json().await?;
        debug!(%correlation_id, message_id = %created.id, "announcement posted");
        self.messages
            .lock()
            .await
            .insert(correlation_id.to_string(), created.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn ops_posts_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({ "content": "d001 recovered" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(&format!("{}/hook", server.uri())).unwrap();
        notifier.ops("d001 recovered").await.unwrap();
    }

    #[tokio::test]
    async fn announce_edits_message_for_same_correlation_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(query_param("wait", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "42" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/hook/messages/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "42" })))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(&format!("{}/hook", server.uri())).unwrap();
        notifier.announce("run-1", "alex queued").await.unwrap();
        notifier.announce("run-1", "alex entered d001").await.unwrap();
        notifier.announce("run-1", "alex won").await.unwrap();
    }

    #[tokio::test]
    async fn rejected_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(&server.uri()).unwrap();
        let err = notifier.ops("spam").await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected(429)));
    }
}
