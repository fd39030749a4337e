use anyhow::{Context, Result};
use chat_api::{Conversation, Message, SendMessageRequest};
use url::Url;

use crate::config::ClientConfig;

/// Outgoing attachment payload for the REST send call. Uploads travel in
/// the same request as the message; the socket never carries file bytes.
#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub file_name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

/// Client for the conversation REST endpoints. Cheap to clone; carries the
/// bearer token when one is configured.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("invalid endpoint")
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let url = self.endpoint("/api/conversations/")?;
        let resp = self
            .authed(self.http.get(url))
            .send()
            .await
            .context("listing conversations")?;
        let resp = expect_ok(resp).await?;
        resp.json().await.context("invalid conversation list")
    }

    pub async fn fetch_history(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let url = self.endpoint(&format!("/api/conversations/{conversation_id}/messages/"))?;
        let resp = self
            .authed(self.http.get(url))
            .send()
            .await
            .context("fetching history")?;
        let resp = expect_ok(resp).await?;
        resp.json().await.context("invalid history payload")
    }

    /// Send a message, multipart when attachments are present. The client
    /// key makes a retried send idempotent server-side.
    pub async fn send_message(
        &self,
        conversation_id: i64,
        content: &str,
        attachments: Vec<OutgoingAttachment>,
        reply_to: Option<i64>,
        client_key: &str,
    ) -> Result<Message> {
        let url = self.endpoint(&format!("/api/conversations/{conversation_id}/messages/"))?;
        let builder = self.authed(self.http.post(url));
        let resp = if attachments.is_empty() {
            builder
                .json(&SendMessageRequest {
                    content: content.into(),
                    reply_to,
                    client_key: Some(client_key.into()),
                })
                .send()
                .await
        } else {
            let mut form = reqwest::multipart::Form::new()
                .text("content", content.to_string())
                .text("client_key", client_key.to_string());
            if let Some(parent) = reply_to {
                form = form.text("reply_to", parent.to_string());
            }
            for attachment in attachments {
                let part = reqwest::multipart::Part::bytes(attachment.data)
                    .file_name(attachment.file_name)
                    .mime_str(&attachment.mime)
                    .context("invalid attachment mime")?;
                form = form.part("files", part);
            }
            builder.multipart(form).send().await
        }
        .context("sending message")?;
        let resp = expect_ok(resp).await?;
        resp.json().await.context("invalid send response")
    }

    /// Clear the conversation's unread state.
    pub async fn mark_read(&self, conversation_id: i64) -> Result<()> {
        let url = self.endpoint(&format!("/api/conversations/{conversation_id}/read/"))?;
        let resp = self
            .authed(self.http.post(url))
            .send()
            .await
            .context("marking read")?;
        expect_ok(resp).await?;
        Ok(())
    }
}

async fn expect_ok(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let code = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| "request_failed".into());
    anyhow::bail!("{code} ({status})")
}
