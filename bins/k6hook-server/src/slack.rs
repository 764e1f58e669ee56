// Slack notifications for load test status

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const SLACK_API_URL: &str = "https://slack.com/api";
pub const RESULTS_FILE_NAME: &str = "k6-results.txt";

/// Channel ID -> timestamp of the message posted there
pub type ThreadHandles = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("slack request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("slack {method} failed: {error}")]
    Api { method: String, error: String },

    #[error("error sending message to {channel}: {source}")]
    Send {
        channel: String,
        #[source]
        source: Box<NotifyError>,
    },

    #[error("error updating message {ts} in channel {channel}: {source}")]
    Update {
        channel: String,
        ts: String,
        #[source]
        source: Box<NotifyError>,
    },

    #[error("error while uploading output to {ts} in slack channel {channel}: {source}")]
    Upload {
        channel: String,
        ts: String,
        #[source]
        source: Box<NotifyError>,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post `text` to every channel. Stops at the first channel that fails.
    async fn send_messages(
        &self,
        channels: &[String],
        text: &str,
        context: &str,
    ) -> Result<ThreadHandles, NotifyError>;

    async fn update_messages(
        &self,
        threads: &ThreadHandles,
        text: &str,
        context: &str,
    ) -> Result<(), NotifyError>;

    async fn add_file_to_threads(
        &self,
        threads: &ThreadHandles,
        file_name: &str,
        content: &str,
    ) -> Result<(), NotifyError>;
}

/// A markdown section with the status, followed by a context block when
/// there is extra context to show
pub fn message_blocks(text: &str, context: &str) -> Value {
    let mut blocks = vec![json!({
        "type": "section",
        "text": { "type": "mrkdwn", "text": text },
    })];
    if !context.is_empty() {
        blocks.push(json!({
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": context }],
        }));
    }
    Value::Array(blocks)
}

/// Slack Web API client
pub struct SlackNotifier {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl SlackNotifier {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building slack http client")?;
        Ok(Self::with_client(client, token, SLACK_API_URL))
    }

    pub fn with_client(
        client: reqwest::Client,
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value, NotifyError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        check_response(method, response).await
    }

    async fn call_form(&self, method: &str, form: &[(&str, String)]) -> Result<Value, NotifyError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await?;
        check_response(method, response).await
    }

    async fn upload_file(
        &self,
        channel: &str,
        ts: &str,
        file_name: &str,
        content: &str,
    ) -> Result<(), NotifyError> {
        let upload = self
            .call_form(
                "files.getUploadURLExternal",
                &[
                    ("filename", file_name.to_string()),
                    ("length", content.len().to_string()),
                ],
            )
            .await?;
        let upload_url = string_field("files.getUploadURLExternal", &upload, "upload_url")?;
        let file_id = string_field("files.getUploadURLExternal", &upload, "file_id")?;

        self.client
            .post(upload_url)
            .body(content.to_string())
            .send()
            .await?
            .error_for_status()?;

        self.call(
            "files.completeUploadExternal",
            &json!({
                "files": [{ "id": file_id, "title": file_name }],
                "channel_id": channel,
                "thread_ts": ts,
            }),
        )
        .await?;
        Ok(())
    }
}

async fn check_response(method: &str, response: reqwest::Response) -> Result<Value, NotifyError> {
    let payload: Value = response.error_for_status()?.json().await?;
    if payload.get("ok").and_then(Value::as_bool) != Some(true) {
        return Err(NotifyError::Api {
            method: method.to_string(),
            error: payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string(),
        });
    }
    Ok(payload)
}

fn string_field(method: &str, payload: &Value, field: &str) -> Result<String, NotifyError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| NotifyError::Api {
            method: method.to_string(),
            error: format!("response is missing {field}"),
        })
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send_messages(
        &self,
        channels: &[String],
        text: &str,
        context: &str,
    ) -> Result<ThreadHandles, NotifyError> {
        let mut threads = ThreadHandles::new();
        for channel in channels {
            let posted = self
                .call(
                    "chat.postMessage",
                    &json!({
                        "channel": channel,
                        "text": text,
                        "blocks": message_blocks(text, context),
                    }),
                )
                .await
                .and_then(|posted| {
                    Ok((
                        string_field("chat.postMessage", &posted, "channel")?,
                        string_field("chat.postMessage", &posted, "ts")?,
                    ))
                });
            match posted {
                Ok((channel_id, ts)) => {
                    threads.insert(channel_id, ts);
                }
                Err(e) => {
                    return Err(NotifyError::Send {
                        channel: channel.clone(),
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(threads)
    }

    async fn update_messages(
        &self,
        threads: &ThreadHandles,
        text: &str,
        context: &str,
    ) -> Result<(), NotifyError> {
        for (channel, ts) in threads {
            self.call(
                "chat.update",
                &json!({
                    "channel": channel,
                    "ts": ts,
                    "text": text,
                    "blocks": message_blocks(text, context),
                }),
            )
            .await
            .map_err(|e| NotifyError::Update {
                channel: channel.clone(),
                ts: ts.clone(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    async fn add_file_to_threads(
        &self,
        threads: &ThreadHandles,
        file_name: &str,
        content: &str,
    ) -> Result<(), NotifyError> {
        for (channel, ts) in threads {
            self.upload_file(channel, ts, file_name, content)
                .await
                .map_err(|e| NotifyError::Upload {
                    channel: channel.clone(),
                    ts: ts.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }
}

/// Used when no Slack token is configured
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send_messages(
        &self,
        channels: &[String],
        text: &str,
        _context: &str,
    ) -> Result<ThreadHandles, NotifyError> {
        if !channels.is_empty() {
            debug!(text, "Slack disabled, not sending message");
        }
        Ok(ThreadHandles::new())
    }

    async fn update_messages(
        &self,
        threads: &ThreadHandles,
        text: &str,
        _context: &str,
    ) -> Result<(), NotifyError> {
        if !threads.is_empty() {
            debug!(text, "Slack disabled, not updating messages");
        }
        Ok(())
    }

    async fn add_file_to_threads(
        &self,
        threads: &ThreadHandles,
        file_name: &str,
        _content: &str,
    ) -> Result<(), NotifyError> {
        if !threads.is_empty() {
            debug!(file_name, "Slack disabled, not uploading file");
        }
        Ok(())
    }
}
