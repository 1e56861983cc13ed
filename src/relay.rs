use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::config::RelayConfig;
use crate::platform::{Attachment, IncomingMessage};

/// Reply used when the endpoint could not be reached or answered garbage.
pub const ERROR_REPLY: &str = "❌ Error processing receipt";
/// Reply used when the endpoint rejected the receipt without saying why.
pub const FAILURE_REPLY: &str = "❌ Failed to process receipt";

/// Body POSTed to the relay endpoint. Ids are Discord snowflakes as strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayRequest {
    pub discord_user_id: String,
    pub discord_username: String,
    pub guild_id: Option<String>,
    pub message_id: String,
    pub channel_id: String,
    pub attachment_url: String,
    pub attachment_name: String,
    pub message_content: String,
}

impl RelayRequest {
    /// Only the first attachment is forwarded. Returns `None` when there is none.
    pub fn from_message(msg: &IncomingMessage) -> Option<Self> {
        let Attachment { url, filename } = msg.attachments.first()?;
        Some(Self {
            discord_user_id: msg.user_id.to_string(),
            discord_username: msg.user_name.clone(),
            guild_id: msg.guild_id.map(|g| g.to_string()),
            message_id: msg.message_id.to_string(),
            channel_id: msg.channel_id.to_string(),
            attachment_url: url.clone(),
            attachment_name: filename.clone(),
            message_content: msg.text.clone(),
        })
    }
}

/// Longest slice of an unparseable response body kept in the error.
const BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayResponse {
    /// Anything other than `true` (absent, `null`, `false`) is a rejection.
    #[serde(default, deserialize_with = "null_as_false")]
    pub success: bool,
    #[serde(default)]
    pub reply: Option<String>,
}

fn null_as_false<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// The verdict shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { reply: Option<String> },
    Failure { reply: String },
}

impl Outcome {
    pub fn from_result(result: &Result<RelayResponse>) -> Self {
        // Discord refuses empty messages, so an empty reply counts as none.
        let non_empty = |reply: &Option<String>| reply.clone().filter(|r| !r.is_empty());
        match result {
            Ok(RelayResponse {
                success: true,
                reply,
            }) => Outcome::Success {
                reply: non_empty(reply),
            },
            Ok(RelayResponse {
                success: false,
                reply,
            }) => Outcome::Failure {
                reply: non_empty(reply).unwrap_or_else(|| FAILURE_REPLY.to_string()),
            },
            Err(_) => Outcome::Failure {
                reply: ERROR_REPLY.to_string(),
            },
        }
    }
}

/// Anything that can carry a relay request to the endpoint.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn send(&self, request: &RelayRequest) -> Result<RelayResponse>;
}

pub struct RelayClient {
    client: reqwest::Client,
    endpoint_url: String,
}

impl RelayClient {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint_url: config.endpoint_url.clone(),
        })
    }
}

#[async_trait]
impl Relay for RelayClient {
    async fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
        debug!("Relaying message {} to {}", request.message_id, self.endpoint_url);

        let response = self
            .client
            .post(&self.endpoint_url)
            .json(request)
            .send()
            .await
            .context("Failed to send request to relay endpoint")?;

        // Status is not checked: an endpoint may reject with a JSON verdict.
        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read relay endpoint response")?;

        serde_json::from_str(&body).with_context(|| {
            format!(
                "Failed to parse relay endpoint response ({status}): {}",
                body_preview(&body)
            )
        })
    }
}

fn body_preview(body: &str) -> String {
    let mut chars = body.chars();
    let preview: String = chars.by_ref().take(BODY_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{preview}...")
    } else {
        preview
    }
}
