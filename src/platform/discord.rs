use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serenity::all::{
    ChannelId, Client, Context, CreateMessage, EventHandler, GatewayIntents, Message, MessageId,
    ReactionType, Ready,
};
use serenity::http::Http;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WATCH_CHANNEL_NAME;
use crate::platform::{Attachment, ChatPlatform, IncomingMessage, Marker};

/// Gateway intents needed to see guild and DM messages with their content.
pub fn intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
}

/// Build the Discord client. Message events are forwarded to `events`.
pub async fn connect(token: &str, events: mpsc::Sender<IncomingMessage>) -> Result<Client> {
    Client::builder(token, intents())
        .event_handler(GatewayHandler { events })
        .await
        .context("Failed to create Discord client")
}

/// Converts gateway events into [`IncomingMessage`]s and queues them.
struct GatewayHandler {
    events: mpsc::Sender<IncomingMessage>,
}

#[serenity::async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Bot is online as {}", ready.user.tag());
        info!("Watching for messages in #{} channels", WATCH_CHANNEL_NAME);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        // Channel lookup can hit the REST API, so only do it when it could matter.
        let channel_name = if msg.guild_id.is_some() && !msg.attachments.is_empty() {
            match msg.channel_id.to_channel(&ctx).await {
                Ok(channel) => channel.guild().map(|c| c.name),
                Err(e) => {
                    warn!("Failed to resolve channel {}: {}", msg.channel_id, e);
                    None
                }
            }
        } else {
            None
        };

        let incoming = to_incoming(&msg, channel_name);
        if self.events.send(incoming).await.is_err() {
            debug!("Event queue closed, dropping message {}", msg.id);
        }
    }
}

fn to_incoming(msg: &Message, channel_name: Option<String>) -> IncomingMessage {
    IncomingMessage {
        message_id: msg.id.get(),
        channel_id: msg.channel_id.get(),
        guild_id: msg.guild_id.map(|g| g.get()),
        channel_name,
        user_id: msg.author.id.get(),
        user_name: msg.author.tag(),
        author_is_bot: msg.author.bot,
        text: msg.content.clone(),
        attachments: msg
            .attachments
            .iter()
            .map(|a| Attachment {
                url: a.url.clone(),
                filename: a.filename.clone(),
            })
            .collect(),
    }
}

/// Reaction and reply operations over Discord's REST API.
pub struct DiscordPlatform {
    http: Arc<Http>,
}

impl DiscordPlatform {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn ids(msg: &IncomingMessage) -> (ChannelId, MessageId) {
    (ChannelId::new(msg.channel_id), MessageId::new(msg.message_id))
}

#[async_trait]
impl ChatPlatform for DiscordPlatform {
    async fn react(&self, msg: &IncomingMessage, marker: Marker) -> Result<()> {
        let (channel_id, message_id) = ids(msg);
        let reaction = ReactionType::Unicode(marker.emoji().to_string());
        self.http
            .create_reaction(channel_id, message_id, &reaction)
            .await
            .with_context(|| format!("Failed to add {} to message {}", marker.emoji(), message_id))
    }

    async fn clear_reactions(&self, msg: &IncomingMessage) -> Result<()> {
        let (channel_id, message_id) = ids(msg);
        self.http
            .delete_message_reactions(channel_id, message_id)
            .await
            .with_context(|| format!("Failed to clear reactions on message {}", message_id))
    }

    async fn reply(&self, msg: &IncomingMessage, text: &str) -> Result<()> {
        let (channel_id, message_id) = ids(msg);
        let builder = CreateMessage::new()
            .content(text)
            .reference_message((channel_id, message_id));
        channel_id
            .send_message(&self.http, builder)
            .await
            .with_context(|| format!("Failed to reply to message {}", message_id))?;
        Ok(())
    }
}
