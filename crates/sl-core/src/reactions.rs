//! # Reaction Protocol
//!
//! Maps a reaction event to at most one action: a recipient closing their
//! thread from the creation response, or an operator reaction mirrored onto
//! the recipient's copy of a message.

use std::sync::Arc;

use tracing::debug;

use crate::config::keys;
use crate::context::RelayContext;
use crate::error::Result;
use crate::models::{ChannelId, MessageId, ReactionEvent};
use crate::thread::Thread;

#[derive(Clone)]
pub enum ReactionAction {
    /// Close the thread now, credited to the recipient.
    Close(Arc<Thread>),
    /// Add `emoji` to the linked message in the other channel.
    Mirror {
        channel: ChannelId,
        message: MessageId,
        emoji: String,
    },
    Ignore,
}

impl std::fmt::Debug for ReactionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReactionAction::Close(thread) => f
                .debug_tuple("Close")
                .field(&thread.recipient_id())
                .finish(),
            ReactionAction::Mirror {
                channel,
                message,
                emoji,
            } => f
                .debug_struct("Mirror")
                .field("channel", channel)
                .field("message", message)
                .field("emoji", emoji)
                .finish(),
            ReactionAction::Ignore => f.write_str("Ignore"),
        }
    }
}

pub async fn interpret(cx: &RelayContext, event: &ReactionEvent) -> Result<ReactionAction> {
    if event.user_id == cx.transport.bot_id() {
        return Ok(ReactionAction::Ignore);
    }
    if event.private {
        close_request(cx, event).await
    } else {
        mirror_request(cx, event).await
    }
}

async fn close_request(cx: &RelayContext, event: &ReactionEvent) -> Result<ReactionAction> {
    // 1. Feature gate and emoji.
    if !cx.config.flag(keys::RECIPIENT_THREAD_CLOSE).await? {
        return Ok(ReactionAction::Ignore);
    }
    let Some(close_emoji) = cx.config.emoji(keys::CLOSE_EMOJI).await? else {
        return Ok(ReactionAction::Ignore);
    };
    if event.emoji != close_emoji {
        return Ok(ReactionAction::Ignore);
    }

    // 2. The reactor must own a live thread.
    let Some(thread) = cx.registry.find_by_recipient(event.user_id) else {
        return Ok(ReactionAction::Ignore);
    };

    // 3. The reacted message must be that thread's creation response.
    let message = match cx.transport.fetch_message(event.channel_id, event.message_id).await {
        Ok(Some(message)) => message,
        Ok(None) => return Ok(ReactionAction::Ignore),
        Err(e) if e.is_not_found() => return Ok(ReactionAction::Ignore),
        Err(e) => return Err(e.into()),
    };
    if !thread.is_creation_notice(&message, cx.transport.bot_id()) {
        debug!(message = %event.message_id, "close reaction on a message other than the creation response");
        return Ok(ReactionAction::Ignore);
    }
    Ok(ReactionAction::Close(thread))
}

async fn mirror_request(cx: &RelayContext, event: &ReactionEvent) -> Result<ReactionAction> {
    let Some(thread) = cx.registry.find_by_channel(event.channel_id) else {
        return Ok(ReactionAction::Ignore);
    };
    match cx.store.find_link(event.message_id).await? {
        Some(link) if link.relay_channel == thread.relay_channel_id() && link.relay_message == event.message_id => {
            Ok(ReactionAction::Mirror {
                channel: link.private_channel,
                message: link.private_message,
                emoji: event.emoji.clone(),
            })
        }
        _ => Ok(ReactionAction::Ignore),
    }
}
