//! # Core Traits (Ports)
//!
//! Any plugin must implement these traits to be used by the binary.
//! The chat gateway, the document store and the runtime config source are
//! all external collaborators; the core only ever talks to them through here.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::models::{
    BlockEntry, ChannelId, ChannelInfo, ChatMessage, ClosedLog, LogEntry, MessageId, MessageLink,
    OutgoingMessage, PendingClosure, ThreadLog, UserId,
};

/// Chat platform contract: channel and message CRUD on behalf of the bot.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// The bot's own user id. Events authored by it are ignored.
    fn bot_id(&self) -> UserId;

    async fn send(
        &self,
        channel: ChannelId,
        message: OutgoingMessage,
    ) -> Result<MessageId, TransportError>;
    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: OutgoingMessage,
    ) -> Result<(), TransportError>;
    async fn delete_message(&self, channel: ChannelId, message: MessageId)
        -> Result<(), TransportError>;
    async fn fetch_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<ChatMessage>, TransportError>;
    async fn add_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), TransportError>;
    async fn trigger_typing(&self, channel: ChannelId) -> Result<(), TransportError>;

    // Channel Operations
    async fn create_channel(
        &self,
        category: Option<ChannelId>,
        name: &str,
        topic: &str,
    ) -> Result<ChannelInfo, TransportError>;
    async fn delete_channel(&self, channel: ChannelId) -> Result<(), TransportError>;
    async fn fetch_channel(&self, channel: ChannelId) -> Result<Option<ChannelInfo>, TransportError>;
    async fn category_channels(&self, category: ChannelId)
        -> Result<Vec<ChannelInfo>, TransportError>;
    /// Opens (or returns) the private channel with a user.
    async fn private_channel(&self, user: UserId) -> Result<ChannelId, TransportError>;
}

/// Data persistence contract for blocks, closures, logs and message links.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Probed once at startup; failure is fatal.
    async fn ping(&self) -> anyhow::Result<()>;

    // Block Operations
    async fn get_block(&self, subject: UserId) -> anyhow::Result<Option<BlockEntry>>;
    /// Returns `true` when the entry was inserted, `false` if one existed.
    async fn insert_block_if_absent(&self, entry: &BlockEntry) -> anyhow::Result<bool>;
    async fn upsert_block(&self, entry: &BlockEntry) -> anyhow::Result<()>;
    async fn remove_block(&self, subject: UserId) -> anyhow::Result<bool>;
    async fn list_blocks(&self) -> anyhow::Result<Vec<BlockEntry>>;
    async fn is_whitelisted(&self, subject: UserId) -> anyhow::Result<bool>;
    async fn set_whitelisted(&self, subject: UserId, whitelisted: bool) -> anyhow::Result<()>;

    // Closure Operations
    async fn save_closure(&self, closure: &PendingClosure) -> anyhow::Result<()>;
    async fn remove_closure(&self, recipient: UserId) -> anyhow::Result<bool>;
    async fn list_closures(&self) -> anyhow::Result<Vec<PendingClosure>>;

    // Log Operations
    async fn create_log(&self, log: &ThreadLog) -> anyhow::Result<()>;
    async fn append_log(&self, channel: ChannelId, entry: &LogEntry) -> anyhow::Result<()>;
    async fn edit_log_entry(&self, message: MessageId, content: &str) -> anyhow::Result<bool>;
    async fn close_log(
        &self,
        channel: ChannelId,
        closed: &ClosedLog,
    ) -> anyhow::Result<Option<ThreadLog>>;
    /// Matches recipient names, message content and log keys.
    async fn search_logs(&self, query: &str, limit: usize) -> anyhow::Result<Vec<ThreadLog>>;

    // Link Operations
    async fn save_link(&self, link: &MessageLink) -> anyhow::Result<()>;
    /// Looks a message up by either its relay-side or private-side id.
    async fn find_link(&self, message: MessageId) -> anyhow::Result<Option<MessageLink>>;
}

/// Backing storage for the runtime [`crate::config::ConfigCache`].
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<(String, String)>>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    /// Removes the key, returning the previous value.
    async fn remove(&self, key: &str) -> anyhow::Result<Option<String>>;
}

/// Operator identity contract for the HTTP surface.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait OperatorAuth: Send + Sync {
    /// Verifies a presented operator key against a stored hash.
    async fn verify_operator_key(&self, key: &str, hash: &str) -> bool;
}
