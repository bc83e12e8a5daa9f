//! # ThreadRegistry
//!
//! In-memory index of active threads, by recipient and by relay channel.
//!
//! # Developer Note
//! Lookups never touch I/O. Creation is serialized per recipient by a lock
//! held across the channel-creation call; it is the only lock in the relay
//! core that spans an `.await` on the transport.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{keys, ConfigCache};
use crate::error::Result;
use crate::models::{Author, ChannelId, ChannelInfo, ChannelKind, OutgoingMessage, ThreadLog, UserId};
use crate::thread::Thread;
use crate::traits::{ChatTransport, RelayStore};

static TOPIC_RECIPIENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"User ID: (\d+)").expect("topic pattern is valid"));

/// Relay channel topic carrying the recipient id.
pub fn channel_topic(recipient_id: UserId) -> String {
    format!("User ID: {recipient_id}")
}

/// Recipient id parsed back out of a relay channel topic.
pub fn topic_recipient(topic: &str) -> Option<UserId> {
    TOPIC_RECIPIENT
        .captures(topic)
        .and_then(|caps| caps[1].parse().ok())
}

/// Channel-safe name: lowercase alphanumerics and dashes, suffixed with the
/// last four digits of the id so equal names stay distinct.
pub fn channel_name(name: &str, recipient_id: UserId) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "recipient" } else { slug };
    let slug: String = slug.chars().take(90).collect();
    format!("{slug}-{:04}", recipient_id.0 % 10_000)
}

pub struct ThreadRegistry {
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn RelayStore>,
    config: Arc<ConfigCache>,
    by_recipient: DashMap<UserId, Arc<Thread>>,
    by_channel: DashMap<ChannelId, UserId>,
    creation_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl ThreadRegistry {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn RelayStore>,
        config: Arc<ConfigCache>,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            by_recipient: DashMap::new(),
            by_channel: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    pub fn find_by_recipient(&self, recipient_id: UserId) -> Option<Arc<Thread>> {
        self.by_recipient.get(&recipient_id).map(|t| t.clone())
    }

    pub fn find_by_channel(&self, channel_id: ChannelId) -> Option<Arc<Thread>> {
        let recipient_id = *self.by_channel.get(&channel_id)?;
        self.find_by_recipient(recipient_id)
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.by_recipient.iter().map(|t| t.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_recipient.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_recipient.is_empty()
    }

    /// Recipients with a creation in flight.
    pub fn pending_creations(&self) -> usize {
        self.creation_locks.len()
    }

    /// Returns the recipient's thread, creating its relay channel if needed.
    ///
    /// `private_channel` is the channel the first message arrived in, when
    /// known; the creation response is sent there.
    pub async fn find_or_create(
        &self,
        recipient: &Author,
        private_channel: Option<ChannelId>,
    ) -> Result<Arc<Thread>> {
        if let Some(thread) = self.find_by_recipient(recipient.id) {
            return Ok(thread);
        }

        // 1. Serialize creation per recipient, then re-check under the lock.
        let lock = self
            .creation_locks
            .entry(recipient.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if let Some(thread) = self.find_by_recipient(recipient.id) {
            return Ok(thread);
        }

        // 2. Channel. The lock entry goes either way; waiters hold their clone.
        let channel = match self.create_channel(recipient).await {
            Ok(channel) => channel,
            Err(e) => {
                self.creation_locks.remove(&recipient.id);
                return Err(e);
            }
        };
        let thread = Arc::new(Thread::new(recipient.id, channel.id, channel.created_at));
        self.insert(thread.clone());
        self.creation_locks.remove(&recipient.id);
        info!(recipient = %recipient.id, channel = %channel.id, "thread created");

        // 3. Audit log and notices. Failures here leave a usable thread.
        if let Err(e) = self
            .store
            .create_log(&ThreadLog::open(recipient, channel.id, channel.created_at))
            .await
        {
            warn!(recipient = %recipient.id, error = %e, "could not create thread log");
        }
        self.announce(recipient, &channel, private_channel).await?;

        Ok(thread)
    }

    async fn create_channel(&self, recipient: &Author) -> Result<ChannelInfo> {
        let category = self.relay_category().await?;
        Ok(self
            .transport
            .create_channel(
                category,
                &channel_name(&recipient.name, recipient.id),
                &channel_topic(recipient.id),
            )
            .await?)
    }

    async fn announce(
        &self,
        recipient: &Author,
        channel: &ChannelInfo,
        private_channel: Option<ChannelId>,
    ) -> Result<()> {
        let mut genesis = format!(
            "New thread with {} ({}).\nAccount created {}.",
            recipient.name,
            recipient.id,
            recipient.created_at.format("%Y-%m-%d")
        );
        if let Some(joined) = recipient.joined_at {
            genesis.push_str(&format!("\nJoined {}.", joined.format("%Y-%m-%d")));
        }
        if let Err(e) = self
            .transport
            .send(channel.id, OutgoingMessage::titled(recipient.name.clone(), genesis).stamped(Utc::now()))
            .await
        {
            warn!(channel = %channel.id, error = %e, "could not post genesis notice");
        }

        let private = match private_channel {
            Some(id) => id,
            None => match self.transport.private_channel(recipient.id).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(recipient = %recipient.id, error = %e, "no private channel for creation response");
                    return Ok(());
                }
            },
        };
        let response = OutgoingMessage::titled(
            "Thread created",
            self.config.text(keys::THREAD_CREATION_RESPONSE).await?,
        )
        .with_footer("Your message has been sent")
        .stamped(channel.created_at);
        let notice = match self.transport.send(private, response).await {
            Ok(id) => id,
            Err(e) => {
                warn!(recipient = %recipient.id, error = %e, "could not send creation response");
                return Ok(());
            }
        };

        if self.config.flag(keys::RECIPIENT_THREAD_CLOSE).await? {
            if let Some(emoji) = self.config.emoji(keys::CLOSE_EMOJI).await? {
                if let Err(e) = self.transport.add_reaction(private, notice, &emoji).await {
                    warn!(recipient = %recipient.id, error = %e, "could not add close reaction");
                }
            }
        }
        Ok(())
    }

    fn insert(&self, thread: Arc<Thread>) {
        self.by_channel
            .insert(thread.relay_channel_id(), thread.recipient_id());
        self.by_recipient.insert(thread.recipient_id(), thread);
    }

    /// Evicts a thread from both indices. Idempotent; a newer thread for the
    /// same recipient is left alone.
    pub fn remove(&self, thread: &Thread) {
        self.by_recipient.remove_if(&thread.recipient_id(), |_, current| {
            current.relay_channel_id() == thread.relay_channel_id()
        });
        self.by_channel
            .remove_if(&thread.relay_channel_id(), |_, recipient| *recipient == thread.recipient_id());
        debug!(recipient = %thread.recipient_id(), "thread evicted");
    }

    /// Rebuilds the indices from the relay category's channels.
    pub async fn populate_cache(&self) -> Result<usize> {
        let Some(category) = self.relay_category().await? else {
            info!("no relay category configured, starting with an empty registry");
            return Ok(0);
        };
        let log_channel = self.config.channel(keys::LOG_CHANNEL_ID).await?;

        let mut restored = 0;
        for channel in self.transport.category_channels(category).await? {
            if Some(channel.id) == log_channel || channel.kind != ChannelKind::Text {
                continue;
            }
            let Some(recipient_id) = channel.topic.as_deref().and_then(topic_recipient) else {
                warn!(channel = %channel.id, name = %channel.name, "relay channel has no recipient, skipping");
                continue;
            };
            if self.by_recipient.contains_key(&recipient_id) {
                warn!(channel = %channel.id, recipient = %recipient_id, "second channel for recipient, skipping");
                continue;
            }
            self.insert(Arc::new(Thread::new(recipient_id, channel.id, channel.created_at)));
            restored += 1;
        }
        info!(restored, "thread registry populated");
        Ok(restored)
    }

    /// The category relay channels are created in, if configured and live.
    pub async fn relay_category(&self) -> Result<Option<ChannelId>> {
        Ok(self
            .config
            .resolve_channel(keys::MAIN_CATEGORY_ID, ChannelKind::Category, &*self.transport)
            .await?
            .map(|c| c.id))
    }
}
