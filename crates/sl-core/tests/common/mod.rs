//! In-memory ports shared by the sl-core integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sl_core::{
    Author, BlockEntry, ChannelId, ChannelInfo, ChannelKind, ChatMessage, ChatTransport,
    ClosedLog, ConfigSource, LogEntry, MessageId, MessageLink, OutgoingMessage, PendingClosure,
    Relay, RelayStore, ThreadLog, TransportError, UserId,
};

pub const BOT: UserId = UserId(1);
pub const CATEGORY: ChannelId = ChannelId(10);
pub const LOG_CHANNEL: ChannelId = ChannelId(11);

// ---- Transport

#[derive(Debug, Clone)]
pub struct Sent {
    pub channel: ChannelId,
    pub id: MessageId,
    pub message: OutgoingMessage,
}

#[derive(Default)]
pub struct FakeTransport {
    next_id: AtomicU64,
    pub channels: Mutex<HashMap<ChannelId, ChannelInfo>>,
    pub sent: Mutex<Vec<Sent>>,
    pub reactions: Mutex<Vec<(ChannelId, MessageId, String)>>,
    pub edits: Mutex<Vec<(ChannelId, MessageId, OutgoingMessage)>>,
    pub deleted_messages: Mutex<Vec<(ChannelId, MessageId)>>,
    pub deleted_channels: Mutex<Vec<ChannelId>>,
    pub typing: Mutex<Vec<ChannelId>>,
    pub creations: AtomicUsize,
    /// Slows channel creation down to widen race windows.
    pub create_delay: Mutex<Option<StdDuration>>,
    /// Private channels of these users refuse messages.
    pub unreachable: Mutex<Vec<UserId>>,
    /// The next N `fetch_channel` calls fail.
    pub failing_fetches: AtomicUsize,
    /// The next N `create_channel` calls fail.
    pub failing_creations: AtomicUsize,
}

/// Consumes one injected failure, if any are left.
pub fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FakeTransport {
    pub fn new() -> Self {
        let transport = Self {
            next_id: AtomicU64::new(1_000),
            ..Self::default()
        };
        transport.add_channel(ChannelInfo {
            id: CATEGORY,
            name: "threads".into(),
            kind: ChannelKind::Category,
            topic: None,
            category: None,
            created_at: Utc::now(),
        });
        transport.add_channel(ChannelInfo {
            id: LOG_CHANNEL,
            name: "thread-logs".into(),
            kind: ChannelKind::Text,
            topic: None,
            category: Some(CATEGORY),
            created_at: Utc::now(),
        });
        transport
    }

    pub fn add_channel(&self, info: ChannelInfo) {
        self.channels.lock().unwrap().insert(info.id, info);
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn private_of(user: UserId) -> ChannelId {
        ChannelId(900_000 + user.0)
    }

    pub fn sent_to(&self, channel: ChannelId) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.channel == channel)
            .cloned()
            .collect()
    }

    /// Posts a bot message directly, as an older message would have been.
    pub fn seed_message(&self, channel: ChannelId, message: OutgoingMessage) -> MessageId {
        let id = MessageId(self.next());
        self.sent.lock().unwrap().push(Sent {
            channel,
            id,
            message,
        });
        id
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    fn bot_id(&self) -> UserId {
        BOT
    }

    async fn send(&self, channel: ChannelId, message: OutgoingMessage) -> Result<MessageId, TransportError> {
        let unreachable = self.unreachable.lock().unwrap().iter().any(|u| Self::private_of(*u) == channel);
        if unreachable {
            return Err(TransportError::Forbidden("cannot message this user".into()));
        }
        Ok(self.seed_message(channel, message))
    }

    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: OutgoingMessage,
    ) -> Result<(), TransportError> {
        self.edits.lock().unwrap().push((channel, message, content));
        Ok(())
    }

    async fn delete_message(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError> {
        self.deleted_messages.lock().unwrap().push((channel, message));
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<ChatMessage>, TransportError> {
        let sent = self.sent.lock().unwrap();
        Ok(sent
            .iter()
            .find(|s| s.channel == channel && s.id == message)
            .map(|s| ChatMessage {
                id: s.id,
                channel_id: s.channel,
                author: Author {
                    id: BOT,
                    name: "staffline".into(),
                    bot: true,
                    created_at: Utc::now(),
                    joined_at: None,
                },
                content: s.message.body.clone(),
                attachments: vec![],
                private: true,
                stamp: s.message.stamp,
                sent_at: Utc::now(),
            }))
    }

    async fn add_reaction(&self, channel: ChannelId, message: MessageId, emoji: &str) -> Result<(), TransportError> {
        self.reactions
            .lock()
            .unwrap()
            .push((channel, message, emoji.to_string()));
        Ok(())
    }

    async fn trigger_typing(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.typing.lock().unwrap().push(channel);
        Ok(())
    }

    async fn create_channel(
        &self,
        category: Option<ChannelId>,
        name: &str,
        topic: &str,
    ) -> Result<ChannelInfo, TransportError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.failing_creations) {
            return Err(TransportError::Other("status 500".into()));
        }
        self.creations.fetch_add(1, Ordering::SeqCst);
        let info = ChannelInfo {
            id: ChannelId(self.next()),
            name: name.to_string(),
            kind: ChannelKind::Text,
            topic: Some(topic.to_string()),
            category,
            created_at: Utc::now(),
        };
        self.add_channel(info.clone());
        Ok(info)
    }

    async fn delete_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        match self.channels.lock().unwrap().remove(&channel) {
            Some(_) => {
                self.deleted_channels.lock().unwrap().push(channel);
                Ok(())
            }
            None => Err(TransportError::NotFound(format!("channel {channel}"))),
        }
    }

    async fn fetch_channel(&self, channel: ChannelId) -> Result<Option<ChannelInfo>, TransportError> {
        if take_failure(&self.failing_fetches) {
            return Err(TransportError::Other("status 503".into()));
        }
        Ok(self.channels.lock().unwrap().get(&channel).cloned())
    }

    async fn category_channels(&self, category: ChannelId) -> Result<Vec<ChannelInfo>, TransportError> {
        Ok(self
            .channels
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.category == Some(category))
            .cloned()
            .collect())
    }

    async fn private_channel(&self, user: UserId) -> Result<ChannelId, TransportError> {
        Ok(Self::private_of(user))
    }
}

// ---- Store

#[derive(Default)]
pub struct MemoryStore {
    pub down: bool,
    pub blocks: Mutex<HashMap<UserId, BlockEntry>>,
    pub whitelist: Mutex<Vec<UserId>>,
    pub closures: Mutex<HashMap<UserId, PendingClosure>>,
    pub logs: Mutex<Vec<(ThreadLog, Vec<LogEntry>)>>,
    pub links: Mutex<Vec<MessageLink>>,
    /// The next N `find_link` calls fail.
    pub failing_link_reads: AtomicUsize,
    pub closures_read_only: AtomicBool,
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        if self.down {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn get_block(&self, subject: UserId) -> anyhow::Result<Option<BlockEntry>> {
        Ok(self.blocks.lock().unwrap().get(&subject).cloned())
    }

    async fn insert_block_if_absent(&self, entry: &BlockEntry) -> anyhow::Result<bool> {
        let mut blocks = self.blocks.lock().unwrap();
        if blocks.contains_key(&entry.subject_id) {
            return Ok(false);
        }
        blocks.insert(entry.subject_id, entry.clone());
        Ok(true)
    }

    async fn upsert_block(&self, entry: &BlockEntry) -> anyhow::Result<()> {
        self.blocks.lock().unwrap().insert(entry.subject_id, entry.clone());
        Ok(())
    }

    async fn remove_block(&self, subject: UserId) -> anyhow::Result<bool> {
        Ok(self.blocks.lock().unwrap().remove(&subject).is_some())
    }

    async fn list_blocks(&self) -> anyhow::Result<Vec<BlockEntry>> {
        Ok(self.blocks.lock().unwrap().values().cloned().collect())
    }

    async fn is_whitelisted(&self, subject: UserId) -> anyhow::Result<bool> {
        Ok(self.whitelist.lock().unwrap().contains(&subject))
    }

    async fn set_whitelisted(&self, subject: UserId, whitelisted: bool) -> anyhow::Result<()> {
        let mut list = self.whitelist.lock().unwrap();
        list.retain(|s| *s != subject);
        if whitelisted {
            list.push(subject);
        }
        Ok(())
    }

    async fn save_closure(&self, closure: &PendingClosure) -> anyhow::Result<()> {
        if self.closures_read_only.load(Ordering::SeqCst) {
            anyhow::bail!("attempt to write a readonly database");
        }
        self.closures
            .lock()
            .unwrap()
            .insert(closure.recipient_id, closure.clone());
        Ok(())
    }

    async fn remove_closure(&self, recipient: UserId) -> anyhow::Result<bool> {
        Ok(self.closures.lock().unwrap().remove(&recipient).is_some())
    }

    async fn list_closures(&self) -> anyhow::Result<Vec<PendingClosure>> {
        Ok(self.closures.lock().unwrap().values().cloned().collect())
    }

    async fn create_log(&self, log: &ThreadLog) -> anyhow::Result<()> {
        self.logs.lock().unwrap().push((log.clone(), vec![]));
        Ok(())
    }

    async fn append_log(&self, channel: ChannelId, entry: &LogEntry) -> anyhow::Result<()> {
        let mut logs = self.logs.lock().unwrap();
        if let Some((_, entries)) = logs.iter_mut().rev().find(|(log, _)| log.channel_id == channel) {
            entries.push(entry.clone());
        }
        Ok(())
    }

    async fn edit_log_entry(&self, message: MessageId, content: &str) -> anyhow::Result<bool> {
        let mut logs = self.logs.lock().unwrap();
        for (_, entries) in logs.iter_mut() {
            if let Some(entry) = entries.iter_mut().find(|e| e.message_id == message) {
                entry.content = content.to_string();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn close_log(&self, channel: ChannelId, closed: &ClosedLog) -> anyhow::Result<Option<ThreadLog>> {
        let mut logs = self.logs.lock().unwrap();
        Ok(logs
            .iter_mut()
            .rev()
            .find(|(log, _)| log.channel_id == channel && log.closed_at.is_none())
            .map(|(log, _)| {
                log.closed_at = Some(closed.closed_at);
                log.closer = Some(closed.closer.clone());
                log.close_message = closed.message.clone();
                log.clone()
            }))
    }

    async fn search_logs(&self, query: &str, limit: usize) -> anyhow::Result<Vec<ThreadLog>> {
        let query = query.to_lowercase();
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(log, entries)| {
                log.recipient_name.to_lowercase().contains(&query)
                    || log.key == query
                    || entries.iter().any(|e| e.content.to_lowercase().contains(&query))
            })
            .map(|(log, _)| log.clone())
            .take(limit)
            .collect())
    }

    async fn save_link(&self, link: &MessageLink) -> anyhow::Result<()> {
        self.links.lock().unwrap().push(link.clone());
        Ok(())
    }

    async fn find_link(&self, message: MessageId) -> anyhow::Result<Option<MessageLink>> {
        if take_failure(&self.failing_link_reads) {
            anyhow::bail!("database is locked");
        }
        let links = self.links.lock().unwrap();
        Ok(links
            .iter()
            .find(|l| l.relay_message == message)
            .or_else(|| links.iter().find(|l| l.private_message == message))
            .cloned())
    }
}

// ---- Config

#[derive(Default)]
pub struct MapConfig {
    pub values: Mutex<HashMap<String, String>>,
}

impl MapConfig {
    pub fn with(values: &[(&str, &str)]) -> Self {
        let config = Self::default();
        for (k, v) in values {
            config.values.lock().unwrap().insert(k.to_string(), v.to_string());
        }
        config
    }
}

#[async_trait]
impl ConfigSource for MapConfig {
    async fn load_all(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self.values.lock().unwrap().clone().into_iter().collect())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values.lock().unwrap().insert(key.into(), value.into());
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.lock().unwrap().remove(key))
    }
}

// ---- Helpers

pub struct Harness {
    pub relay: Arc<Relay>,
    pub transport: Arc<FakeTransport>,
    pub store: Arc<MemoryStore>,
    pub config: Arc<MapConfig>,
}

/// Config with the relay category and log channel wired up.
pub fn base_config(extra: &[(&str, &str)]) -> MapConfig {
    let category = CATEGORY.to_string();
    let log_channel = LOG_CHANNEL.to_string();
    let mut values = vec![
        (sl_core::keys::MAIN_CATEGORY_ID, category.as_str()),
        (sl_core::keys::LOG_CHANNEL_ID, log_channel.as_str()),
    ];
    values.extend_from_slice(extra);
    MapConfig::with(&values)
}

pub fn harness_with(transport: FakeTransport, store: MemoryStore, config: MapConfig) -> Harness {
    let transport = Arc::new(transport);
    let store = Arc::new(store);
    let config = Arc::new(config);
    let relay = Relay::new(transport.clone(), store.clone(), config.clone());
    Harness {
        relay,
        transport,
        store,
        config,
    }
}

pub async fn started(extra: &[(&str, &str)]) -> Harness {
    let harness = harness_with(FakeTransport::new(), MemoryStore::default(), base_config(extra));
    harness.relay.start().await.expect("relay starts");
    harness
}

pub fn author(id: u64, account_age: Duration) -> Author {
    Author {
        id: UserId(id),
        name: format!("user{id}"),
        bot: false,
        created_at: Utc::now() - account_age,
        joined_at: None,
    }
}

pub fn dm(id: u64, author: &Author, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        channel_id: FakeTransport::private_of(author.id),
        author: author.clone(),
        content: content.into(),
        attachments: vec![],
        private: true,
        stamp: None,
        sent_at: Utc::now(),
    }
}

pub fn operator() -> Author {
    Author {
        id: UserId(7),
        name: "moderator".into(),
        bot: false,
        created_at: Utc::now() - Duration::days(400),
        joined_at: None,
    }
}

pub fn in_channel(id: u64, channel: ChannelId, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        channel_id: channel,
        author: operator(),
        content: content.into(),
        attachments: vec![],
        private: false,
        stamp: None,
        sent_at: Utc::now(),
    }
}

/// Polls until `check` holds, advancing time in small steps.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    check()
}

pub fn ago(d: Duration) -> DateTime<Utc> {
    Utc::now() - d
}
