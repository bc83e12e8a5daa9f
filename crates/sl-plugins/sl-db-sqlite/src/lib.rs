//! # sl-db-sqlite Implementation
//!
//! This module implements the data mapping between the SQLite relational model
//! and the `sl-core` domain models. One database backs both the relay store
//! and the runtime config source.
//!
//! Platform ids are stored as TEXT; they are unsigned 64-bit values and
//! SQLite integers are signed.

use std::num::ParseIntError;
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use sl_core::models::{
    BlockEntry, ChannelId, ClosedLog, Closer, LinkOrigin, LogEntry, LogKind, MessageId,
    MessageLink, PendingClosure, ThreadLog, UserId,
};
use sl_core::traits::{ConfigSource, RelayStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS blocks (
        subject_id TEXT PRIMARY KEY,
        reason TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS whitelist (
        subject_id TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS closures (
        recipient_id TEXT PRIMARY KEY,
        fire_at TEXT NOT NULL,
        doc TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS logs (
        key TEXT PRIMARY KEY,
        recipient_id TEXT NOT NULL,
        recipient_name TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        closed_at TEXT,
        closer TEXT,
        close_message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS logs_by_channel ON logs (channel_id)",
    "CREATE TABLE IF NOT EXISTS log_messages (
        message_id TEXT PRIMARY KEY,
        log_key TEXT NOT NULL REFERENCES logs (key),
        author_id TEXT NOT NULL,
        author_name TEXT NOT NULL,
        content TEXT NOT NULL,
        kind TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS log_messages_by_log ON log_messages (log_key)",
    "CREATE TABLE IF NOT EXISTS message_links (
        relay_message TEXT PRIMARY KEY,
        recipient_id TEXT NOT NULL,
        relay_channel TEXT NOT NULL,
        private_channel TEXT NOT NULL,
        private_message TEXT NOT NULL,
        origin TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS message_links_by_private ON message_links (private_message)",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects and creates the schema if needed.
    ///
    /// # Developer Note
    /// An in-memory database lives only as long as its connection, so the
    /// pool is pinned to a single connection that never expires.
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("sqlite schema ready");
        Ok(())
    }

    /// The most recent log still open for a relay channel.
    async fn open_log_key(&self, channel: ChannelId) -> anyhow::Result<Option<String>> {
        let key = sqlx::query_scalar::<_, String>(
            "SELECT key FROM logs WHERE channel_id = ? AND closed_at IS NULL
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(channel.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }
}

// Helpers for row mapping

fn id<T>(row: &SqliteRow, column: &str) -> anyhow::Result<T>
where
    T: FromStr<Err = ParseIntError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .with_context(|| format!("column {column} holds a malformed id: {raw:?}"))
}

fn kind_to_str(kind: LogKind) -> &'static str {
    match kind {
        LogKind::ThreadMessage => "thread_message",
        LogKind::Reply => "reply",
        LogKind::Internal => "internal",
    }
}

fn origin_to_str(origin: LinkOrigin) -> &'static str {
    match origin {
        LinkOrigin::Recipient => "recipient",
        LinkOrigin::Operator => "operator",
    }
}

fn block_from_row(row: &SqliteRow) -> anyhow::Result<BlockEntry> {
    Ok(BlockEntry {
        subject_id: id(row, "subject_id")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> anyhow::Result<ThreadLog> {
    let closer = row
        .try_get::<Option<String>, _>("closer")?
        .map(|doc| serde_json::from_str::<Closer>(&doc))
        .transpose()?;
    Ok(ThreadLog {
        key: row.try_get("key")?,
        recipient_id: id(row, "recipient_id")?,
        recipient_name: row.try_get("recipient_name")?,
        channel_id: id(row, "channel_id")?,
        created_at: row.try_get("created_at")?,
        closed_at: row.try_get("closed_at")?,
        closer,
        close_message: row.try_get("close_message")?,
    })
}

fn link_from_row(row: &SqliteRow) -> anyhow::Result<MessageLink> {
    let origin = match row.try_get::<String, _>("origin")?.as_str() {
        "operator" => LinkOrigin::Operator,
        _ => LinkOrigin::Recipient,
    };
    Ok(MessageLink {
        recipient_id: id(row, "recipient_id")?,
        relay_channel: id(row, "relay_channel")?,
        relay_message: id(row, "relay_message")?,
        private_channel: id(row, "private_channel")?,
        private_message: id(row, "private_message")?,
        origin,
    })
}

/// `%needle%` with LIKE wildcards in the needle escaped.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait]
impl RelayStore for SqliteStore {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_block(&self, subject: UserId) -> anyhow::Result<Option<BlockEntry>> {
        let row = sqlx::query("SELECT subject_id, reason, created_at FROM blocks WHERE subject_id = ?")
            .bind(subject.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(block_from_row).transpose()
    }

    /// Atomic: relies on the primary key, so concurrent evaluations of the
    /// same subject insert exactly once.
    async fn insert_block_if_absent(&self, entry: &BlockEntry) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO blocks (subject_id, reason, created_at) VALUES (?, ?, ?)",
        )
        .bind(entry.subject_id.to_string())
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_block(&self, entry: &BlockEntry) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO blocks (subject_id, reason, created_at) VALUES (?, ?, ?)
             ON CONFLICT (subject_id) DO UPDATE SET reason = excluded.reason, created_at = excluded.created_at",
        )
        .bind(entry.subject_id.to_string())
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_block(&self, subject: UserId) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM blocks WHERE subject_id = ?")
            .bind(subject.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_blocks(&self) -> anyhow::Result<Vec<BlockEntry>> {
        let rows = sqlx::query("SELECT subject_id, reason, created_at FROM blocks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(block_from_row).collect()
    }

    async fn is_whitelisted(&self, subject: UserId) -> anyhow::Result<bool> {
        let found = sqlx::query("SELECT 1 FROM whitelist WHERE subject_id = ?")
            .bind(subject.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn set_whitelisted(&self, subject: UserId, whitelisted: bool) -> anyhow::Result<()> {
        let sql = if whitelisted {
            "INSERT OR IGNORE INTO whitelist (subject_id) VALUES (?)"
        } else {
            "DELETE FROM whitelist WHERE subject_id = ?"
        };
        sqlx::query(sql)
            .bind(subject.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_closure(&self, closure: &PendingClosure) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO closures (recipient_id, fire_at, doc) VALUES (?, ?, ?)
             ON CONFLICT (recipient_id) DO UPDATE SET fire_at = excluded.fire_at, doc = excluded.doc",
        )
        .bind(closure.recipient_id.to_string())
        .bind(closure.fire_at)
        .bind(serde_json::to_string(closure)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_closure(&self, recipient: UserId) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM closures WHERE recipient_id = ?")
            .bind(recipient.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unreadable documents are skipped with a warning rather than failing
    /// recovery for every other closure.
    async fn list_closures(&self) -> anyhow::Result<Vec<PendingClosure>> {
        let rows = sqlx::query("SELECT recipient_id, doc FROM closures ORDER BY fire_at")
            .fetch_all(&self.pool)
            .await?;
        let mut closures = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: String = row.try_get("doc")?;
            match serde_json::from_str::<PendingClosure>(&doc) {
                Ok(closure) => closures.push(closure),
                Err(e) => {
                    let recipient: String = row.try_get("recipient_id")?;
                    warn!(recipient = %recipient, error = %e, "skipping unreadable closure record");
                }
            }
        }
        Ok(closures)
    }

    async fn create_log(&self, log: &ThreadLog) -> anyhow::Result<()> {
        let closer = log.closer.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO logs (key, recipient_id, recipient_name, channel_id, created_at, closed_at, closer, close_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.key)
        .bind(log.recipient_id.to_string())
        .bind(&log.recipient_name)
        .bind(log.channel_id.to_string())
        .bind(log.created_at)
        .bind(log.closed_at)
        .bind(closer)
        .bind(&log.close_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_log(&self, channel: ChannelId, entry: &LogEntry) -> anyhow::Result<()> {
        let Some(log_key) = self.open_log_key(channel).await? else {
            warn!(channel = %channel, message = %entry.message_id, "no open log for channel, entry dropped");
            return Ok(());
        };
        sqlx::query(
            "INSERT OR REPLACE INTO log_messages (message_id, log_key, author_id, author_name, content, kind, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.message_id.to_string())
        .bind(log_key)
        .bind(entry.author.id.to_string())
        .bind(&entry.author.name)
        .bind(&entry.content)
        .bind(kind_to_str(entry.kind))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn edit_log_entry(&self, message: MessageId, content: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE log_messages SET content = ? WHERE message_id = ?")
            .bind(content)
            .bind(message.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn close_log(
        &self,
        channel: ChannelId,
        closed: &ClosedLog,
    ) -> anyhow::Result<Option<ThreadLog>> {
        let Some(key) = self.open_log_key(channel).await? else {
            return Ok(None);
        };
        sqlx::query("UPDATE logs SET closed_at = ?, closer = ?, close_message = ? WHERE key = ?")
            .bind(closed.closed_at)
            .bind(serde_json::to_string(&closed.closer)?)
            .bind(&closed.message)
            .bind(&key)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT * FROM logs WHERE key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn search_logs(&self, query: &str, limit: usize) -> anyhow::Result<Vec<ThreadLog>> {
        let rows = sqlx::query(
            "SELECT DISTINCT l.* FROM logs l
             LEFT JOIN log_messages m ON m.log_key = l.key
             WHERE l.recipient_name LIKE ?1 ESCAPE '\\'
                OR m.content LIKE ?1 ESCAPE '\\'
                OR l.key = ?2
                OR l.recipient_id = ?2
             ORDER BY l.created_at DESC
             LIMIT ?3",
        )
        .bind(like_pattern(query))
        .bind(query)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn save_link(&self, link: &MessageLink) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO message_links
             (relay_message, recipient_id, relay_channel, private_channel, private_message, origin)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(link.relay_message.to_string())
        .bind(link.recipient_id.to_string())
        .bind(link.relay_channel.to_string())
        .bind(link.private_channel.to_string())
        .bind(link.private_message.to_string())
        .bind(origin_to_str(link.origin))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A relay-side match wins over a private-side one.
    async fn find_link(&self, message: MessageId) -> anyhow::Result<Option<MessageLink>> {
        let row = sqlx::query(
            "SELECT * FROM message_links
             WHERE relay_message = ?1 OR private_message = ?1
             ORDER BY relay_message = ?1 DESC
             LIMIT 1",
        )
        .bind(message.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }
}

#[async_trait]
impl ConfigSource for SqliteStore {
    async fn load_all(&self) -> anyhow::Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> anyhow::Result<(String, String)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads then deletes inside one transaction so the returned value is
    /// the one that was removed.
    async fn remove(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM config WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use sl_core::models::UserRef;

    async fn store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn user(id: u64) -> UserRef {
        UserRef {
            id: UserId(id),
            name: format!("user{id}"),
        }
    }

    fn open_log(recipient: u64, channel: u64) -> ThreadLog {
        ThreadLog {
            key: format!("log{recipient}"),
            recipient_id: UserId(recipient),
            recipient_name: format!("user{recipient}"),
            channel_id: ChannelId(channel),
            created_at: Utc::now(),
            closed_at: None,
            closer: None,
            close_message: None,
        }
    }

    fn entry(message: u64, content: &str) -> LogEntry {
        LogEntry {
            message_id: MessageId(message),
            author: user(42),
            content: content.into(),
            kind: LogKind::ThreadMessage,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_block_insert_if_absent_is_exclusive() {
        let store = store().await;
        store.ping().await.unwrap();
        let entry = BlockEntry {
            subject_id: UserId(u64::MAX),
            reason: "System Message: New Account.".into(),
            created_at: Utc::now(),
        };

        assert!(store.insert_block_if_absent(&entry).await.unwrap());
        assert!(!store.insert_block_if_absent(&entry).await.unwrap());
        assert_eq!(
            store.get_block(UserId(u64::MAX)).await.unwrap().unwrap().reason,
            entry.reason
        );

        store
            .upsert_block(&BlockEntry {
                reason: "spam".into(),
                ..entry.clone()
            })
            .await
            .unwrap();
        assert_eq!(store.list_blocks().await.unwrap()[0].reason, "spam");
        assert!(store.remove_block(UserId(u64::MAX)).await.unwrap());
        assert!(!store.remove_block(UserId(u64::MAX)).await.unwrap());
    }

    #[tokio::test]
    async fn test_whitelist_toggle() {
        let store = store().await;
        store.set_whitelisted(UserId(5), true).await.unwrap();
        store.set_whitelisted(UserId(5), true).await.unwrap();
        assert!(store.is_whitelisted(UserId(5)).await.unwrap());
        store.set_whitelisted(UserId(5), false).await.unwrap();
        assert!(!store.is_whitelisted(UserId(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_closures_are_keyed_by_recipient() {
        let store = store().await;
        let closure = PendingClosure {
            recipient_id: UserId(42),
            fire_at: Utc::now() + Duration::hours(1),
            closer: Closer::Automatic,
            silent: true,
            delete_channel: true,
            message: Some("bye".into()),
            auto_close: true,
        };
        store.save_closure(&closure).await.unwrap();
        let replaced = PendingClosure {
            fire_at: closure.fire_at + Duration::hours(1),
            closer: Closer::user(UserId(7), "moderator"),
            auto_close: false,
            ..closure.clone()
        };
        store.save_closure(&replaced).await.unwrap();

        assert_eq!(store.list_closures().await.unwrap(), vec![replaced]);
        assert!(store.remove_closure(UserId(42)).await.unwrap());
        assert!(store.list_closures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_lifecycle_and_search() {
        let store = store().await;
        store.create_log(&open_log(42, 20)).await.unwrap();
        store.append_log(ChannelId(20), &entry(1, "my order 100% failed")).await.unwrap();
        store.append_log(ChannelId(20), &entry(2, "still waiting")).await.unwrap();
        assert!(store.edit_log_entry(MessageId(2), "never mind").await.unwrap());
        assert!(!store.edit_log_entry(MessageId(99), "ghost").await.unwrap());

        let closed = store
            .close_log(
                ChannelId(20),
                &ClosedLog {
                    closer: Closer::user(UserId(7), "moderator"),
                    message: Some("Resolved.".into()),
                    closed_at: Utc::now(),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.closer, Some(Closer::user(UserId(7), "moderator")));
        assert!(closed.closed_at.is_some());
        // Closed logs take no more entries and cannot be closed twice.
        assert!(store
            .close_log(
                ChannelId(20),
                &ClosedLog {
                    closer: Closer::Automatic,
                    message: None,
                    closed_at: Utc::now(),
                },
            )
            .await
            .unwrap()
            .is_none());

        assert_eq!(store.search_logs("USER42", 10).await.unwrap().len(), 1);
        assert_eq!(store.search_logs("never mind", 10).await.unwrap().len(), 1);
        assert_eq!(store.search_logs("100%", 10).await.unwrap().len(), 1);
        assert_eq!(store.search_logs("log42", 10).await.unwrap().len(), 1);
        assert!(store.search_logs("still waiting", 10).await.unwrap().is_empty());
        assert!(store.search_logs("user42", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_links_resolve_from_either_side() {
        let store = store().await;
        let mirror = MessageLink {
            recipient_id: UserId(42),
            relay_channel: ChannelId(20),
            relay_message: MessageId(300),
            private_channel: ChannelId(90),
            private_message: MessageId(400),
            origin: LinkOrigin::Operator,
        };
        let command = MessageLink {
            relay_message: MessageId(400),
            private_message: MessageId(401),
            ..mirror.clone()
        };
        store.save_link(&mirror).await.unwrap();
        store.save_link(&command).await.unwrap();

        assert_eq!(store.find_link(MessageId(300)).await.unwrap(), Some(mirror));
        // 400 is both a relay id and a private id; the relay side wins.
        assert_eq!(store.find_link(MessageId(400)).await.unwrap(), Some(command.clone()));
        assert_eq!(store.find_link(MessageId(401)).await.unwrap(), Some(command));
        assert_eq!(store.find_link(MessageId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_config_remove_returns_previous_value() {
        let store = store().await;
        store.set("close_emoji", "🔒").await.unwrap();
        store.set("close_emoji", "🔐").await.unwrap();
        assert_eq!(store.get("close_emoji").await.unwrap().as_deref(), Some("🔐"));
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        assert_eq!(store.remove("close_emoji").await.unwrap().as_deref(), Some("🔐"));
        assert_eq!(store.remove("close_emoji").await.unwrap(), None);
        assert_eq!(store.get("close_emoji").await.unwrap(), None);
    }
}
