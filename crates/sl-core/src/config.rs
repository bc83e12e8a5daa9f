//! # ConfigCache
//!
//! Runtime bot configuration: a read-through cache over a [`ConfigSource`].
//!
//! Typed accessors validate on read. A stored value that fails validation is
//! removed from the source (and the cache) and the default is used instead,
//! so a bad value is reported once rather than on every event.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::duration::parse_iso8601;
use crate::error::Result;
use crate::models::{ChannelId, ChannelInfo, ChannelKind};
use crate::traits::{ChatTransport, ConfigSource};

/// Known configuration keys.
pub mod keys {
    pub const ACCOUNT_AGE: &str = "account_age";
    pub const GUILD_AGE: &str = "guild_age";
    pub const CLOSE_EMOJI: &str = "close_emoji";
    pub const SENT_EMOJI: &str = "sent_emoji";
    pub const BLOCKED_EMOJI: &str = "blocked_emoji";
    pub const RECIPIENT_THREAD_CLOSE: &str = "recipient_thread_close";
    pub const THREAD_AUTO_CLOSE: &str = "thread_auto_close";
    pub const THREAD_AUTO_CLOSE_SILENTLY: &str = "thread_auto_close_silently";
    pub const THREAD_AUTO_CLOSE_RESPONSE: &str = "thread_auto_close_response";
    pub const THREAD_CLOSE_RESPONSE: &str = "thread_close_response";
    pub const THREAD_CREATION_RESPONSE: &str = "thread_creation_response";
    pub const REPLY_WITHOUT_COMMAND: &str = "reply_without_command";
    pub const USER_TYPING: &str = "user_typing";
    pub const MOD_TYPING: &str = "mod_typing";
    pub const CLOSURE_CANCEL_POLICY: &str = "closure_cancel_policy";
    pub const LOG_CHANNEL_ID: &str = "log_channel_id";
    pub const MAIN_CATEGORY_ID: &str = "main_category_id";
}

const DEFAULTS: &[(&str, &str)] = &[
    (keys::CLOSE_EMOJI, "🔒"),
    (keys::SENT_EMOJI, "✅"),
    (keys::BLOCKED_EMOJI, "🚫"),
    (keys::RECIPIENT_THREAD_CLOSE, "false"),
    (keys::THREAD_AUTO_CLOSE_SILENTLY, "false"),
    (
        keys::THREAD_AUTO_CLOSE_RESPONSE,
        "This thread has been closed automatically due to inactivity after {timeout}.",
    ),
    (keys::THREAD_CLOSE_RESPONSE, "{closer} has closed this thread."),
    (
        keys::THREAD_CREATION_RESPONSE,
        "The staff team will get back to you as soon as possible.",
    ),
    (keys::REPLY_WITHOUT_COMMAND, "false"),
    (keys::USER_TYPING, "false"),
    (keys::MOD_TYPING, "false"),
    (keys::CLOSURE_CANCEL_POLICY, "all"),
];

/// Sentinel that turns an emoji feature off.
pub const DISABLE: &str = "disable";

static CUSTOM_EMOJI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<?a?:?[A-Za-z0-9_]{2,32}:\d{5,20}>?$").expect("emoji pattern is valid"));

/// Whether inbound recipient activity cancels a pending closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Any pending closure is cancelled, operator-scheduled ones included.
    All,
    /// Only inactivity auto-closures are cancelled.
    AutoOnly,
}

impl CancelPolicy {
    pub fn cancels(self, auto_close: bool) -> bool {
        match self {
            CancelPolicy::All => true,
            CancelPolicy::AutoOnly => auto_close,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(CancelPolicy::All),
            "auto" | "auto-only" | "auto_only" => Some(CancelPolicy::AutoOnly),
            _ => None,
        }
    }
}

pub struct ConfigCache {
    source: Arc<dyn ConfigSource>,
    /// `None` caches a confirmed absence.
    cache: DashMap<String, Option<String>>,
}

impl ConfigCache {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            cache: DashMap::new(),
        }
    }

    pub fn default_for(key: &str) -> Option<&'static str> {
        DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// Loads every stored key; later reads are served from memory.
    pub async fn populate(&self) -> Result<usize> {
        let entries = self.source.load_all().await?;
        let count = entries.len();
        for (key, value) in entries {
            self.cache.insert(key, Some(value));
        }
        debug!(count, "config cache populated");
        Ok(count)
    }

    /// The stored value, without falling back to the default.
    pub async fn stored(&self, key: &str) -> Result<Option<String>> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit.clone());
        }
        let value = self.source.get(key).await?;
        self.cache.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// The stored value, or the default when nothing is stored.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .stored(key)
            .await?
            .or_else(|| Self::default_for(key).map(str::to_string)))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.source.set(key, value).await?;
        self.cache.insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    /// Drops the stored value and returns the default that now applies.
    pub async fn remove(&self, key: &str) -> Result<Option<String>> {
        let previous = self.source.remove(key).await?;
        self.cache.insert(key.to_string(), None);
        if previous.is_some() {
            debug!(key, "config value removed");
        }
        Ok(Self::default_for(key).map(str::to_string))
    }

    pub async fn text(&self, key: &str) -> Result<String> {
        Ok(self.get(key).await?.unwrap_or_default())
    }

    /// An ISO-8601 duration setting. Malformed values are discarded.
    pub async fn duration(&self, key: &str) -> Result<Option<Duration>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match parse_iso8601(&raw) {
            Ok(duration) if duration >= Duration::zero() => Ok(Some(duration)),
            _ => {
                warn!(
                    key,
                    value = %raw,
                    "expected an ISO-8601 duration string, discarding the configured value"
                );
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn flag(&self, key: &str) -> Result<bool> {
        let raw = self.get(key).await?.unwrap_or_default();
        match parse_bool(&raw) {
            Some(flag) => Ok(flag),
            None => {
                warn!(key, value = %raw, "invalid boolean setting, using the default");
                let default = self.remove(key).await?;
                Ok(default.as_deref().and_then(parse_bool).unwrap_or(false))
            }
        }
    }

    /// The emoji for a reaction feature, or `None` when the feature is off.
    /// A malformed emoji is removed and the feature stays off for this call.
    pub async fn emoji(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        let raw = raw.trim().to_string();
        if raw.eq_ignore_ascii_case(DISABLE) {
            return Ok(None);
        }
        if is_valid_emoji(&raw) {
            return Ok(Some(raw));
        }
        warn!(key, value = %raw, "not a valid emoji, disabling the reaction");
        self.remove(key).await?;
        Ok(None)
    }

    pub async fn channel(&self, key: &str) -> Result<Option<ChannelId>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match raw.parse() {
            Ok(id) => Ok(Some(id)),
            Err(_) => {
                warn!(key, value = %raw, "invalid channel id, discarding");
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    /// Resolves a channel setting against the platform. A channel that no
    /// longer exists (or has the wrong kind) is pruned from the config.
    pub async fn resolve_channel(
        &self,
        key: &str,
        kind: ChannelKind,
        transport: &dyn ChatTransport,
    ) -> Result<Option<ChannelInfo>> {
        let Some(id) = self.channel(key).await? else {
            return Ok(None);
        };
        match transport.fetch_channel(id).await? {
            Some(info) if info.kind == kind => Ok(Some(info)),
            _ => {
                warn!(key, channel = %id, "configured channel is gone, removing it");
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn cancel_policy(&self) -> Result<CancelPolicy> {
        let raw = self.get(keys::CLOSURE_CANCEL_POLICY).await?.unwrap_or_default();
        match CancelPolicy::parse(&raw) {
            Some(policy) => Ok(policy),
            None => {
                warn!(value = %raw, "unknown closure cancel policy, using the default");
                self.remove(keys::CLOSURE_CANCEL_POLICY).await?;
                Ok(CancelPolicy::All)
            }
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Unicode emoji (any non-ASCII token) or a platform custom emoji
/// (`<:name:id>`, `<a:name:id>`, `name:id`).
fn is_valid_emoji(raw: &str) -> bool {
    if raw.is_empty() || raw.chars().any(char::is_whitespace) {
        return false;
    }
    CUSTOM_EMOJI.is_match(raw) || raw.chars().all(|c| !c.is_ascii())
}
