//! # Block Policy
//!
//! Decides whether a sender may open or feed a thread.
//!
//! Whitelist overrides everything. Account age and membership age are
//! enforced through system blocks that clear themselves once the age is
//! reached; operator blocks may carry an expiry encoded at the end of the
//! reason as `%<RFC 3339 timestamp>%`.
//!
//! # Developer Note
//! Every block-map mutation is awaited before the decision is returned, so a
//! second message from the same sender never sees a stale entry. Creation
//! uses the store's insert-if-absent, which makes the "notify once" rule
//! hold under concurrent evaluation without holding a lock across I/O.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{keys, ConfigCache};
use crate::duration::humanize;
use crate::error::Result;
use crate::models::{Author, BlockEntry, UserId};
use crate::traits::RelayStore;

pub const NEW_ACCOUNT_PREFIX: &str = "System Message: New Account.";
pub const RECENTLY_JOINED_PREFIX: &str = "System Message: Recently Joined.";

static EXPIRY_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%(.+?)%$").expect("expiry pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Account younger than `account_age`.
    NewAccount,
    /// Membership younger than `guild_age`.
    RecentlyJoined,
    /// Imposed by an operator; permanent when `expires_at` is `None`.
    Operator { expires_at: Option<DateTime<Utc>> },
}

impl BlockKind {
    pub fn classify(reason: &str) -> Self {
        if reason.starts_with(NEW_ACCOUNT_PREFIX) {
            return BlockKind::NewAccount;
        }
        if reason.starts_with(RECENTLY_JOINED_PREFIX) {
            return BlockKind::RecentlyJoined;
        }
        let expires_at = EXPIRY_SUFFIX.captures(reason).and_then(|caps| {
            let raw = &caps[1];
            match parse_timestamp(raw) {
                Some(ts) => Some(ts),
                None => {
                    warn!(expiry = raw, "unreadable block expiry, treating block as permanent");
                    None
                }
            }
        });
        BlockKind::Operator { expires_at }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, BlockKind::NewAccount | BlockKind::RecentlyJoined)
    }

    fn prefix(&self) -> &'static str {
        match self {
            BlockKind::NewAccount => NEW_ACCOUNT_PREFIX,
            BlockKind::RecentlyJoined => RECENTLY_JOINED_PREFIX,
            BlockKind::Operator { .. } => "",
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Encodes an operator block reason with an optional expiry.
pub fn operator_reason(reason: &str, expires_at: Option<DateTime<Utc>>) -> String {
    match expires_at {
        Some(ts) => format!("{} %{}%", reason.trim(), ts.to_rfc3339()),
        None => reason.trim().to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept,
    Reject {
        kind: BlockKind,
        reason: String,
        /// Time left until the block lifts, when it is known.
        remaining: Option<Duration>,
        /// Whether the sender should be told (age blocks only, see module docs).
        notify: bool,
    },
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept)
    }
}

pub struct BlockPolicy {
    store: Arc<dyn RelayStore>,
    config: Arc<ConfigCache>,
}

impl BlockPolicy {
    pub fn new(store: Arc<dyn RelayStore>, config: Arc<ConfigCache>) -> Self {
        Self { store, config }
    }

    pub async fn evaluate(&self, sender: &Author, now: DateTime<Utc>) -> Result<Decision> {
        // 1. Whitelist wins and clears whatever was there.
        if self.store.is_whitelisted(sender.id).await? {
            if self.store.remove_block(sender.id).await? {
                debug!(subject = %sender.id, "cleared block on whitelisted user");
            }
            return Ok(Decision::Accept);
        }

        // 2. Age thresholds (zero when unset or malformed).
        let account_age = self.threshold(keys::ACCOUNT_AGE).await?;
        let guild_age = self.threshold(keys::GUILD_AGE).await?;

        let min_account_age = match sender.created_at.checked_add_signed(account_age) {
            Some(ts) => ts,
            None => {
                warn!("account_age overflows, discarding it");
                self.config.remove(keys::ACCOUNT_AGE).await?;
                sender.created_at
            }
        };
        let min_guild_age = match sender.joined_at {
            Some(joined) => match joined.checked_add_signed(guild_age) {
                Some(ts) => ts,
                None => {
                    warn!("guild_age overflows, discarding it");
                    self.config.remove(keys::GUILD_AGE).await?;
                    joined
                }
            },
            None => now,
        };

        let existing = self.store.get_block(sender.id).await?;

        // 3. Age gates.
        if min_account_age > now {
            return self
                .age_block(sender.id, BlockKind::NewAccount, existing, min_account_age - now, now)
                .await;
        }
        if min_guild_age > now {
            return self
                .age_block(sender.id, BlockKind::RecentlyJoined, existing, min_guild_age - now, now)
                .await;
        }

        // 4. Stored blocks.
        let Some(entry) = existing else {
            return Ok(Decision::Accept);
        };
        match BlockKind::classify(&entry.reason) {
            // Ages are met, otherwise a gate above would have caught it.
            kind if kind.is_temporal() => {
                self.store.remove_block(sender.id).await?;
                info!(subject = %sender.id, "age requirement met, block lifted");
                Ok(Decision::Accept)
            }
            BlockKind::Operator {
                expires_at: Some(expires_at),
            } if expires_at <= now => {
                self.store.remove_block(sender.id).await?;
                info!(subject = %sender.id, "block expired");
                Ok(Decision::Accept)
            }
            kind => {
                let remaining = match kind {
                    BlockKind::Operator { expires_at } => expires_at.map(|ts| ts - now),
                    _ => None,
                };
                Ok(Decision::Reject {
                    kind,
                    reason: entry.reason,
                    remaining,
                    notify: false,
                })
            }
        }
    }

    /// Read-only check used where no age data is available (typing events).
    pub async fn is_blocked(&self, subject: UserId, now: DateTime<Utc>) -> Result<bool> {
        if self.store.is_whitelisted(subject).await? {
            return Ok(false);
        }
        Ok(match self.store.get_block(subject).await? {
            Some(entry) => match BlockKind::classify(&entry.reason) {
                BlockKind::Operator {
                    expires_at: Some(expires_at),
                } => expires_at > now,
                _ => true,
            },
            None => false,
        })
    }

    pub async fn block(
        &self,
        subject: UserId,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlockEntry> {
        let entry = BlockEntry {
            subject_id: subject,
            reason: operator_reason(reason, expires_at),
            created_at: Utc::now(),
        };
        self.store.upsert_block(&entry).await?;
        info!(subject = %subject, reason = %entry.reason, "user blocked");
        Ok(entry)
    }

    pub async fn unblock(&self, subject: UserId) -> Result<bool> {
        let removed = self.store.remove_block(subject).await?;
        if removed {
            info!(subject = %subject, "user unblocked");
        }
        Ok(removed)
    }

    pub async fn whitelist(&self, subject: UserId) -> Result<()> {
        self.store.set_whitelisted(subject, true).await?;
        self.store.remove_block(subject).await?;
        info!(subject = %subject, "user whitelisted");
        Ok(())
    }

    pub async fn unwhitelist(&self, subject: UserId) -> Result<()> {
        self.store.set_whitelisted(subject, false).await?;
        info!(subject = %subject, "user removed from whitelist");
        Ok(())
    }

    async fn threshold(&self, key: &str) -> Result<Duration> {
        Ok(self.config.duration(key).await?.unwrap_or_else(Duration::zero))
    }

    async fn age_block(
        &self,
        subject: UserId,
        kind: BlockKind,
        existing: Option<BlockEntry>,
        remaining: Duration,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let reason = format!("{} Required to wait for {}.", kind.prefix(), humanize(remaining));
        let created = self
            .store
            .insert_block_if_absent(&BlockEntry {
                subject_id: subject,
                reason: reason.clone(),
                created_at: now,
            })
            .await?;
        let already_this_kind = existing
            .as_ref()
            .is_some_and(|entry| entry.reason.starts_with(kind.prefix()));

        if created {
            info!(subject = %subject, ?kind, "system block added");
        }
        Ok(Decision::Reject {
            kind,
            reason,
            remaining: Some(remaining),
            notify: created || already_this_kind,
        })
    }
}
